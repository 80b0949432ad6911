//! HLS playlist resolution
//!
//! Turns a URL into either an ordered segment list or a verdict that the
//! URL already points at raw media. Supports:
//! - Master playlists (best variant by resolution, then bandwidth)
//! - Media playlists, including an `#EXT-X-MAP` init segment
//! - Content sniffing when the server's content-type is ambiguous

use std::collections::HashMap;
use std::time::Duration;

use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use tracing::{debug, info, instrument};
use url::Url;

use super::segment::SegmentDescriptor;
use crate::error::{Error, Result};

const PLAYLIST_MAGIC: &[u8] = b"#EXTM3U";

/// Which kind of playlist a body is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaylistKind {
    Master,
    Media,
}

/// A fetched, classified playlist URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaylistReference {
    pub url: Url,
    pub kind: PlaylistKind,
}

/// One alternative quality from a master playlist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariantStream {
    pub bandwidth: u64,
    pub width: u32,
    pub height: u32,
    pub codecs: Option<String>,
    pub url: Url,
}

impl VariantStream {
    fn pixels(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }
}

/// A media playlist resolved down to its segments.
#[derive(Debug, Clone)]
pub struct ResolvedPlaylist {
    /// The master playlist, when the input URL was one.
    pub master: Option<PlaylistReference>,
    /// The variant chosen from `master`.
    pub variant: Option<VariantStream>,
    pub media: PlaylistReference,
    /// Ordered by sequence index, never empty.
    pub segments: Vec<SegmentDescriptor>,
}

/// Outcome of resolving a URL.
#[derive(Debug, Clone)]
pub enum Resolution {
    Segmented(ResolvedPlaylist),
    /// The URL serves media bytes directly; no playlist to parse.
    RawMedia {
        url: Url,
        content_type: Option<String>,
    },
}

enum Fetched {
    Playlist(String),
    Raw(Option<String>),
}

#[derive(Debug, PartialEq, Eq)]
enum ContentClass {
    Playlist,
    Media,
    Unknown,
}

/// Fetches and parses playlists.
#[derive(Debug, Clone)]
pub struct PlaylistResolver {
    client: Client,
    timeout: Option<Duration>,
}

impl PlaylistResolver {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            timeout: None,
        }
    }

    /// Bound each playlist request, body included.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Resolve `url` to segments, following at most one master playlist.
    ///
    /// Errors are not retried here; callers may retry the whole resolution.
    #[instrument(skip(self))]
    pub async fn resolve(&self, url: &str) -> Result<Resolution> {
        let url = Url::parse(url).map_err(|e| Error::Parse(format!("invalid URL {url}: {e}")))?;

        let body = match self.fetch(&url).await? {
            Fetched::Raw(content_type) => {
                info!(content_type = ?content_type, "URL serves raw media");
                return Ok(Resolution::RawMedia { url, content_type });
            }
            Fetched::Playlist(body) => body,
        };

        match classify(&body) {
            Some(PlaylistKind::Media) => {
                let segments = parse_media_playlist(&body, &url)?;
                info!(segments = segments.len(), "Resolved media playlist");
                Ok(Resolution::Segmented(ResolvedPlaylist {
                    master: None,
                    variant: None,
                    media: PlaylistReference {
                        url,
                        kind: PlaylistKind::Media,
                    },
                    segments,
                }))
            }
            Some(PlaylistKind::Master) => self.resolve_master(url, &body).await,
            None => Err(Error::Parse(format!("{url} is not an HLS playlist"))),
        }
    }

    async fn resolve_master(&self, master_url: Url, body: &str) -> Result<Resolution> {
        let variants = parse_master_playlist(body, &master_url)?;
        debug!("Found {} quality variants", variants.len());

        let variant = select_variant(&variants)
            .cloned()
            .ok_or_else(|| Error::Parse(format!("master playlist {master_url} lists no variants")))?;
        info!(
            "Selected variant: {}x{} @ {} bps",
            variant.width, variant.height, variant.bandwidth
        );

        let body = match self.fetch(&variant.url).await? {
            Fetched::Raw(content_type) => {
                return Ok(Resolution::RawMedia {
                    url: variant.url,
                    content_type,
                });
            }
            Fetched::Playlist(body) => body,
        };

        match classify(&body) {
            Some(PlaylistKind::Media) => {
                let segments = parse_media_playlist(&body, &variant.url)?;
                info!(segments = segments.len(), "Resolved media playlist");
                Ok(Resolution::Segmented(ResolvedPlaylist {
                    master: Some(PlaylistReference {
                        url: master_url,
                        kind: PlaylistKind::Master,
                    }),
                    media: PlaylistReference {
                        url: variant.url.clone(),
                        kind: PlaylistKind::Media,
                    },
                    variant: Some(variant),
                    segments,
                }))
            }
            Some(PlaylistKind::Master) => Err(Error::Parse(format!(
                "variant {} is itself a master playlist",
                variant.url
            ))),
            None => Err(Error::Parse(format!(
                "variant {} is not an HLS playlist",
                variant.url
            ))),
        }
    }

    async fn fetch(&self, url: &Url) -> Result<Fetched> {
        let mut request = self.client.get(url.as_str());
        if let Some(timeout) = self.timeout {
            request = request.timeout(timeout);
        }
        let mut resp = request
            .send()
            .await
            .map_err(|e| Error::network(url.as_str(), e))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(Error::HttpStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_ascii_lowercase);
        debug!(status = %status, content_type = ?content_type, "Playlist response");

        match classify_content_type(content_type.as_deref()) {
            ContentClass::Playlist => {
                let text = resp.text().await.map_err(|e| Error::network(url.as_str(), e))?;
                Ok(Fetched::Playlist(text))
            }
            ContentClass::Media => Ok(Fetched::Raw(content_type)),
            ContentClass::Unknown => {
                // Sniff the first chunk; only playlists get buffered whole
                let first = resp
                    .chunk()
                    .await
                    .map_err(|e| Error::network(url.as_str(), e))?
                    .unwrap_or_default();
                if !looks_like_playlist(&first) {
                    return Ok(Fetched::Raw(content_type));
                }

                let mut body = first.to_vec();
                while let Some(chunk) = resp
                    .chunk()
                    .await
                    .map_err(|e| Error::network(url.as_str(), e))?
                {
                    body.extend_from_slice(&chunk);
                }
                Ok(Fetched::Playlist(String::from_utf8_lossy(&body).into_owned()))
            }
        }
    }
}

fn classify_content_type(content_type: Option<&str>) -> ContentClass {
    let Some(ct) = content_type else {
        return ContentClass::Unknown;
    };
    let mime = ct.split(';').next().unwrap_or("").trim();

    if mime.contains("mpegurl") || mime.starts_with("text/") {
        ContentClass::Playlist
    } else if mime.starts_with("video/") || mime.starts_with("audio/") {
        ContentClass::Media
    } else {
        ContentClass::Unknown
    }
}

fn looks_like_playlist(head: &[u8]) -> bool {
    let head = head.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(head);
    let start = head
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(head.len());
    head[start..].starts_with(PLAYLIST_MAGIC)
}

/// Classify a playlist body, or `None` if it is neither kind.
pub fn classify(body: &str) -> Option<PlaylistKind> {
    if body.lines().any(|l| l.trim_start().starts_with("#EXT-X-STREAM-INF")) {
        return Some(PlaylistKind::Master);
    }
    let first = body.trim_start_matches('\u{feff}').lines().map(str::trim).find(|l| !l.is_empty());
    if first.is_some_and(|l| l.starts_with("#EXTM3U")) || body.contains("#EXTINF") {
        Some(PlaylistKind::Media)
    } else {
        None
    }
}

/// Parse the variants of a master playlist, resolving URIs against `base`.
pub fn parse_master_playlist(body: &str, base: &Url) -> Result<Vec<VariantStream>> {
    let mut variants = Vec::new();
    let mut lines = body.lines().map(str::trim).filter(|l| !l.is_empty());

    while let Some(line) = lines.next() {
        let Some(rest) = line.strip_prefix("#EXT-X-STREAM-INF:") else {
            continue;
        };
        let attrs = parse_attributes(rest);
        let bandwidth = attrs
            .get("BANDWIDTH")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let (width, height) = attrs
            .get("RESOLUTION")
            .and_then(|r| r.split_once(['x', 'X']))
            .map_or((0, 0), |(w, h)| {
                (w.trim().parse().unwrap_or(0), h.trim().parse().unwrap_or(0))
            });

        // The URI is the next non-tag line; other tags may sit in between
        let Some(uri) = lines.by_ref().find(|l| !l.starts_with('#')) else {
            return Err(Error::Parse("variant declaration without a URI".to_string()));
        };

        variants.push(VariantStream {
            bandwidth,
            width,
            height,
            codecs: attrs.get("CODECS").cloned(),
            url: resolve_url(base, uri)?,
        });
    }

    Ok(variants)
}

/// Highest resolution wins; bandwidth breaks ties.
pub fn select_variant(variants: &[VariantStream]) -> Option<&VariantStream> {
    variants.iter().max_by_key(|v| (v.pixels(), v.bandwidth))
}

/// Parse a media playlist into ordered segments.
///
/// Every non-empty, non-comment line is a segment, numbered from 1 in
/// encounter order. The first `#EXT-X-MAP` URI becomes segment 0.
pub fn parse_media_playlist(body: &str, base: &Url) -> Result<Vec<SegmentDescriptor>> {
    let mut init = None;
    let mut segments = Vec::new();

    for line in body.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if let Some(rest) = line.strip_prefix("#EXT-X-MAP:") {
            let attrs = parse_attributes(rest);
            match (attrs.get("URI"), &init) {
                (Some(uri), None) => init = Some(SegmentDescriptor::new(0, resolve_url(base, uri)?)),
                (Some(uri), Some(_)) => debug!(uri = %uri, "Ignoring additional init segment"),
                (None, _) => return Err(Error::Parse("#EXT-X-MAP without URI".to_string())),
            }
        } else if !line.starts_with('#') {
            let sequence = segments.len() as u64 + 1;
            segments.push(SegmentDescriptor::new(sequence, resolve_url(base, line)?));
        }
    }

    if segments.is_empty() {
        return Err(Error::Parse(format!("media playlist {base} has no segments")));
    }

    Ok(init.into_iter().chain(segments).collect())
}

/// Parse an attribute list such as `BANDWIDTH=1280000,CODECS="a,b"`.
pub fn parse_attributes(attr_str: &str) -> HashMap<String, String> {
    let mut attrs = HashMap::new();
    let mut chars = attr_str.chars().peekable();

    while chars.peek().is_some() {
        let key: String = chars.by_ref().take_while(|&c| c != '=').collect();
        if key.trim().is_empty() {
            break;
        }

        let value = if chars.peek() == Some(&'"') {
            chars.next();
            let v: String = chars.by_ref().take_while(|&c| c != '"').collect();
            // Skip up to and including the separating comma
            for c in chars.by_ref() {
                if c == ',' {
                    break;
                }
            }
            v
        } else {
            chars.by_ref().take_while(|&c| c != ',').collect()
        };

        attrs.insert(key.trim().to_string(), value.trim().to_string());
    }

    attrs
}

/// Resolve a playlist entry against the playlist URL. Absolute entries
/// pass through unchanged.
pub fn resolve_url(base: &Url, reference: &str) -> Result<Url> {
    base.join(reference)
        .map_err(|e| Error::Parse(format!("cannot resolve {reference} against {base}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const MASTER: &str = "#EXTM3U
#EXT-X-STREAM-INF:BANDWIDTH=800000,RESOLUTION=640x360,CODECS=\"avc1.4d401e,mp4a.40.2\"
360p/index.m3u8
#EXT-X-STREAM-INF:BANDWIDTH=2800000,RESOLUTION=1280x720
720p/index.m3u8
#EXT-X-STREAM-INF:BANDWIDTH=5000000,RESOLUTION=1920x1080
1080p/index.m3u8
";

    fn base() -> Url {
        Url::parse("https://cdn.example.com/videos/abc/master.m3u8?sig=1").unwrap()
    }

    #[test]
    fn test_resolve_url() {
        let base = base();
        assert_eq!(
            resolve_url(&base, "seg1.ts").unwrap().as_str(),
            "https://cdn.example.com/videos/abc/seg1.ts"
        );
        assert_eq!(
            resolve_url(&base, "/root/seg1.ts").unwrap().as_str(),
            "https://cdn.example.com/root/seg1.ts"
        );
        assert_eq!(
            resolve_url(&base, "https://other.example.com/seg1.ts").unwrap().as_str(),
            "https://other.example.com/seg1.ts"
        );
    }

    #[test]
    fn test_parse_attributes() {
        let attrs = parse_attributes("BANDWIDTH=1280000,RESOLUTION=720x480");
        assert_eq!(attrs.get("BANDWIDTH"), Some(&"1280000".to_string()));
        assert_eq!(attrs.get("RESOLUTION"), Some(&"720x480".to_string()));

        let attrs = parse_attributes("CODECS=\"avc1.4d401f,mp4a.40.2\",BANDWIDTH=2000000");
        assert_eq!(attrs.get("CODECS"), Some(&"avc1.4d401f,mp4a.40.2".to_string()));
        assert_eq!(attrs.get("BANDWIDTH"), Some(&"2000000".to_string()));
    }

    #[test]
    fn test_classify() {
        assert_eq!(classify(MASTER), Some(PlaylistKind::Master));
        assert_eq!(
            classify("#EXTM3U\n#EXTINF:4.0,\nseg1.ts\n"),
            Some(PlaylistKind::Media)
        );
        assert_eq!(classify("<html><body>nope</body></html>"), None);
    }

    #[test]
    fn test_master_selects_1080p() {
        let variants = parse_master_playlist(MASTER, &base()).unwrap();
        assert_eq!(variants.len(), 3);
        assert_eq!(variants[0].codecs.as_deref(), Some("avc1.4d401e,mp4a.40.2"));

        let best = select_variant(&variants).unwrap();
        assert_eq!(best.height, 1080);
        assert_eq!(
            best.url.as_str(),
            "https://cdn.example.com/videos/abc/1080p/index.m3u8"
        );
    }

    #[test]
    fn test_bandwidth_breaks_resolution_tie() {
        let body = "#EXTM3U
#EXT-X-STREAM-INF:BANDWIDTH=3000000,RESOLUTION=1280x720
a.m3u8
#EXT-X-STREAM-INF:BANDWIDTH=4500000,RESOLUTION=1280x720
b.m3u8
#EXT-X-STREAM-INF:BANDWIDTH=9000000
c.m3u8
";
        let variants = parse_master_playlist(body, &base()).unwrap();
        let best = select_variant(&variants).unwrap();
        assert!(best.url.as_str().ends_with("/b.m3u8"));
    }

    #[test]
    fn test_media_playlist_order_and_count() {
        let body = "#EXTM3U
#EXT-X-TARGETDURATION:4
#EXTINF:4.0,
s/a.ts

#EXTINF:4.0,
https://edge.example.com/b.ts
# a comment
#EXTINF:2.5,
/abs/c.ts
#EXT-X-ENDLIST
";
        let segments = parse_media_playlist(body, &base()).unwrap();
        assert_eq!(segments.len(), 3);
        let seqs: Vec<u64> = segments.iter().map(|s| s.sequence).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert_eq!(segments[0].url.as_str(), "https://cdn.example.com/videos/abc/s/a.ts");
        assert_eq!(segments[1].url.as_str(), "https://edge.example.com/b.ts");
        assert_eq!(segments[2].url.as_str(), "https://cdn.example.com/abs/c.ts");
    }

    #[test]
    fn test_init_segment_prepended() {
        let body = "#EXTM3U
#EXT-X-MAP:URI=\"init.mp4\"
#EXTINF:4.0,
seg1.m4s
#EXTINF:4.0,
seg2.m4s
";
        let segments = parse_media_playlist(body, &base()).unwrap();
        assert_eq!(segments.len(), 3);
        assert_eq!(segments[0].sequence, 0);
        assert_eq!(segments[0].file_name, "seg-0.mp4");
        assert_eq!(segments[2].file_name, "seg-2.m4s");
    }

    #[test]
    fn test_empty_media_playlist_is_parse_error() {
        let err = parse_media_playlist("#EXTM3U\n#EXT-X-ENDLIST\n", &base()).unwrap_err();
        assert!(matches!(err, Error::Parse(_)));
    }

    #[test]
    fn test_content_classes() {
        assert_eq!(
            classify_content_type(Some("application/vnd.apple.mpegurl")),
            ContentClass::Playlist
        );
        assert_eq!(
            classify_content_type(Some("audio/x-mpegurl; charset=utf-8")),
            ContentClass::Playlist
        );
        assert_eq!(classify_content_type(Some("video/mp4")), ContentClass::Media);
        assert_eq!(
            classify_content_type(Some("application/octet-stream")),
            ContentClass::Unknown
        );
        assert_eq!(classify_content_type(None), ContentClass::Unknown);
    }

    #[test]
    fn test_sniffing() {
        assert!(looks_like_playlist(b"#EXTM3U\n#EXTINF"));
        assert!(looks_like_playlist(b"\xEF\xBB\xBF\n#EXTM3U"));
        assert!(!looks_like_playlist(b"\x00\x00\x00\x18ftypmp42"));
    }

    #[tokio::test]
    async fn test_resolve_master_follows_best_variant() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v/master.m3u8"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "application/vnd.apple.mpegurl")
                    .set_body_string(MASTER),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v/1080p/index.m3u8"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "application/octet-stream")
                    .set_body_string("#EXTM3U\n#EXTINF:4,\nseg1.ts\n#EXTINF:4,\nseg2.ts\n"),
            )
            .expect(1)
            .mount(&server)
            .await;

        let resolver = PlaylistResolver::new(Client::new());
        let resolution = resolver
            .resolve(&format!("{}/v/master.m3u8", server.uri()))
            .await
            .unwrap();

        let Resolution::Segmented(playlist) = resolution else {
            panic!("expected a segmented resolution");
        };
        assert_eq!(playlist.variant.as_ref().map(|v| v.height), Some(1080));
        assert_eq!(playlist.master.as_ref().map(|m| m.kind), Some(PlaylistKind::Master));
        assert_eq!(playlist.segments.len(), 2);
        assert!(playlist.segments[0].url.path().ends_with("/v/1080p/seg1.ts"));
    }

    #[tokio::test]
    async fn test_nested_master_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string(MASTER))
            .mount(&server)
            .await;

        let resolver = PlaylistResolver::new(Client::new());
        let err = resolver
            .resolve(&format!("{}/master.m3u8", server.uri()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Parse(_)));
    }

    #[tokio::test]
    async fn test_raw_media_short_circuit() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "video/mp4")
                    .set_body_bytes(vec![0u8; 64]),
            )
            .mount(&server)
            .await;

        let resolver = PlaylistResolver::new(Client::new());
        let resolution = resolver
            .resolve(&format!("{}/clip.mp4", server.uri()))
            .await
            .unwrap();
        assert!(matches!(resolution, Resolution::RawMedia { .. }));
    }

    #[tokio::test]
    async fn test_http_status_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let resolver = PlaylistResolver::new(Client::new());
        let err = resolver
            .resolve(&format!("{}/index.m3u8", server.uri()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::HttpStatus { status: 403, .. }));
    }

    #[tokio::test]
    async fn test_slow_playlist_hits_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("#EXTM3U\n#EXTINF:4,\nseg1.ts\n")
                    .set_delay(Duration::from_secs(2)),
            )
            .mount(&server)
            .await;

        let resolver = PlaylistResolver::new(Client::new()).with_timeout(Duration::from_millis(200));
        let err = resolver
            .resolve(&format!("{}/index.m3u8", server.uri()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Network { .. }), "got {err:?}");
    }
}
