use anyhow::Result;

use hlsgrab::stream::Resolution;
use hlsgrab::{Config, Downloader};

pub async fn cmd_info(config: Config, url: &str) -> Result<()> {
    let downloader = Downloader::new(config)?;

    eprintln!("📡 Resolving: {url}");
    match downloader.resolve(url).await? {
        Resolution::RawMedia { url, content_type } => {
            println!("Type: raw media");
            println!("URL: {url}");
            println!(
                "Content-Type: {}",
                content_type.as_deref().unwrap_or("(none)")
            );
        }
        Resolution::Segmented(playlist) => {
            match (&playlist.master, &playlist.variant) {
                (Some(master), Some(variant)) => {
                    println!("Type: master playlist");
                    println!("Master: {}", master.url);
                    println!(
                        "Variant: {}x{} @ {} kbps",
                        variant.width,
                        variant.height,
                        variant.bandwidth / 1000
                    );
                    if let Some(ref codecs) = variant.codecs {
                        println!("Codecs: {codecs}");
                    }
                }
                _ => println!("Type: media playlist"),
            }
            println!("Media: {}", playlist.media.url);

            let init = playlist.segments.iter().any(|s| s.is_init());
            let count = playlist.segments.len() - usize::from(init);
            println!(
                "Segments: {count}{}",
                if init { " (+ init segment)" } else { "" }
            );
        }
    }

    Ok(())
}
