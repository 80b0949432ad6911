//! Output file-name sanitization.

/// Name used when a title sanitizes down to nothing.
pub const UNTITLED: &str = "untitled_video";

/// Make a title safe to use as a file stem on every major filesystem.
///
/// Reserved Windows characters are replaced, control characters dropped,
/// and trailing dots/spaces trimmed.
pub fn sanitize_filename(title: &str) -> String {
    let mut out = String::with_capacity(title.len());
    for c in title.chars() {
        match c {
            '<' => out.push_str("_lt_"),
            '>' => out.push_str("_gt_"),
            ':' | '"' | '/' | '\\' | '|' | '?' | '*' => out.push('_'),
            c if u32::from(c) < 0x20 => {}
            c => out.push(c),
        }
    }

    let trimmed = out.trim().trim_end_matches(['.', ' ']);
    if trimmed.is_empty() {
        UNTITLED.to_string()
    } else {
        trimmed.to_string()
    }
}
