//! Filename extraction, sanitization, and path resolution for downloads.
//!
//! The final filename for a job is chosen in priority order:
//! 1. `Content-Disposition` header from the transfer probe
//! 2. The filename suggested by the source plugin
//! 3. The last segment of the URL path
//! 4. A `download_<timestamp>.bin` fallback
//!
//! Every candidate passes through [`sanitize_filename`] and
//! [`resolve_unique_path`] before touching the disk.

use std::path::{Component, Path, PathBuf};

use url::Url;

/// Extracts a filename from the last segment of a URL path.
///
/// Query strings and fragments are ignored. The segment is percent-decoded
/// and sanitized; returns `None` when the URL does not parse, the path is
/// empty, or nothing usable survives sanitization.
#[must_use]
pub fn filename_from_url_path(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let last = parsed
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|segment| !segment.is_empty())?;

    let decoded = urlencoding::decode(last)
        .map(std::borrow::Cow::into_owned)
        .unwrap_or_else(|_| last.to_string());

    let sanitized = sanitize_filename(&decoded);
    if sanitized.trim_matches('_').is_empty() {
        return None;
    }
    Some(sanitized)
}

/// Fallback filename derived from the URL path, or `download_<timestamp>.bin`.
#[must_use]
pub fn fallback_filename_from_url(url: &str) -> String {
    filename_from_url_path(url).unwrap_or_else(|| format!("download_{}.bin", unix_timestamp()))
}

/// Parses a Content-Disposition header to extract a filename.
///
/// Handles:
/// - `attachment; filename="example.zip"`
/// - `attachment; filename=example.zip`
/// - `attachment; filename*=UTF-8''example.zip` (RFC 5987)
///
/// The RFC 5987 form wins when both are present, since it carries the
/// non-ASCII name the plain parameter cannot.
#[must_use]
pub fn parse_content_disposition(header: &str) -> Option<String> {
    if let Some(name) = parse_rfc5987_filename(header) {
        return Some(name);
    }

    let (_, after) = header.split_once("filename=")?;
    let value = after.trim();
    if let Some(quoted) = value.strip_prefix('"') {
        let (name, _) = quoted.split_once('"')?;
        return Some(name.to_string());
    }
    let bare = value.split(';').next().unwrap_or(value).trim();
    if bare.is_empty() {
        None
    } else {
        Some(bare.to_string())
    }
}

/// `filename*=charset'language'percent-encoded-name` per RFC 5987.
fn parse_rfc5987_filename(header: &str) -> Option<String> {
    let (_, after) = header.split_once("filename*=")?;
    let (_, encoded) = after.trim().split_once("''")?;
    let name = encoded.split(';').next().unwrap_or(encoded).trim();
    urlencoding::decode(name).ok().map(std::borrow::Cow::into_owned)
}

/// Sanitizes a filename for filesystem safety.
///
/// Replaces characters that are invalid on common filesystems:
/// / \ : * ? " < > |
#[must_use]
pub fn sanitize_filename(name: &str) -> String {
    let sanitized: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();

    if sanitized.is_empty() {
        return "_".to_string();
    }

    if is_safe_filename_segment(&sanitized) {
        sanitized
    } else {
        sanitized
            .chars()
            .map(|c| if c == '.' { '_' } else { c })
            .collect()
    }
}

/// Resolves a unique file path, adding a numeric suffix if the file exists.
///
/// Example: `file.zip`, then `file_1.zip`, `file_2.zip`, ...
#[must_use]
pub fn resolve_unique_path(dir: &Path, filename: &str) -> PathBuf {
    // Sanitization leaves no separators, so only an all-underscore husk
    // still needs the generic fallback name
    let sanitized = sanitize_filename(filename);
    let filename = if sanitized.trim_matches('_').is_empty() {
        "download.bin".to_string()
    } else {
        sanitized
    };

    let base_path = dir.join(&filename);
    if !base_path.exists() {
        return base_path;
    }

    let (stem, ext) = match filename.rfind('.') {
        Some(pos) => filename.split_at(pos),
        None => (filename.as_str(), ""),
    };
    for i in 1..1000 {
        let candidate = dir.join(format!("{stem}_{i}{ext}"));
        if !candidate.exists() {
            return candidate;
        }
    }
    dir.join(format!("{stem}_{}{ext}", unix_timestamp()))
}

fn is_safe_filename_segment(name: &str) -> bool {
    !Path::new(name).components().any(|component| {
        matches!(
            component,
            Component::CurDir | Component::ParentDir | Component::RootDir | Component::Prefix(_)
        )
    })
}

fn unix_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
