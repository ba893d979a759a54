//! Resolves the final on-disk filename for a download.
//!
//! Precedence, per probe result:
//! 1. `Content-Disposition: filename*=UTF-8''...` (RFC 5987)
//! 2. `Content-Disposition: filename=...`
//! 3. The last non-empty segment of the URL path
//! 4. A generic name plus an extension inferred from `Content-Type`
//!
//! The candidate is then sanitized and, if it collides with an existing
//! file in the destination directory, suffixed with ` (n)` until unique.

use std::path::{Path, PathBuf};

const NAME_MAX: usize = 255;

/// Everything a probe can tell us about the remote resource's identity.
#[derive(Debug, Default, Clone)]
pub struct FilenameHints<'a> {
    pub content_disposition: Option<&'a str>,
    pub content_type: Option<&'a str>,
}

/// Resolve the final, sanitized, collision-free filename for `url`
/// downloading into `destination_dir`.
pub fn resolve(url: &str, destination_dir: &Path, hints: &FilenameHints<'_>) -> String {
    let candidate = hints
        .content_disposition
        .and_then(parse_content_disposition_filename)
        .or_else(|| filename_from_url_path(url))
        .unwrap_or_else(|| "download".to_string());

    let candidate = ensure_extension(candidate, hints.content_type);
    let sanitized = sanitize(&candidate);
    dedupe_against(destination_dir, &sanitized)
}

/// If the candidate has no extension and the content type maps to a
/// known one, append it.
fn ensure_extension(candidate: String, content_type: Option<&str>) -> String {
    if Path::new(&candidate).extension().is_some() {
        return candidate;
    }
    let Some(ext) = content_type.and_then(extension_for_mime) else {
        return candidate;
    };
    format!("{candidate}.{ext}")
}

fn extension_for_mime(content_type: &str) -> Option<&'static str> {
    let mime = content_type.split(';').next().unwrap_or("").trim();
    Some(match mime {
        "application/zip" => "zip",
        "application/gzip" | "application/x-gzip" => "gz",
        "application/x-tar" => "tar",
        "application/pdf" => "pdf",
        "application/json" => "json",
        "application/octet-stream" => return None,
        "text/plain" => "txt",
        "text/html" => "html",
        "image/png" => "png",
        "image/jpeg" => "jpg",
        _ => return None,
    })
}

/// Suffix `name` with ` (1)`, ` (2)`, ... until it does not already
/// exist in `dir`. The check-then-use window is small; the fetcher
/// reserves the chosen name by creating the temp file immediately after.
fn dedupe_against(dir: &Path, name: &str) -> String {
    if !dir.join(name).exists() {
        return name.to_string();
    }

    let path = Path::new(name);
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| name.to_string());
    let ext = path.extension().map(|e| e.to_string_lossy().to_string());

    for n in 1.. {
        let candidate = match &ext {
            Some(ext) => format!("{stem} ({n}).{ext}"),
            None => format!("{stem} ({n})"),
        };
        if !dir.join(&candidate).exists() {
            return candidate;
        }
    }
    unreachable!("dedupe_against: exhausted an unbounded range")
}

/// Extract a filename from a `Content-Disposition` header value.
/// Supports `filename="..."`, `filename=...`, and RFC 5987
/// `filename*=UTF-8''...`, preferring `filename*` when both are present.
pub fn parse_content_disposition_filename(header_value: &str) -> Option<String> {
    let mut from_token: Option<String> = None;

    for param in header_value.split(';') {
        let Some((name, value)) = param.trim().split_once('=') else {
            continue;
        };
        let name = name.trim().to_ascii_lowercase();
        let value = value.trim();

        if name == "filename*" {
            if let Some(rest) = value
                .strip_prefix("utf-8''")
                .or_else(|| value.strip_prefix("UTF-8''"))
            {
                let decoded = percent_decode(rest);
                let decoded = unescape_quoted(&decoded);
                if !decoded.is_empty() {
                    return Some(decoded);
                }
            }
        } else if name == "filename" {
            let unquoted = if value.starts_with('"') && value.ends_with('"') && value.len() >= 2 {
                unescape_quoted(&value[1..value.len() - 1])
            } else {
                value.to_string()
            };
            if !unquoted.is_empty() {
                from_token = Some(unquoted);
            }
        }
    }

    from_token
}

fn unescape_quoted(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(&next) = chars.peek() {
                if next == '"' || next == '\\' {
                    out.push(chars.next().unwrap());
                    continue;
                }
            }
        }
        out.push(c);
    }
    out
}

fn percent_decode(input: &str) -> String {
    let mut out = Vec::with_capacity(input.len());
    let mut bytes = input.as_bytes().iter().copied();
    while let Some(b) = bytes.next() {
        if b == b'%' {
            let h = bytes.next().and_then(hex_digit);
            let l = bytes.next().and_then(hex_digit);
            match (h, l) {
                (Some(hi), Some(lo)) => out.push(hi << 4 | lo),
                _ => out.push(b'%'),
            }
        } else {
            out.push(b);
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_digit(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// The last non-empty path segment of a URL, or `None` for a root path.
fn filename_from_url_path(url: &str) -> Option<String> {
    let parsed = url::Url::parse(url).ok()?;
    let segment = parsed.path().split('/').filter(|s| !s.is_empty()).last()?;
    if segment == "." || segment == ".." {
        return None;
    }
    Some(segment.to_string())
}

/// Strip control characters and path separators, collapse runs of
/// underscores, trim trailing dots/spaces, cap at 255 bytes.
fn sanitize(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut prev_underscore = false;

    for c in name.chars() {
        let replacement = if c == '\0' || c == '/' || c == '\\' || c.is_control() {
            '_'
        } else {
            c
        };
        if replacement == '_' {
            if !prev_underscore {
                out.push('_');
            }
            prev_underscore = true;
        } else {
            out.push(replacement);
            prev_underscore = false;
        }
    }

    let trimmed = out.trim_matches(|c: char| c == ' ' || c == '.' || c == '_');
    if trimmed.is_empty() {
        return "download".to_string();
    }

    if trimmed.len() > NAME_MAX {
        let mut take = NAME_MAX;
        while take > 0 && !trimmed.is_char_boundary(take) {
            take -= 1;
        }
        trimmed[..take].to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_disposition_star_takes_precedence() {
        let r = resolve(
            "https://example.com/ignored",
            Path::new("/tmp/zdmr-test-nonexistent"),
            &FilenameHints {
                content_disposition: Some(
                    "attachment; filename=\"fallback.bin\"; filename*=UTF-8''real%20name.dat",
                ),
                content_type: None,
            },
        );
        assert_eq!(r, "real name.dat");
    }

    #[test]
    fn falls_back_to_url_path() {
        let r = resolve(
            "https://example.com/a/b/file.iso?token=x",
            Path::new("/tmp/zdmr-test-nonexistent"),
            &FilenameHints::default(),
        );
        assert_eq!(r, "file.iso");
    }

    #[test]
    fn infers_extension_from_content_type_when_missing() {
        let r = resolve(
            "https://example.com/download",
            Path::new("/tmp/zdmr-test-nonexistent"),
            &FilenameHints {
                content_disposition: None,
                content_type: Some("application/zip"),
            },
        );
        assert_eq!(r, "download.zip");
    }

    #[test]
    fn sanitizes_path_separators_and_control_chars() {
        assert_eq!(sanitize("a/b\\c.txt"), "a_b_c.txt");
        assert_eq!(sanitize("file\0name.txt"), "file_name.txt");
        assert_eq!(sanitize("  ..file.txt..  "), "file.txt");
    }

    #[test]
    fn dedupe_suffixes_on_collision() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("report.pdf"), b"x").unwrap();
        std::fs::write(dir.path().join("report (1).pdf"), b"x").unwrap();

        assert_eq!(dedupe_against(dir.path(), "report.pdf"), "report (2).pdf");
        assert_eq!(dedupe_against(dir.path(), "other.pdf"), "other.pdf");
    }
}
