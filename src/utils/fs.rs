//! Path filtering and file fingerprinting.

use anyhow::{Context, Result};
use std::path::Path;
use std::time::UNIX_EPOCH;

use crate::storage::fragment::Fingerprint;
use crate::utils::config::CONTENT_HASH_THRESHOLD;

/// Normalize a path for storage keys: forward slashes on every platform.
pub fn path_to_db_string(path: &Path) -> String {
    let s = path.to_string_lossy();
    if s.contains('\\') {
        s.replace('\\', "/")
    } else {
        s.into_owned()
    }
}

/// Simple glob pattern matching (supports * and ?)
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let mut pattern_chars = pattern.chars().peekable();
    let mut text_chars = text.chars().peekable();

    while let Some(&p) = pattern_chars.peek() {
        match p {
            '*' => {
                pattern_chars.next();
                if pattern_chars.peek().is_none() {
                    return true; // trailing * matches everything
                }
                while text_chars.peek().is_some() {
                    if glob_match(
                        &pattern_chars.clone().collect::<String>(),
                        &text_chars.clone().collect::<String>(),
                    ) {
                        return true;
                    }
                    text_chars.next();
                }
                return false;
            }
            '?' => {
                pattern_chars.next();
                if text_chars.next().is_none() {
                    return false;
                }
            }
            _ => {
                pattern_chars.next();
                if text_chars.next() != Some(p) {
                    return false;
                }
            }
        }
    }

    text_chars.peek().is_none()
}

/// Returns true if `path` is a source file a group should pick up: extension
/// is in `extensions` (empty list = any) and neither the file name nor the
/// full path matches an exclude pattern.
pub fn should_include_source_file(path: &Path, extensions: &[String], exclude: &[String]) -> bool {
    if !extensions.is_empty() {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();
        if !extensions.iter().any(|e| e.eq_ignore_ascii_case(ext)) {
            return false;
        }
    }
    if exclude.is_empty() {
        return true;
    }
    let name = match path.file_name().and_then(|n| n.to_str()) {
        Some(n) => n,
        None => return true,
    };
    let path_str = path.to_str().unwrap_or("");
    for pattern in exclude {
        if glob_match(pattern, name) || glob_match(pattern, path_str) {
            return false;
        }
    }
    true
}

/// Compute the change-detection fingerprint for a file: mtime (ns) + size,
/// plus a blake3 content hash for files at or above the hash threshold.
pub fn fingerprint_file(path: &Path) -> Result<Fingerprint> {
    let meta = std::fs::metadata(path)
        .with_context(|| format!("read metadata for {}", path.display()))?;
    let mtime_ns = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0);
    let size = meta.len();
    let content_hash = if meta.is_file() && size >= CONTENT_HASH_THRESHOLD {
        Some(hash_file(path)?)
    } else {
        None
    };
    Ok(Fingerprint {
        mtime_ns,
        size,
        content_hash,
    })
}

/// Blake3 hash of a file's content, streamed.
pub fn hash_file(path: &Path) -> Result<[u8; 32]> {
    let mut hasher = blake3::Hasher::new();
    let mut file =
        std::fs::File::open(path).with_context(|| format!("open {} for hashing", path.display()))?;
    std::io::copy(&mut file, &mut hasher)
        .with_context(|| format!("hash {}", path.display()))?;
    Ok(*hasher.finalize().as_bytes())
}
