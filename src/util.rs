use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};
use unicode_normalization::UnicodeNormalization;
use unicode_normalization::char::is_combining_mark;

use crate::error::Result;

pub fn now_utc_string() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub fn utc_compact_string(ts: DateTime<Utc>) -> String {
    ts.format("%Y%m%dT%H%M%SZ").to_string()
}

pub fn ensure_directory(path: &Path) -> Result<()> {
    fs::create_dir_all(path)?;
    Ok(())
}

pub fn normalize_whitespace(input: &str) -> String {
    input.split_whitespace().collect::<Vec<&str>>().join(" ")
}

/// Lower-cases and strips combining marks so that "Padrón" and "padron" compare equal.
pub fn fold_text(input: &str) -> String {
    input
        .nfd()
        .filter(|character| !is_combining_mark(*character))
        .flat_map(char::to_lowercase)
        .collect()
}

/// Content hash used by the manifest; whitespace runs are collapsed first so that
/// re-flowed text does not trigger a re-embed.
pub fn sha256_text(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize_whitespace(text).as_bytes());
    format!("{:x}", hasher.finalize())
}

pub fn truncate_chars(input: &str, max_chars: usize) -> String {
    let mut chars = input.char_indices();
    match chars.nth(max_chars) {
        Some((byte_index, _)) => format!("{}...", &input[..byte_index]),
        None => input.to_string(),
    }
}

pub fn write_json_pretty<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_directory(parent)?;
    }

    let data = serde_json::to_vec_pretty(value)?;
    let mut file = File::create(path)?;
    file.write_all(&data)?;
    file.write_all(b"\n")?;

    Ok(())
}

/// Writes next to the target and renames into place, so readers only ever observe the old
/// or the new file.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let data = serde_json::to_vec_pretty(value)?;
    write_bytes_atomic(path, &data)
}

pub fn write_bytes_atomic(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_directory(parent)?;
    }

    let tmp_path = temp_sibling(path);
    {
        let mut file = File::create(&tmp_path)?;
        file.write_all(data)?;
        file.sync_all()?;
    }
    fs::rename(&tmp_path, path)?;

    Ok(())
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let raw = match fs::read(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };

    Ok(Some(serde_json::from_slice(&raw)?))
}

pub fn remove_dir_if_exists(path: &Path) -> Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

fn temp_sibling(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|value| value.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::{fold_text, read_json, sha256_text, truncate_chars, write_json_atomic};

    #[test]
    fn content_hash_ignores_whitespace_layout() {
        assert_eq!(
            sha256_text("licencia  de\nobra"),
            sha256_text(" licencia de obra ")
        );
        assert_ne!(sha256_text("licencia de obra"), sha256_text("licencia de obras"));
    }

    #[test]
    fn fold_text_strips_accents_and_case() {
        assert_eq!(fold_text("Padrón MUNICIPAL"), "padron municipal");
        assert_eq!(fold_text("Señal"), "senal");
    }

    #[test]
    fn truncate_chars_respects_char_boundaries() {
        assert_eq!(truncate_chars("añoñoño", 3), "año...");
        assert_eq!(truncate_chars("corto", 10), "corto");
    }

    #[test]
    fn atomic_json_write_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("value.json");
        write_json_atomic(&path, &serde_json::json!({"a": 1})).expect("write");

        let value: Option<serde_json::Value> = read_json(&path).expect("read");
        assert_eq!(value, Some(serde_json::json!({"a": 1})));
        assert!(!path.with_file_name("value.json.tmp").exists());

        let missing: Option<serde_json::Value> =
            read_json(&dir.path().join("missing.json")).expect("read missing");
        assert!(missing.is_none());
    }
}
