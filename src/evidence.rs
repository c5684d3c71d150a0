//! Content-addressed persistence of fetched artifacts.
//!
//! Layout: `{root}/{company}/{evidence_type}/{utc}_{hash12}.{ext}`. Every
//! stored artifact is paired with an `evidence` row carrying hash, path,
//! source URL, and metadata, so downstream facts always trace back to bytes
//! on disk.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::Utc;
use serde_json::{Map, Value, json};
use sha2::{Digest, Sha256};

use crate::error::Result;

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);
const TEMP_PREFIX: &str = ".dossier.tmp.";

pub struct StoredArtifact {
    pub content_hash: String,
    pub path: PathBuf,
    pub meta: Value,
}

pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

fn suffix_for(evidence_type: &str, url: &str) -> &'static str {
    let low = url.to_lowercase();
    if low.ends_with(".pdf") {
        "pdf"
    } else if low.ends_with(".png") {
        "png"
    } else if low.ends_with(".jpg") || low.ends_with(".jpeg") {
        "jpg"
    } else if low.ends_with(".html") || low.ends_with(".htm") || evidence_type.contains("html") {
        "html"
    } else if evidence_type.contains("json") {
        "json"
    } else {
        "txt"
    }
}

/// Write raw bytes under the evidence root and return hash, path, and the
/// metadata object every evidence row carries.
pub fn store_bytes(
    root: &Path,
    company_id: &str,
    evidence_type: &str,
    source_url: &str,
    data: &[u8],
    extra_meta: Option<Map<String, Value>>,
) -> Result<StoredArtifact> {
    let hash = sha256_hex(data);
    let suffix = suffix_for(evidence_type, source_url);
    let dir = root.join(company_id).join(evidence_type);
    let stamp = Utc::now().format("%Y%m%dT%H%M%SZ");
    let path = dir.join(format!("{stamp}_{}.{suffix}", &hash[..12]));

    atomic_write(&path, data)?;

    let mut meta = extra_meta.unwrap_or_default();
    meta.insert("sha256".to_string(), json!(hash));
    meta.insert("bytes".to_string(), json!(data.len()));
    meta.insert("stored_path".to_string(), json!(path.display().to_string()));

    Ok(StoredArtifact {
        content_hash: hash,
        path,
        meta: Value::Object(meta),
    })
}

pub fn store_json(
    root: &Path,
    company_id: &str,
    evidence_type: &str,
    source_url: &str,
    value: &Value,
    extra_meta: Option<Map<String, Value>>,
) -> Result<StoredArtifact> {
    let data = serde_json::to_vec_pretty(value)?;
    store_bytes(root, company_id, evidence_type, source_url, &data, extra_meta)
}

fn atomic_write(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let parent = path.parent().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("path `{}` has no parent directory", path.display()),
        )
    })?;
    fs::create_dir_all(parent)?;

    let tmp_path = temp_path_in_parent(parent, path)?;
    let mut tmp_file = create_temp_file(&tmp_path)?;

    let write_result = (|| -> io::Result<()> {
        tmp_file.write_all(bytes)?;
        tmp_file.flush()?;
        tmp_file.sync_all()?;
        drop(tmp_file);

        rename_overwrite(&tmp_path, path)?;
        sync_parent_dir(parent)?;
        Ok(())
    })();

    if write_result.is_err() {
        let _ = fs::remove_file(&tmp_path);
    }
    write_result
}

fn create_temp_file(path: &Path) -> io::Result<File> {
    OpenOptions::new().create_new(true).write(true).open(path)
}

fn rename_overwrite(from: &Path, to: &Path) -> io::Result<()> {
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(err) => {
            if to.exists() {
                fs::remove_file(to)?;
                fs::rename(from, to)
            } else {
                Err(err)
            }
        }
    }
}

#[cfg(unix)]
fn sync_parent_dir(parent: &Path) -> io::Result<()> {
    File::open(parent)?.sync_all()
}

#[cfg(not(unix))]
fn sync_parent_dir(_parent: &Path) -> io::Result<()> {
    Ok(())
}

fn temp_path_in_parent(parent: &Path, final_path: &Path) -> io::Result<PathBuf> {
    let file_name = final_path
        .file_name()
        .and_then(|value| value.to_str())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "invalid target filename"))?;
    let epoch_nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|err| io::Error::other(err.to_string()))?
        .as_nanos();
    let counter = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    let tmp_name = format!(
        "{TEMP_PREFIX}{file_name}.{epoch_nanos}.{}.{}",
        std::process::id(),
        counter
    );
    Ok(parent.join(tmp_name))
}
