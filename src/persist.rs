//! On-disk JSON helpers
//!
//! Live files are only ever replaced through write-temp-then-rename, so a
//! crash mid-write leaves the previous version intact. Immutable records
//! (registry snapshots, promotion evidence) are written create-new.

use crate::error::Result;
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Replace `path` with the pretty JSON of `value`
pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    ensure_parent(path)?;
    let tmp = tmp_path(path);
    let payload = serde_json::to_vec_pretty(value)?;

    {
        let mut file = File::create(&tmp)?;
        file.write_all(&payload)?;
        file.sync_all()?;
    }

    if let Err(err) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(err.into());
    }
    debug!("Replaced {}", path.display());
    Ok(())
}

/// Write `value` to a file that must not already exist
pub fn write_json_new<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    ensure_parent(path)?;
    let file = OpenOptions::new().write(true).create_new(true).open(path)?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, value)?;
    writer.flush()?;
    writer.get_ref().sync_all()?;
    Ok(())
}

/// Append one compact JSON line
pub fn append_jsonl<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    ensure_parent(path)?;
    let mut line = serde_json::to_vec(value)?;
    line.push(b'\n');
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(&line)?;
    Ok(())
}

/// Move a corrupt file aside as `<name>.corrupt-<unix_ts>`
pub fn backup_corrupt(path: &Path) -> Result<PathBuf> {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(format!(".corrupt-{}", chrono::Utc::now().timestamp()));
    let backup = path.with_file_name(name);
    fs::rename(path, &backup)?;
    warn!(
        "Backed up corrupt file {} to {}",
        path.display(),
        backup.display()
    );
    Ok(backup)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_atomic_write_replaces_and_leaves_no_tmp() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested").join("state.json");

        write_json_atomic(&path, &json!({"v": 1})).unwrap();
        write_json_atomic(&path, &json!({"v": 2})).unwrap();

        let value: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["v"], 2);
        assert!(!tmp_path(&path).exists());
    }

    #[test]
    fn test_write_new_refuses_overwrite() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("evidence.json");

        write_json_new(&path, &json!({"decision": "promoted"})).unwrap();
        assert!(write_json_new(&path, &json!({"decision": "tampered"})).is_err());
    }

    #[test]
    fn test_append_jsonl() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("log.jsonl");

        append_jsonl(&path, &json!({"n": 1})).unwrap();
        append_jsonl(&path, &json!({"n": 2})).unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 2);
    }

    #[test]
    fn test_backup_corrupt() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("registry.json");
        fs::write(&path, "{garbage").unwrap();

        let backup = backup_corrupt(&path).unwrap();
        assert!(!path.exists());
        assert!(backup.exists());
        assert!(backup
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("registry.json.corrupt-"));
    }
}
