//! Atomic single-file JSON persistence: write `target.tmp`, restrict it to
//! the owner, rename over `target`. Loads recover from a `.bak` copy when one
//! is kept, and always clean up orphaned `.tmp` files from a prior crash.

use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

use companion_core::paths::set_owner_only_file;

use crate::StoreError;

pub fn tmp_path(path: &Path) -> PathBuf {
    sibling(path, ".tmp")
}

pub fn bak_path(path: &Path) -> PathBuf {
    sibling(path, ".bak")
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

/// Pretty-printed JSON with a trailing newline, the on-disk format of every
/// store file.
pub fn to_pretty_json<T: Serialize>(value: &T) -> Result<String, StoreError> {
    let mut out = serde_json::to_string_pretty(value)?;
    out.push('\n');
    Ok(out)
}

pub fn write_atomic(path: &Path, contents: &str, backup: bool) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = tmp_path(path);
    fs::write(&tmp, contents)?;
    set_owner_only_file(&tmp)?;
    if backup && path.exists() {
        let bak = bak_path(path);
        fs::copy(path, &bak)?;
        set_owner_only_file(&bak)?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Load `path`, falling back to `path.bak` (when `backup`), then to
/// `T::default()`. Parse failures are logged, never fatal.
pub fn load_or_default<T: DeserializeOwned + Default>(path: &Path, backup: bool) -> T {
    let tmp = tmp_path(path);
    if tmp.exists() {
        let _ = fs::remove_file(&tmp);
    }

    match try_load(path) {
        Ok(Some(value)) => return value,
        Ok(None) => {}
        Err(err) => {
            warn!(path = %path.display(), error = %err, "store file unreadable");
            if backup {
                match try_load::<T>(&bak_path(path)) {
                    Ok(Some(value)) => {
                        warn!(path = %path.display(), "recovered store from backup");
                        return value;
                    }
                    Ok(None) => {}
                    Err(bak_err) => {
                        warn!(path = %path.display(), error = %bak_err, "backup unreadable too");
                    }
                }
            }
        }
    }
    T::default()
}

fn try_load<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    match fs::read_to_string(path) {
        Ok(contents) => Ok(Some(serde_json::from_str(&contents)?)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default, PartialEq, serde::Serialize, serde::Deserialize)]
    struct Doc {
        items: Vec<String>,
    }

    #[test]
    fn writes_are_pretty_with_trailing_newline() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("doc.json");
        let doc = Doc {
            items: vec!["a".into()],
        };
        write_atomic(&path, &to_pretty_json(&doc).unwrap(), false).expect("write");

        let contents = fs::read_to_string(&path).expect("read");
        assert!(contents.ends_with('\n'));
        assert!(contents.contains("\n  \"items\""));
        assert!(!tmp_path(&path).exists(), "tmp file renamed away");
    }

    #[test]
    fn backup_recovers_from_corrupt_primary() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("doc.json");
        let doc = Doc {
            items: vec!["keep".into()],
        };
        write_atomic(&path, &to_pretty_json(&doc).unwrap(), true).expect("first write");
        write_atomic(&path, &to_pretty_json(&doc).unwrap(), true).expect("second write");

        fs::write(&path, "{not json").expect("corrupt");
        let loaded: Doc = load_or_default(&path, true);
        assert_eq!(loaded, doc);
    }

    #[test]
    fn corrupt_without_backup_starts_empty() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("doc.json");
        fs::write(&path, "]]").expect("corrupt");
        let loaded: Doc = load_or_default(&path, false);
        assert_eq!(loaded, Doc::default());
    }

    #[test]
    fn orphaned_tmp_is_removed_on_load() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("doc.json");
        fs::write(tmp_path(&path), "partial").expect("orphan");
        let _: Doc = load_or_default(&path, false);
        assert!(!tmp_path(&path).exists());
    }

    #[cfg(unix)]
    #[test]
    fn written_files_are_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("doc.json");
        write_atomic(&path, "{}\n", false).expect("write");
        let mode = fs::metadata(&path).expect("meta").permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
