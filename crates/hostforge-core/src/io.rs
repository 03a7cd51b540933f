use crate::error::Result;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use tempfile::NamedTempFile;

/// Atomically write `data` to `path` using a tempfile in the same directory.
/// Prevents partial writes from corrupting state files.
pub fn atomic_write(path: &Path, data: &[u8]) -> Result<()> {
    atomic_write_with_mode(path, data, None)
}

/// Like [`atomic_write`], but sets the file mode before the rename so the
/// final path never exists with wider permissions than `mode`.
pub fn atomic_write_with_mode(path: &Path, data: &[u8], mode: Option<u32>) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let dir = path.parent().unwrap_or(Path::new("."));
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    if let Some(mode) = mode {
        std::fs::set_permissions(tmp.path(), std::fs::Permissions::from_mode(mode))?;
    }
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Create a directory and all parents, idempotent.
pub fn ensure_dir(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path)?;
    Ok(())
}

/// Write a file only if its content differs. Returns true if written.
pub fn write_if_changed(path: &Path, data: &[u8], mode: Option<u32>) -> Result<bool> {
    if path.exists() && std::fs::read(path)? == data {
        return Ok(false);
    }
    atomic_write_with_mode(path, data, mode)?;
    Ok(true)
}

/// Append text to a file, creating it if it doesn't exist.
pub fn append_text(path: &Path, text: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut f = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    f.write_all(text.as_bytes())?;
    Ok(())
}

/// Add `line` to `path` if it isn't already present. Returns true if added.
///
/// Exact line match, so re-running never duplicates a cron entry.
pub fn ensure_line(path: &Path, line: &str) -> Result<bool> {
    let existing = if path.exists() {
        std::fs::read_to_string(path)?
    } else {
        String::new()
    };
    if existing.lines().any(|l| l == line) {
        return Ok(false);
    }
    let sep = if existing.is_empty() || existing.ends_with('\n') {
        ""
    } else {
        "\n"
    };
    append_text(path, &format!("{sep}{line}\n"))?;
    Ok(true)
}

/// Remove a file if present. Returns true if something was removed.
pub fn remove_file_if_exists(path: &Path) -> Result<bool> {
    match std::fs::symlink_metadata(path) {
        Ok(_) => {
            std::fs::remove_file(path)?;
            Ok(true)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Remove a directory tree if present. Returns true if something was removed.
pub fn remove_dir_if_exists(path: &Path) -> Result<bool> {
    if !path.exists() {
        return Ok(false);
    }
    std::fs::remove_dir_all(path)?;
    Ok(true)
}

/// Unix permission bits of `path`, if it exists.
pub fn mode_of(path: &Path) -> Option<u32> {
    std::fs::metadata(path)
        .ok()
        .map(|m| m.permissions().mode() & 0o7777)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn atomic_write_creates_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.yaml");
        atomic_write(&path, b"hello: world").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "hello: world");
    }

    #[test]
    fn atomic_write_creates_parents() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a/b/c/test.yaml");
        atomic_write(&path, b"data").unwrap();
        assert!(path.exists());
    }

    #[test]
    fn atomic_write_with_mode_sets_owner_only() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("secret.env");
        atomic_write_with_mode(&path, b"TOKEN=x\n", Some(0o600)).unwrap();
        assert_eq!(mode_of(&path), Some(0o600));
    }

    #[test]
    fn write_if_changed_skips_identical_content() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("unit.service");
        assert!(write_if_changed(&path, b"[Unit]\n", None).unwrap());
        assert!(!write_if_changed(&path, b"[Unit]\n", None).unwrap());
        assert!(write_if_changed(&path, b"[Unit]\nDescription=x\n", None).unwrap());
    }

    #[test]
    fn ensure_line_idempotent() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cron");
        assert!(ensure_line(&path, "0 3 * * * root true").unwrap());
        assert!(!ensure_line(&path, "0 3 * * * root true").unwrap());
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 1);
    }

    #[test]
    fn ensure_line_appends_after_unterminated_content() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cron");
        std::fs::write(&path, "SHELL=/bin/sh").unwrap();
        ensure_line(&path, "@daily root true").unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "SHELL=/bin/sh\n@daily root true\n");
    }

    #[test]
    fn remove_helpers_are_idempotent() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("f");
        let sub = dir.path().join("d/e");
        std::fs::write(&file, b"x").unwrap();
        std::fs::create_dir_all(&sub).unwrap();
        assert!(remove_file_if_exists(&file).unwrap());
        assert!(!remove_file_if_exists(&file).unwrap());
        assert!(remove_dir_if_exists(&dir.path().join("d")).unwrap());
        assert!(!remove_dir_if_exists(&dir.path().join("d")).unwrap());
    }
}
