//! Filesystem helpers for the shared volumes

use std::fs;
use std::io::Write;
use std::path::Path;

use dynakube_common::Error;
use tempfile::NamedTempFile;

fn io_err(path: &Path, e: impl std::fmt::Display) -> Error {
    Error::io(path.display().to_string(), e.to_string())
}

/// Write `contents` to `path` atomically.
///
/// The data lands in a temp file next to `path` first so readers never see
/// a partial file. With `read_only` the file ends up mode 0444.
pub fn write_atomic(path: &Path, contents: &[u8], read_only: bool) -> Result<(), Error> {
    let dir = path
        .parent()
        .ok_or_else(|| Error::io(path.display().to_string(), "no parent directory"))?;
    fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;

    let mut temp = NamedTempFile::new_in(dir).map_err(|e| io_err(dir, e))?;
    temp.write_all(contents).map_err(|e| io_err(path, e))?;
    temp.as_file().sync_all().map_err(|e| io_err(path, e))?;
    if read_only {
        set_read_only(temp.path())?;
    }
    temp.persist(path).map_err(|e| io_err(path, e.error))?;
    Ok(())
}

#[cfg(unix)]
fn set_read_only(path: &Path) -> Result<(), Error> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o444)).map_err(|e| io_err(path, e))
}

#[cfg(not(unix))]
fn set_read_only(path: &Path) -> Result<(), Error> {
    let mut perms = fs::metadata(path).map_err(|e| io_err(path, e))?.permissions();
    perms.set_readonly(true);
    fs::set_permissions(path, perms).map_err(|e| io_err(path, e))
}

/// Read a file, `None` when it does not exist
pub fn read_optional(path: &Path) -> Result<Option<Vec<u8>>, Error> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(io_err(path, e)),
    }
}

/// Recursively copy `source` into `target`, overwriting existing files
pub fn copy_dir(source: &Path, target: &Path) -> Result<(), Error> {
    fs::create_dir_all(target).map_err(|e| io_err(target, e))?;
    for entry in fs::read_dir(source).map_err(|e| io_err(source, e))? {
        let entry = entry.map_err(|e| io_err(source, e))?;
        let from = entry.path();
        let to = target.join(entry.file_name());
        let file_type = entry.file_type().map_err(|e| io_err(&from, e))?;
        if file_type.is_dir() {
            copy_dir(&from, &to)?;
        } else {
            fs::copy(&from, &to).map_err(|e| io_err(&from, e))?;
        }
    }
    Ok(())
}
