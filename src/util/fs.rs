use std::fs;
use std::path::{Path, PathBuf};
use crate::models::Error;

type Result<T> = std::result::Result<T, Error>;

/// Returns the full paths of all immediate subdirectories of `dir`.
///
/// Symbolic links are excluded, even when they point at directories: the
/// file type is taken from the directory entry itself and is therefore
/// never resolved through the link.
pub(crate) fn subdirectories(dir: &Path) -> Result<Vec<PathBuf>> {

    if !dir.exists() {
        return Err(Error::new(format!("'{}' does not exist", dir.display())));
    }

    if !dir.is_dir() {
        return Err(Error::new(format!("'{}' does not refer to a directory!", dir.display())));
    }

    let mut subdirs = vec![];

    for entry_res in fs::read_dir(dir)? {
        let entry = entry_res.map_err(|e| Error::new(format!("{e}")))?;
        let file_type = entry.file_type().map_err(|e| {
            Error::new(format!("Unable to get file type information of '{:?}': {e}", entry))
        })?;

        if !file_type.is_dir() {
            continue
        }

        subdirs.push(entry.path());
    }

    Ok(subdirs)
}
