//! Small filesystem utilities.

use std::path::Path;

use crate::PerfscopeResult;

/// Create the parent directory of `path` if it does not exist yet.
pub fn ensure_parent_dir(path: &Path) -> PerfscopeResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(())
}

/// Relocate `from` to `to`, falling back to copy+remove when a plain rename
/// fails (e.g. across filesystems).
pub fn move_file(from: &Path, to: &Path) -> PerfscopeResult<()> {
    ensure_parent_dir(to)?;
    match std::fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(_) => {
            std::fs::copy(from, to)?;
            std::fs::remove_file(from)?;
            Ok(())
        }
    }
}
