//! Unix permission bits captured alongside archived files.

use std::fs;
use std::path::Path;

/// Default mode recorded where the platform has no permission bits.
pub const DEFAULT_MODE: u32 = 0o644;

/// Permission bits of the file at `path`
#[cfg(unix)]
pub fn read_mode(path: &Path) -> std::io::Result<u32> {
    use std::os::unix::fs::PermissionsExt;
    Ok(fs::metadata(path)?.permissions().mode() & 0o7777)
}

#[cfg(not(unix))]
pub fn read_mode(path: &Path) -> std::io::Result<u32> {
    fs::metadata(path)?;
    Ok(DEFAULT_MODE)
}

/// Apply permission bits to the file at `path`
#[cfg(unix)]
pub fn apply_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode & 0o7777))
}

#[cfg(not(unix))]
pub fn apply_mode(_path: &Path, _mode: u32) -> std::io::Result<()> {
    // On non-Unix platforms, permission bits are not restored
    Ok(())
}
