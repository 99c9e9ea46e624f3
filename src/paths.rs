//! Utility functions for path manipulation.

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};

/// Expands a leading `~/` prefix to the user's home directory.
///
/// If the `HOME` environment variable is not set, the function returns the
/// input string unchanged (i.e., the leading `~` is not expanded).
///
/// # Examples
///
/// ```
/// # use vastdev::paths::expand_tilde;
/// let home = std::env::var("HOME").expect("HOME should be set");
/// assert_eq!(expand_tilde("~/.ssh/config"), format!("{home}/.ssh/config"));
/// assert_eq!(expand_tilde("/absolute/path"), "/absolute/path");
/// ```
#[must_use]
pub fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/")
        && let Some(home) = std::env::var_os("HOME")
    {
        return format!("{}/{rest}", home.to_string_lossy());
    }
    path.to_owned()
}

/// Expands `~/` and wraps the result as a UTF-8 path.
#[must_use]
pub fn expand_path(path: &str) -> Utf8PathBuf {
    Utf8PathBuf::from(expand_tilde(path))
}

/// Reads a file through a capability handle on its parent directory.
///
/// # Errors
///
/// Returns the operating system error message when the directory cannot be
/// opened or the file cannot be read.
pub fn read_to_string_ambient(path: &Utf8Path) -> Result<String, String> {
    let (dir_path, file_path) = match (path.parent(), path.file_name()) {
        (Some(parent), Some(name)) if !parent.as_str().is_empty() => (parent, Utf8Path::new(name)),
        (_, Some(_)) => (Utf8Path::new("."), path),
        (_, None) => return Err(format!("path has no file name: {path}")),
    };

    let dir =
        Dir::open_ambient_dir(dir_path, ambient_authority()).map_err(|err| err.to_string())?;
    dir.read_to_string(file_path).map_err(|err| err.to_string())
}

/// Lists the entries of `dir` that may hold file contents (regular files
/// and symlinks), sorted by path.
///
/// # Errors
///
/// Returns the operating system error message when the directory cannot be
/// opened or iterated.
pub fn list_files_ambient(dir: &Utf8Path) -> Result<Vec<Utf8PathBuf>, String> {
    let handle = Dir::open_ambient_dir(dir, ambient_authority()).map_err(|err| err.to_string())?;
    let mut files = Vec::new();
    for entry in handle.entries().map_err(|err| err.to_string())? {
        let entry = entry.map_err(|err| err.to_string())?;
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        if (file_type.is_file() || file_type.is_symlink())
            && let Ok(name) = entry.file_name()
        {
            files.push(dir.join(name));
        }
    }
    files.sort();
    Ok(files)
}
