//! Line scanner for the subset of `ssh_config(5)` we care about: `Include`
//! and `Host` directives.

use camino::{Utf8Path, Utf8PathBuf};
use tracing::warn;

use super::DiscoveryError;
use crate::paths::{expand_tilde, list_files_ambient, read_to_string_ambient};

const INCLUDE_KEYWORD: &str = "Include";
const HOST_KEYWORD: &str = "Host";
const WILDCARD_HOST: &str = "*";

/// Splits a directive line into its keyword and arguments, skipping blank
/// lines and comments.
fn directive(line: &str) -> Option<(&str, std::str::SplitWhitespace<'_>)> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return None;
    }
    let mut tokens = trimmed.split_whitespace();
    let keyword = tokens.next()?;
    Some((keyword, tokens))
}

/// Returns every pattern named by `Include` lines, in file order.
pub(crate) fn include_patterns(contents: &str) -> Vec<String> {
    contents
        .lines()
        .filter_map(directive)
        .filter(|(keyword, _)| keyword.eq_ignore_ascii_case(INCLUDE_KEYWORD))
        .flat_map(|(_, patterns)| patterns.map(str::to_owned))
        .collect()
}

/// Appends the aliases declared by `Host` lines to `aliases`, skipping the
/// catch-all `*` and anything already present.
pub(crate) fn collect_hosts(contents: &str, aliases: &mut Vec<String>) {
    for (_, names) in contents
        .lines()
        .filter_map(directive)
        .filter(|(keyword, _)| keyword.eq_ignore_ascii_case(HOST_KEYWORD))
    {
        for name in names {
            if name != WILDCARD_HOST && !aliases.iter().any(|known| known == name) {
                aliases.push(name.to_owned());
            }
        }
    }
}

/// Resolves an `Include` pattern to the files it names.
///
/// Relative patterns are anchored at `base_dir`. Wildcard patterns list every
/// regular file in the directory preceding the first `*`, sorted by name;
/// direct patterns resolve to the file only when it exists.
pub(crate) fn resolve_include(base_dir: &Utf8Path, pattern: &str) -> Vec<Utf8PathBuf> {
    let expanded = expand_tilde(pattern);
    if let Some((prefix, _)) = expanded.split_once('*') {
        let trimmed = prefix.trim_end_matches('/');
        let dir = if trimmed.is_empty() && prefix.starts_with('/') {
            Utf8PathBuf::from("/")
        } else {
            base_dir.join(trimmed)
        };
        return list_files(&dir);
    }

    let candidate = base_dir.join(&expanded);
    if candidate.is_file() {
        vec![candidate]
    } else {
        Vec::new()
    }
}

fn list_files(dir: &Utf8Path) -> Vec<Utf8PathBuf> {
    if !dir.is_dir() {
        return Vec::new();
    }

    list_files_ambient(dir).unwrap_or_else(|message| {
        warn!(path = %dir, error = %message, "failed to list included ssh config directory");
        Vec::new()
    })
}

/// Reads the root configuration and returns it together with every file its
/// `Include` directives resolve to.
///
/// # Errors
///
/// Returns [`DiscoveryError::ConfigMissing`] when `root` is absent, or
/// [`DiscoveryError::Read`] when it cannot be read. Included files are not
/// read here.
pub(crate) fn config_files(root: &Utf8Path) -> Result<Vec<Utf8PathBuf>, DiscoveryError> {
    if !root.is_file() {
        return Err(DiscoveryError::ConfigMissing {
            path: root.to_path_buf(),
        });
    }

    let contents = read(root)?;
    let base_dir = root.parent().unwrap_or_else(|| Utf8Path::new("."));
    let mut files = vec![root.to_path_buf()];
    for pattern in include_patterns(&contents) {
        for path in resolve_include(base_dir, &pattern) {
            if !files.contains(&path) {
                files.push(path);
            }
        }
    }
    Ok(files)
}

pub(crate) fn read(path: &Utf8Path) -> Result<String, DiscoveryError> {
    read_to_string_ambient(path).map_err(|message| DiscoveryError::Read {
        path: path.to_path_buf(),
        message,
    })
}
