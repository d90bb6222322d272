//! Path helpers for config and rule locations

use std::path::PathBuf;

/// Expand `~` and make relative paths absolute against the working
/// directory. Absolute paths pass through unchanged.
pub fn expand_path(path: &str) -> PathBuf {
    let path = path.trim();
    let expanded = match path {
        "" => PathBuf::from("."),
        "~" => dirs::home_dir().unwrap_or_else(|| PathBuf::from(path)),
        _ => match (path.strip_prefix("~/"), dirs::home_dir()) {
            (Some(rest), Some(home)) => home.join(rest),
            _ => PathBuf::from(path),
        },
    };

    if expanded.is_relative() {
        std::env::current_dir()
            .map(|cwd| cwd.join(&expanded))
            .unwrap_or(expanded)
    } else {
        expanded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absolute_unchanged() {
        assert_eq!(expand_path("/etc/spanmold/rules"), PathBuf::from("/etc/spanmold/rules"));
    }

    #[test]
    fn test_relative_joined_to_cwd() {
        let cwd = std::env::current_dir().unwrap();
        assert_eq!(expand_path("rules"), cwd.join("rules"));
        assert_eq!(expand_path("  ./rules "), cwd.join("./rules"));
        assert_eq!(expand_path(""), cwd.join("."));
    }

    #[test]
    fn test_tilde() {
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_path("~"), home);
            assert_eq!(expand_path("~/.spanmold/bundle.msgpack"), home.join(".spanmold/bundle.msgpack"));
        }
    }
}
