//! Data directory resolution
//!
//! The registry file and downloaded models live under a single data
//! directory. `REBELSCRIBE_DATA_DIR` overrides it; otherwise a dotfile
//! directory in the user's home is used.

use std::ffi::OsString;
use std::path::PathBuf;

/// Environment variable selecting the data directory
pub const DATA_DIR_ENV: &str = "REBELSCRIBE_DATA_DIR";

/// Directory name used under the home directory when no override is set
pub const DEFAULT_DIR_NAME: &str = ".rebelscribe";

/// File name of the batch benchmark registry
pub const REGISTRY_FILE_NAME: &str = "batch_benchmarks.json";

/// Resolve the data directory from the environment
pub fn data_dir() -> PathBuf {
    data_dir_from(std::env::var_os(DATA_DIR_ENV))
}

/// Resolve the data directory from an explicit override value
pub fn data_dir_from(override_dir: Option<OsString>) -> PathBuf {
    match override_dir {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(DEFAULT_DIR_NAME),
    }
}

/// Directory holding downloaded model files
pub fn models_dir() -> PathBuf {
    data_dir().join("models")
}

/// Default location of the registry JSON file
pub fn registry_path() -> PathBuf {
    registry_path_in(&data_dir())
}

pub fn registry_path_in(data_dir: &std::path::Path) -> PathBuf {
    data_dir.join("benchmarks").join(REGISTRY_FILE_NAME)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_override_wins() {
        let dir = data_dir_from(Some(OsString::from("/srv/scribe")));
        assert_eq!(dir, PathBuf::from("/srv/scribe"));
        assert_eq!(
            registry_path_in(&dir),
            PathBuf::from("/srv/scribe/benchmarks/batch_benchmarks.json")
        );
    }

    #[test]
    fn test_empty_override_falls_back_to_home() {
        let dir = data_dir_from(Some(OsString::new()));
        assert!(dir.ends_with(DEFAULT_DIR_NAME));
        assert_eq!(dir, data_dir_from(None));
    }
}
