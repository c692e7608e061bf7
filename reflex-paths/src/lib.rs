//! XDG Base Directory paths for reflex.
//!
//! The engine follows XDG paths on every platform so that config and the
//! heuristic database land in the same place for services and CLI tooling.

use std::path::{Path, PathBuf};

/// Application directory name appended to every base directory.
const APP_DIR: &str = "reflex";

/// File name of the engine configuration inside [`config_dir`].
pub const CONFIG_FILE_NAME: &str = "reflex.toml";

/// Get the reflex config directory.
///
/// Returns `$XDG_CONFIG_HOME/reflex` if set, otherwise `~/.config/reflex`.
///
/// # Examples
///
/// ```
/// use reflex_paths::config_dir;
///
/// let config = config_dir();
/// assert!(config.ends_with("reflex"));
/// ```
pub fn config_dir() -> PathBuf {
    resolve(
        std::env::var_os("XDG_CONFIG_HOME").map(PathBuf::from),
        dirs::home_dir(),
        ".config",
    )
}

/// Get the reflex data directory.
///
/// Returns `$XDG_DATA_HOME/reflex` if set, otherwise `~/.local/share/reflex`.
/// The heuristic database lives below this directory.
pub fn data_dir() -> PathBuf {
    resolve(
        std::env::var_os("XDG_DATA_HOME").map(PathBuf::from),
        dirs::home_dir(),
        ".local/share",
    )
}

/// Path of the default configuration file.
pub fn config_file() -> PathBuf {
    config_dir().join(CONFIG_FILE_NAME)
}

/// Default location of the durable heuristic store.
pub fn heuristics_db_dir() -> PathBuf {
    data_dir().join("heuristics")
}

fn resolve(xdg: Option<PathBuf>, home: Option<PathBuf>, fallback: &str) -> PathBuf {
    match (xdg, home) {
        (Some(base), _) if !base.as_os_str().is_empty() => base.join(APP_DIR),
        (_, Some(home)) => home.join(fallback).join(APP_DIR),
        _ => Path::new(fallback).join(APP_DIR),
    }
}
