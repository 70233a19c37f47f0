//! Default locations for upload state and configuration.
//!
//! - Linux: `$XDG_DATA_HOME/chunkferry` or `~/.local/share/chunkferry`
//! - Windows: `%APPDATA%/chunkferry`

use std::path::PathBuf;

/// Directory holding the persistent upload state.
pub fn state_dir() -> PathBuf {
    base_dir().join("state")
}

/// Default configuration file.
pub fn config_file() -> PathBuf {
    base_dir().join("config.toml")
}

fn base_dir() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        let appdata =
            std::env::var("APPDATA").unwrap_or_else(|_| "C:\\Users\\Default\\AppData".into());
        PathBuf::from(appdata).join("chunkferry")
    }

    #[cfg(not(target_os = "windows"))]
    {
        if let Some(data) = std::env::var_os("XDG_DATA_HOME").filter(|v| !v.is_empty()) {
            return PathBuf::from(data).join("chunkferry");
        }
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
        PathBuf::from(home)
            .join(".local")
            .join("share")
            .join("chunkferry")
    }
}
