use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Port requested from the hosted instance when the caller does not suggest one.
pub const DEFAULT_PORT: u16 = 3030;

/// How long a freshly spawned instance has to print its startup signature.
pub const DEFAULT_STARTUP_TIMEOUT_MS: u64 = 30_000;

/// Recent output lines retained per run.
pub const DEFAULT_OUTPUT_LOG_LINES: usize = 500;

/// Placeholder in [`SupervisorConfig::args`] replaced by the resolved listen port.
pub const PORT_PLACEHOLDER: &str = "{port}";

const CONFIG_FILE: &str = "supervisor.json";

/// Get the config directory for the supervisor.
///
/// - macOS: `~/Library/Application Support/hosted-instance/`
/// - Linux: `~/.config/hosted-instance/` (or `$XDG_CONFIG_HOME`)
/// - Windows: `%APPDATA%/hosted-instance/`
///
/// Falls back to `~/.hosted-instance/` if the platform dir is unavailable.
pub fn config_dir() -> PathBuf {
    dirs::config_dir()
        .map(|d| d.join("hosted-instance"))
        .unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".hosted-instance")
        })
}

/// Settings that shape how the hosted instance is launched and awaited.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Port used when `run()` gets no suggestion.
    pub default_port: u16,
    /// Readiness deadline in milliseconds.
    pub startup_timeout_ms: u64,
    /// Executable to launch. `None` relaunches the current executable.
    pub program: Option<PathBuf>,
    /// Command line arguments. Every `{port}` is replaced by the listen port.
    pub args: Vec<String>,
    /// Working directory for the instance. `None` uses the current directory.
    pub working_dir: Option<PathBuf>,
    /// Capacity of the recent output ring.
    pub output_log_lines: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            default_port: DEFAULT_PORT,
            startup_timeout_ms: DEFAULT_STARTUP_TIMEOUT_MS,
            program: None,
            args: vec!["start".to_string(), format!("--port={PORT_PLACEHOLDER}")],
            working_dir: None,
            output_log_lines: DEFAULT_OUTPUT_LOG_LINES,
        }
    }
}

impl SupervisorConfig {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    /// Load `supervisor.json` from [`config_dir`], or defaults.
    pub fn load() -> Self {
        load_json_config(&config_dir().join(CONFIG_FILE))
    }

    /// Load from an explicit path, or defaults.
    pub fn load_from(path: &Path) -> Self {
        load_json_config(path)
    }

    /// Persist to an explicit path, creating parent directories as needed.
    pub fn save_to(&self, path: &Path) -> Result<(), String> {
        save_json_config(path, self)
    }
}

/// Load a JSON config file, returning Default if missing or corrupt.
/// Logs when the file exists but cannot be read or parsed, so a corrupt
/// file is visible instead of silently resetting state.
pub(crate) fn load_json_config<T: DeserializeOwned + Default>(path: &Path) -> T {
    if !path.exists() {
        return T::default();
    }
    let content = match std::fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(path = %path.display(), "could not read config: {e}");
            return T::default();
        }
    };
    match serde_json::from_str(&content) {
        Ok(v) => v,
        Err(e) => {
            tracing::error!(path = %path.display(), "corrupt config, using defaults: {e}");
            T::default()
        }
    }
}

pub(crate) fn save_json_config<T: Serialize>(path: &Path, value: &T) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config dir: {e}"))?;
    }
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| format!("Failed to serialize config: {e}"))?;

    let file_name = path
        .file_name()
        .ok_or_else(|| format!("Config path has no file name: {}", path.display()))?;
    let mut temp_name = file_name.to_os_string();
    temp_name.push(format!(".tmp.{}", std::process::id()));
    let temp = path.with_file_name(temp_name);

    std::fs::write(&temp, &json).map_err(|e| format!("Failed to write temp config: {e}"))?;

    // Owner read/write only, set before the file becomes visible.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(&temp, perms)
            .map_err(|e| format!("Failed to set config permissions: {e}"))?;
    }

    // Readers see either the old file or the new one, never a partial write.
    std::fs::rename(&temp, path).map_err(|e| {
        let _ = std::fs::remove_file(&temp);
        format!("Failed to commit {}: {e}", path.display())
    })?;
    tracing::debug!(path = %path.display(), "saved config");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_launch_contract() {
        let config = SupervisorConfig::default();
        assert_eq!(config.default_port, 3030);
        assert_eq!(config.startup_timeout(), Duration::from_secs(30));
        assert_eq!(config.args, vec!["start", "--port={port}"]);
        assert!(config.program.is_none());
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = SupervisorConfig::load_from(&dir.path().join("nope.json"));
        assert_eq!(config, SupervisorConfig::default());
    }

    #[test]
    fn corrupt_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("supervisor.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert_eq!(SupervisorConfig::load_from(&path), SupervisorConfig::default());
    }

    #[test]
    fn partial_file_fills_remaining_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("supervisor.json");
        std::fs::write(&path, r#"{"default_port": 4000, "program": "/usr/bin/node"}"#).unwrap();
        let config = SupervisorConfig::load_from(&path);
        assert_eq!(config.default_port, 4000);
        assert_eq!(config.program, Some(PathBuf::from("/usr/bin/node")));
        assert_eq!(config.startup_timeout_ms, DEFAULT_STARTUP_TIMEOUT_MS);
    }

    #[test]
    fn save_then_load_preserves_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("supervisor.json");
        let config = SupervisorConfig {
            startup_timeout_ms: 1500,
            working_dir: Some(dir.path().to_path_buf()),
            ..SupervisorConfig::default()
        };
        config.save_to(&path).unwrap();
        assert_eq!(SupervisorConfig::load_from(&path), config);
    }

    #[test]
    fn save_replaces_file_without_leaving_temp() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("supervisor.json");
        std::fs::write(&path, "{ old contents").unwrap();

        let config = SupervisorConfig {
            default_port: 4200,
            ..SupervisorConfig::default()
        };
        config.save_to(&path).unwrap();

        assert_eq!(SupervisorConfig::load_from(&path), config);
        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("supervisor.json")]);
    }

    #[cfg(unix)]
    #[test]
    fn saved_config_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("supervisor.json");
        SupervisorConfig::default().save_to(&path).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
