//! # iodetour-config
//!
//! Configuration management for iodetour.
//!
//! Loads configuration from:
//! 1. `~/.iodetour/config.toml` (global)
//! 2. `.iodetour/config.toml` (project-local, overrides global)
//! 3. Environment variables (highest priority)
//!
//! Command-line flags are applied on top by the launcher.

pub mod logging;

use iodetour_ipc::{MountedPath, Options};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

pub const ENV_IGNORED_APPLICATIONS: &str = "IOWRAPPER_IGNORED_APPLICATIONS";
pub const ENV_MOUNTED_PATHS: &str = "IOWRAPPER_MOUNTED_PATHS";
pub const ENV_OPTIONS: &str = "IOWRAPPER_OPTIONS";
pub const ENV_LOG: &str = "IOWRAPPER_LOG";
pub const ENV_HOOKS_LOG: &str = "IOWRAPPER_HOOKS_LOG";

/// Project config location, relative to the working directory.
pub const PROJECT_CONFIG: &str = ".iodetour/config.toml";

/// File name of the hooks library shipped next to the launcher.
pub const HOOKS_DLL_NAME: &str = "iodetour_hooks.dll";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("unknown option name: {0}")]
    UnknownOption(String),
    #[error("mounted path list has an unpaired entry ({0} items)")]
    UnpairedMount(usize),
    #[error("invalid log level: {0}")]
    InvalidLevel(String),
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub tracking: TrackingConfig,
    pub launcher: LauncherConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Load config from standard locations
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_with(None)
    }

    /// Like [`Config::load`], with `explicit` replacing the project layer.
    pub fn load_with(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let project = explicit.unwrap_or(Path::new(PROJECT_CONFIG));
        let mut config = Self::load_from(Self::global_config_path().as_deref(), project)?;
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Load the two file layers without consulting the environment.
    pub fn load_from(global: Option<&Path>, project: &Path) -> Result<Self, ConfigError> {
        let mut config = Config::default();

        if let Some(global_path) = global {
            if global_path.exists() {
                debug!(path = %global_path.display(), "loading global config");
                let contents = std::fs::read_to_string(global_path)?;
                config = toml::from_str(&contents)?;
            }
        }

        if project.exists() {
            debug!(path = %project.display(), "loading project config");
            let contents = std::fs::read_to_string(project)?;
            let project_config: Config = toml::from_str(&contents)?;
            config.merge(project_config);
        }

        Ok(config)
    }

    /// Global config path: ~/.iodetour/config.toml
    pub fn global_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".iodetour").join("config.toml"))
    }

    /// Merge a higher-priority layer. Non-empty fields win.
    pub fn merge(&mut self, other: Config) {
        if !other.tracking.ignored_applications.is_empty() {
            self.tracking.ignored_applications = other.tracking.ignored_applications;
        }
        if !other.tracking.mounted_paths.is_empty() {
            self.tracking.mounted_paths = other.tracking.mounted_paths;
        }
        if !other.tracking.options.is_empty() {
            self.tracking.options = other.tracking.options;
        }
        if other.launcher.hooks_dll.is_some() {
            self.launcher.hooks_dll = other.launcher.hooks_dll;
        }
        self.launcher.worker_thread |= other.launcher.worker_thread;
        if other.logging.level != LoggingConfig::default().level {
            self.logging.level = other.logging.level;
        }
        if other.logging.hooks_log.is_some() {
            self.logging.hooks_log = other.logging.hooks_log;
        }
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_env(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary variable lookup.
    pub fn apply_env<F>(&mut self, var: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(apps) = var(ENV_IGNORED_APPLICATIONS) {
            self.tracking.ignored_applications = split_list(&apps).map(str::to_string).collect();
        }
        if let Some(mounts) = var(ENV_MOUNTED_PATHS) {
            self.tracking.mounted_paths = parse_mount_pairs(&mounts)?;
        }
        if let Some(options) = var(ENV_OPTIONS) {
            // Validate now so a typo fails at startup.
            Options::parse_list(&options).map_err(ConfigError::UnknownOption)?;
            self.tracking.options = split_list(&options).map(str::to_string).collect();
        }
        if let Some(path) = var(ENV_HOOKS_LOG) {
            if !path.is_empty() {
                self.logging.hooks_log = Some(PathBuf::from(path));
            }
        }
        Ok(())
    }

    /// Tracking options as the payload bit-set.
    pub fn options(&self) -> Result<Options, ConfigError> {
        self.tracking.options.iter().try_fold(Options::empty(), |acc, name| {
            Options::parse_name(name)
                .map(|flag| acc | flag)
                .ok_or_else(|| ConfigError::UnknownOption(name.clone()))
        })
    }

    pub fn mounted_paths(&self) -> Vec<MountedPath> {
        self.tracking
            .mounted_paths
            .iter()
            .map(|m| MountedPath::new(m.input.clone(), m.real.clone()))
            .collect()
    }

    /// Configured hooks DLL, or the one next to `launcher_exe`.
    pub fn hooks_dll(&self, launcher_exe: &Path) -> PathBuf {
        match &self.launcher.hooks_dll {
            Some(path) => path.clone(),
            None => launcher_exe
                .parent()
                .unwrap_or(Path::new("."))
                .join(HOOKS_DLL_NAME),
        }
    }

    /// Generate default config TOML string
    pub fn default_toml() -> String {
        // Serializing plain strings, vectors and booleans cannot fail.
        toml::to_string_pretty(&Config::default()).unwrap_or_default()
    }
}

fn split_list(list: &str) -> impl Iterator<Item = &str> {
    list.split(';').map(str::trim).filter(|s| !s.is_empty())
}

/// Parse `input;real;input;real...`.
pub fn parse_mount_pairs(list: &str) -> Result<Vec<MountConfig>, ConfigError> {
    let items: Vec<&str> = split_list(list).collect();
    if items.len() % 2 != 0 {
        return Err(ConfigError::UnpairedMount(items.len()));
    }
    Ok(items
        .chunks_exact(2)
        .map(|pair| MountConfig {
            input: pair[0].to_string(),
            real: pair[1].to_string(),
        })
        .collect())
}

/// What gets tracked and how it is reported
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingConfig {
    /// Executable basenames that run without detours
    pub ignored_applications: Vec<String>,
    /// Path prefix remapping, first match wins
    pub mounted_paths: Vec<MountConfig>,
    /// Option names, e.g. "IgnoreSystem"
    pub options: Vec<String>,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            // Long-lived PDB server started by the MSVC toolchain.
            ignored_applications: vec!["mspdbsrv.exe".to_string()],
            mounted_paths: Vec::new(),
            options: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountConfig {
    pub input: String,
    pub real: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LauncherConfig {
    /// Hooks DLL path (default: next to the launcher executable)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hooks_dll: Option<PathBuf>,
    /// Run the pipe server on a dedicated thread
    pub worker_thread: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// Log file for the hooks DLL; no DLL logging when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hooks_log: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
            hooks_log: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.tracking.ignored_applications, vec!["mspdbsrv.exe"]);
        assert_eq!(config.options().unwrap(), Options::empty());
        assert_eq!(config.logging.level, "warn");
    }

    #[test]
    fn test_default_toml_generation() {
        let toml_str = Config::default_toml();
        assert!(toml_str.contains("[tracking]"));
        assert!(toml_str.contains("[launcher]"));
        assert!(toml_str.contains("mspdbsrv.exe"));
        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.logging.level, "warn");
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config
            .apply_env(env(&[
                (ENV_IGNORED_APPLICATIONS, "a.exe; b.exe;"),
                (ENV_MOUNTED_PATHS, r"X:\;C:\real\;Y:\src;D:\src"),
                (ENV_OPTIONS, "IgnoreSystem;ignore-pipe"),
                (ENV_HOOKS_LOG, r"C:\tmp\hooks.log"),
            ]))
            .unwrap();

        assert_eq!(config.tracking.ignored_applications, vec!["a.exe", "b.exe"]);
        let mounts = config.mounted_paths();
        assert_eq!(mounts.len(), 2);
        assert_eq!(mounts[0], MountedPath::new(r"X:\", r"C:\real\"));
        assert_eq!(
            config.options().unwrap(),
            Options::IGNORE_SYSTEM | Options::IGNORE_PIPE
        );
        assert_eq!(
            config.logging.hooks_log.as_deref(),
            Some(Path::new(r"C:\tmp\hooks.log"))
        );
    }

    #[test]
    fn test_env_rejects_bad_values() {
        let mut config = Config::default();
        assert!(matches!(
            config.apply_env(env(&[(ENV_MOUNTED_PATHS, "X:;C:;Y:")])),
            Err(ConfigError::UnpairedMount(3))
        ));
        assert!(matches!(
            config.apply_env(env(&[(ENV_OPTIONS, "IgnoreEverything")])),
            Err(ConfigError::UnknownOption(name)) if name == "IgnoreEverything"
        ));
    }

    #[test]
    fn test_hooks_dll_defaults_next_to_launcher() {
        let config = Config::default();
        let exe = Path::new("/opt/iodetour/iowrapper.exe");
        assert_eq!(
            config.hooks_dll(exe),
            Path::new("/opt/iodetour").join(HOOKS_DLL_NAME)
        );
    }
}
