//! Settings for the orchestration core
//!
//! Settings are read from a JSON file (camelCase keys, every key optional)
//! or assembled programmatically through [`CMakeToolsConfigBuilder`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Default settings file name looked up in the source directory
pub const SETTINGS_FILE_NAME: &str = ".cmake-tools.json";

/// Default build directory template
pub const DEFAULT_BUILD_DIRECTORY: &str = "${workspaceFolder}/build";

/// Upper bound for `parallelJobs`
pub const MAX_PARALLEL_JOBS: u32 = 1024;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read settings file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid settings file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid setting '{field}': {reason}")]
    Invalid { field: String, reason: String },
}

impl ConfigError {
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// A cache setting value as written in settings, kits and variants
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SettingValue {
    Bool(bool),
    Number(serde_json::Number),
    String(String),
    List(Vec<String>),
}

impl From<bool> for SettingValue {
    fn from(value: bool) -> Self {
        SettingValue::Bool(value)
    }
}

impl From<&str> for SettingValue {
    fn from(value: &str) -> Self {
        SettingValue::String(value.to_string())
    }
}

impl From<String> for SettingValue {
    fn from(value: String) -> Self {
        SettingValue::String(value)
    }
}

/// Complete settings for configure/build/test
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CMakeToolsConfig {
    pub cmake_path: String,
    pub ctest_path: String,
    pub build_directory: String,
    pub install_prefix: Option<String>,
    pub configure_settings: BTreeMap<String, SettingValue>,
    pub configure_args: Vec<String>,
    pub build_args: Vec<String>,
    pub build_tool_args: Vec<String>,
    /// 0 selects the number of logical CPUs
    pub parallel_jobs: u32,
    pub ctest_parallel_jobs: u32,
    pub ctest_args: Vec<String>,
    pub cache_init: Vec<String>,
    pub preferred_generators: Vec<String>,
    pub generator: Option<String>,
    pub platform: Option<String>,
    pub toolset: Option<String>,
    pub environment: BTreeMap<String, String>,
    pub configure_environment: BTreeMap<String, String>,
    pub build_environment: BTreeMap<String, String>,
    pub test_environment: BTreeMap<String, String>,
    pub use_cmake_server: bool,
    pub auto_restart_build: bool,
    pub default_variables: BTreeMap<String, String>,
}

impl Default for CMakeToolsConfig {
    fn default() -> Self {
        Self {
            cmake_path: "cmake".to_string(),
            ctest_path: "ctest".to_string(),
            build_directory: DEFAULT_BUILD_DIRECTORY.to_string(),
            install_prefix: None,
            configure_settings: BTreeMap::new(),
            configure_args: Vec::new(),
            build_args: Vec::new(),
            build_tool_args: Vec::new(),
            parallel_jobs: 0,
            ctest_parallel_jobs: 0,
            ctest_args: Vec::new(),
            cache_init: Vec::new(),
            preferred_generators: Vec::new(),
            generator: None,
            platform: None,
            toolset: None,
            environment: BTreeMap::new(),
            configure_environment: BTreeMap::new(),
            build_environment: BTreeMap::new(),
            test_environment: BTreeMap::new(),
            use_cmake_server: true,
            auto_restart_build: false,
            default_variables: BTreeMap::new(),
        }
    }
}

impl CMakeToolsConfig {
    /// Load settings from a JSON file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        debug!("Loaded settings from {}", path.display());
        Ok(config)
    }

    /// Load `.cmake-tools.json` from the source directory, or defaults if absent
    pub fn load_or_default(source_dir: &Path) -> Result<Self, ConfigError> {
        let path = source_dir.join(SETTINGS_FILE_NAME);
        if path.exists() {
            Self::load(&path)
        } else {
            debug!("No settings file at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cmake_path.trim().is_empty() {
            return Err(ConfigError::invalid("cmakePath", "must not be empty"));
        }
        if self.build_directory.trim().is_empty() {
            return Err(ConfigError::invalid("buildDirectory", "must not be empty"));
        }
        if self.parallel_jobs > MAX_PARALLEL_JOBS {
            return Err(ConfigError::invalid(
                "parallelJobs",
                format!("must be at most {MAX_PARALLEL_JOBS}"),
            ));
        }
        Ok(())
    }

    /// Effective build parallelism
    pub fn num_jobs(&self) -> u32 {
        if self.parallel_jobs > 0 {
            self.parallel_jobs
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get() as u32)
                .unwrap_or(1)
        }
    }

    /// Effective ctest parallelism (falls back to build parallelism)
    pub fn num_ctest_jobs(&self) -> u32 {
        if self.ctest_parallel_jobs > 0 {
            self.ctest_parallel_jobs
        } else {
            self.num_jobs()
        }
    }
}

/// Builder for [`CMakeToolsConfig`] with validation
#[derive(Debug, Default)]
pub struct CMakeToolsConfigBuilder {
    config: CMakeToolsConfig,
}

impl CMakeToolsConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cmake_path(mut self, path: impl Into<String>) -> Self {
        self.config.cmake_path = path.into();
        self
    }

    pub fn ctest_path(mut self, path: impl Into<String>) -> Self {
        self.config.ctest_path = path.into();
        self
    }

    pub fn build_directory(mut self, template: impl Into<String>) -> Self {
        self.config.build_directory = template.into();
        self
    }

    pub fn install_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.install_prefix = Some(prefix.into());
        self
    }

    pub fn configure_setting(mut self, key: impl Into<String>, value: SettingValue) -> Self {
        self.config.configure_settings.insert(key.into(), value);
        self
    }

    pub fn configure_arg(mut self, arg: impl Into<String>) -> Self {
        self.config.configure_args.push(arg.into());
        self
    }

    pub fn build_arg(mut self, arg: impl Into<String>) -> Self {
        self.config.build_args.push(arg.into());
        self
    }

    pub fn build_tool_arg(mut self, arg: impl Into<String>) -> Self {
        self.config.build_tool_args.push(arg.into());
        self
    }

    pub fn parallel_jobs(mut self, jobs: u32) -> Self {
        self.config.parallel_jobs = jobs;
        self
    }

    pub fn cache_init(mut self, file: impl Into<String>) -> Self {
        self.config.cache_init.push(file.into());
        self
    }

    pub fn preferred_generator(mut self, name: impl Into<String>) -> Self {
        self.config.preferred_generators.push(name.into());
        self
    }

    pub fn environment(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.environment.insert(key.into(), value.into());
        self
    }

    pub fn use_cmake_server(mut self, enabled: bool) -> Self {
        self.config.use_cmake_server = enabled;
        self
    }

    pub fn auto_restart_build(mut self, enabled: bool) -> Self {
        self.config.auto_restart_build = enabled;
        self
    }

    pub fn build(self) -> Result<CMakeToolsConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_settings_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SETTINGS_FILE_NAME);
        std::fs::write(
            &path,
            r#"{
                "buildDirectory": "${workspaceFolder}/out/${buildType}",
                "parallelJobs": 4,
                "configureSettings": { "ENABLE_TESTS": true, "OPT": "x", "LIST": ["a", "b"], "N": 3 },
                "useCMakeServer": false
            }"#,
        )
        .unwrap();

        let config = CMakeToolsConfig::load(&path).unwrap();
        assert_eq!(config.build_directory, "${workspaceFolder}/out/${buildType}");
        assert_eq!(config.num_jobs(), 4);
        assert!(!config.use_cmake_server);
        assert_eq!(config.cmake_path, "cmake");
        assert_eq!(
            config.configure_settings["ENABLE_TESTS"],
            SettingValue::Bool(true)
        );
        assert_eq!(
            config.configure_settings["LIST"],
            SettingValue::List(vec!["a".into(), "b".into()])
        );
        assert!(matches!(
            config.configure_settings["N"],
            SettingValue::Number(_)
        ));
    }

    #[test]
    fn test_missing_settings_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = CMakeToolsConfig::load_or_default(dir.path()).unwrap();
        assert_eq!(config, CMakeToolsConfig::default());
    }

    #[test]
    fn test_invalid_settings_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SETTINGS_FILE_NAME);
        std::fs::write(&path, r#"{ "parallelJobs": "many" }"#).unwrap();
        assert!(matches!(
            CMakeToolsConfig::load(&path),
            Err(ConfigError::Parse { .. })
        ));

        let err = CMakeToolsConfigBuilder::new().cmake_path("  ").build();
        assert!(matches!(err, Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn test_builder() {
        let config = CMakeToolsConfigBuilder::new()
            .cmake_path("/opt/cmake/bin/cmake")
            .parallel_jobs(8)
            .configure_setting("FOO", "bar".into())
            .use_cmake_server(false)
            .build()
            .unwrap();
        assert_eq!(config.cmake_path, "/opt/cmake/bin/cmake");
        assert_eq!(config.num_jobs(), 8);
        assert_eq!(config.num_ctest_jobs(), 8);
        assert_eq!(config.configure_settings["FOO"], SettingValue::from("bar"));
    }
}
