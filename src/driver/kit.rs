//! Toolchain kits
//!
//! A kit names the compilers, toolchain file and preferred generator to
//! configure with. Drivers hold an `Arc<Kit>` snapshot; changing kits
//! replaces the snapshot.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::config::{ConfigError, SettingValue};
use crate::generator::Generator;

/// Name of the kit used when none was selected
pub const UNSPECIFIED_KIT_NAME: &str = "__unspec__";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Kit {
    pub name: String,
    /// Language name (`C`, `CXX`, ...) to compiler path
    #[serde(default)]
    pub compilers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub toolchain_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_generator: Option<Generator>,
    #[serde(default)]
    pub cmake_settings: BTreeMap<String, SettingValue>,
    #[serde(default)]
    pub environment_variables: BTreeMap<String, String>,
}

impl Kit {
    pub fn unspecified() -> Self {
        Self {
            name: UNSPECIFIED_KIT_NAME.to_string(),
            ..Default::default()
        }
    }

    /// Cache settings contributed by this kit
    pub fn cache_settings(&self) -> BTreeMap<String, SettingValue> {
        let mut settings = BTreeMap::new();
        for (lang, compiler) in &self.compilers {
            settings.insert(
                format!("CMAKE_{lang}_COMPILER"),
                SettingValue::String(compiler.clone()),
            );
        }
        if let Some(toolchain) = &self.toolchain_file {
            settings.insert(
                "CMAKE_TOOLCHAIN_FILE".to_string(),
                SettingValue::String(toolchain.clone()),
            );
        }
        for (key, value) in &self.cmake_settings {
            settings.insert(key.clone(), value.clone());
        }
        settings
    }

    /// Whether a build directory configured with `previous` must be wiped
    /// before configuring with `self`. CMake cannot switch compilers or
    /// toolchains in an existing cache.
    pub fn needs_clean_from(&self, previous: &Kit) -> bool {
        self.compilers != previous.compilers || self.toolchain_file != previous.toolchain_file
    }
}

/// Load kit definitions from a JSON array
pub fn load_kits(path: &Path) -> Result<Vec<Kit>, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}
