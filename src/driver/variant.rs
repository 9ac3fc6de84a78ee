use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::config::SettingValue;

pub const DEFAULT_BUILD_TYPE: &str = "Debug";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Linkage {
    Static,
    Shared,
}

/// Build-type, cache and environment overrides of the active variant
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VariantOptions {
    pub short: String,
    pub long: String,
    pub build_type: Option<String>,
    pub linkage: Option<Linkage>,
    pub settings: BTreeMap<String, SettingValue>,
    pub env: BTreeMap<String, String>,
    /// Values for `${variant:NAME}`
    pub variant_vars: BTreeMap<String, String>,
}

impl VariantOptions {
    pub fn for_build_type(build_type: &str) -> Self {
        Self {
            short: build_type.to_string(),
            long: build_type.to_string(),
            build_type: Some(build_type.to_string()),
            variant_vars: BTreeMap::from([("buildType".to_string(), build_type.to_string())]),
            ..Default::default()
        }
    }

    pub fn build_type(&self) -> &str {
        self.build_type.as_deref().unwrap_or(DEFAULT_BUILD_TYPE)
    }

    /// Cache settings contributed by the variant. `CMAKE_BUILD_TYPE` is
    /// only meaningful for single-config generators.
    pub fn cache_settings(&self, include_build_type: bool) -> BTreeMap<String, SettingValue> {
        let mut settings = BTreeMap::new();
        if include_build_type {
            settings.insert(
                "CMAKE_BUILD_TYPE".to_string(),
                SettingValue::String(self.build_type().to_string()),
            );
        }
        if let Some(linkage) = self.linkage {
            settings.insert(
                "BUILD_SHARED_LIBS".to_string(),
                SettingValue::Bool(linkage == Linkage::Shared),
            );
        }
        for (key, value) in &self.settings {
            settings.insert(key.clone(), value.clone());
        }
        settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_variant_settings() {
        let mut variant = VariantOptions::for_build_type("Release");
        variant.linkage = Some(Linkage::Shared);
        variant
            .settings
            .insert("ENABLE_LTO".into(), SettingValue::Bool(true));

        let settings = variant.cache_settings(true);
        assert_eq!(settings["CMAKE_BUILD_TYPE"], SettingValue::from("Release"));
        assert_eq!(settings["BUILD_SHARED_LIBS"], SettingValue::Bool(true));
        assert_eq!(settings["ENABLE_LTO"], SettingValue::Bool(true));

        assert!(!variant.cache_settings(false).contains_key("CMAKE_BUILD_TYPE"));
    }

    #[test]
    fn test_default_build_type() {
        assert_eq!(VariantOptions::default().build_type(), "Debug");
        let parsed: VariantOptions =
            serde_json::from_str(r#"{"short": "Rel", "buildType": "RelWithDebInfo", "linkage": "static"}"#)
                .unwrap();
        assert_eq!(parsed.build_type(), "RelWithDebInfo");
        assert_eq!(parsed.linkage, Some(Linkage::Static));
    }
}
