//! Command-line composition for configure, build and test

use std::collections::BTreeMap;
use std::path::Path;

use crate::config::{CMakeToolsConfig, SettingValue};
use crate::driver::kit::Kit;
use crate::driver::variant::VariantOptions;

/// Flags passed to every configure
pub const BASE_CONFIGURE_FLAGS: &[&str] = &["--no-warn-unused-cli"];

/// Render one cache setting as a `-D` flag
pub fn make_flag(key: &str, value: &SettingValue) -> String {
    match value {
        SettingValue::Bool(b) => {
            format!("-D{key}:BOOL={}", if *b { "TRUE" } else { "FALSE" })
        }
        SettingValue::Number(n) => format!("-D{key}:STRING={n}"),
        SettingValue::String(s) => format!("-D{key}:STRING={s}"),
        SettingValue::List(items) => format!("-D{key}:STRING={}", items.join(";")),
    }
}

/// Generators producing several configurations in one build tree
pub fn is_multi_config(generator: &str) -> bool {
    generator.starts_with("Visual Studio")
        || generator == "Xcode"
        || generator == "Ninja Multi-Config"
}

/// Target that builds everything
pub fn all_target_name(generator: &str) -> &'static str {
    if generator.starts_with("Visual Studio") || generator == "Xcode" {
        "ALL_BUILD"
    } else {
        "all"
    }
}

/// Cache settings for a configure, later entries overriding earlier ones:
/// built-in defaults, user settings, variant, kit
pub fn configure_settings(
    config: &CMakeToolsConfig,
    variant: &VariantOptions,
    kit: &Kit,
    generator: Option<&str>,
    install_prefix: Option<&str>,
) -> BTreeMap<String, SettingValue> {
    let mut settings = BTreeMap::new();
    settings.insert(
        "CMAKE_EXPORT_COMPILE_COMMANDS".to_string(),
        SettingValue::Bool(true),
    );
    if let Some(prefix) = install_prefix {
        settings.insert(
            "CMAKE_INSTALL_PREFIX".to_string(),
            SettingValue::String(prefix.to_string()),
        );
    }
    settings.extend(config.configure_settings.clone());

    let single_config = !generator.is_some_and(is_multi_config);
    settings.extend(variant.cache_settings(single_config));
    settings.extend(kit.cache_settings());
    settings
}

/// Final configure argument list
pub fn compose_configure_args(
    settings: &BTreeMap<String, SettingValue>,
    cache_init: &[String],
    configure_args: &[String],
    extra_args: &[String],
) -> Vec<String> {
    let mut args: Vec<String> = BASE_CONFIGURE_FLAGS.iter().map(|s| s.to_string()).collect();
    args.extend(settings.iter().map(|(k, v)| make_flag(k, v)));
    for file in cache_init {
        args.push("-C".to_string());
        args.push(file.clone());
    }
    args.extend(configure_args.iter().cloned());
    args.extend(extra_args.iter().cloned());
    args
}

/// Arguments for the native build tool, placed after `--`
pub fn generator_args(generator: &str, target: Option<&str>, jobs: u32) -> Vec<String> {
    if target == Some("clean") {
        return Vec::new();
    }
    if generator.contains("Makefiles") || generator.starts_with("Ninja") {
        vec!["-j".to_string(), jobs.to_string()]
    } else if generator.starts_with("Visual Studio") {
        vec![
            "/m".to_string(),
            "/property:GenerateFullPaths=true".to_string(),
        ]
    } else {
        Vec::new()
    }
}

/// Arguments for `cmake --build`
pub struct BuildRequest<'a> {
    pub binary_dir: &'a Path,
    pub build_type: &'a str,
    pub target: Option<&'a str>,
    pub generator: &'a str,
    pub jobs: u32,
    pub build_args: &'a [String],
    pub build_tool_args: &'a [String],
}

pub fn build_args(request: &BuildRequest<'_>) -> Vec<String> {
    let mut args = vec![
        "--build".to_string(),
        request.binary_dir.to_string_lossy().into_owned(),
        "--config".to_string(),
        request.build_type.to_string(),
    ];
    if let Some(target) = request.target {
        args.push("--target".to_string());
        args.push(target.to_string());
    }
    args.extend(request.build_args.iter().cloned());
    args.push("--".to_string());
    args.extend(generator_args(request.generator, request.target, request.jobs));
    args.extend(request.build_tool_args.iter().cloned());
    args
}

/// Arguments for `ctest`
pub fn ctest_args(jobs: u32, build_type: &str, extra: &[String]) -> Vec<String> {
    let mut args = vec![
        "-j".to_string(),
        jobs.to_string(),
        "-C".to_string(),
        build_type.to_string(),
        "-T".to_string(),
        "test".to_string(),
        "--output-on-failure".to_string(),
    ];
    args.extend(extra.iter().cloned());
    args
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::variant::Linkage;

    #[test]
    fn test_make_flag() {
        assert_eq!(make_flag("A", &SettingValue::Bool(true)), "-DA:BOOL=TRUE");
        assert_eq!(make_flag("A", &SettingValue::Bool(false)), "-DA:BOOL=FALSE");
        assert_eq!(make_flag("N", &SettingValue::Number(4.into())), "-DN:STRING=4");
        assert_eq!(make_flag("S", &"x y".into()), "-DS:STRING=x y");
        assert_eq!(
            make_flag("L", &SettingValue::List(vec!["a".into(), "b".into()])),
            "-DL:STRING=a;b"
        );
    }

    #[test]
    fn test_build_args_for_makefiles() {
        let request = BuildRequest {
            binary_dir: Path::new("/p/build"),
            build_type: "Debug",
            target: Some("all"),
            generator: "Unix Makefiles",
            jobs: 4,
            build_args: &[],
            build_tool_args: &[],
        };
        let args = build_args(&request);
        assert_eq!(
            args,
            vec![
                "--build", "/p/build", "--config", "Debug", "--target", "all", "--", "-j", "4"
            ]
        );
    }

    #[test]
    fn test_build_args_order_and_generators() {
        let build_args_extra = vec!["--verbose".to_string()];
        let tool_args = vec!["-k0".to_string()];
        let request = BuildRequest {
            binary_dir: Path::new("/b"),
            build_type: "Release",
            target: None,
            generator: "Ninja",
            jobs: 8,
            build_args: &build_args_extra,
            build_tool_args: &tool_args,
        };
        assert_eq!(
            build_args(&request),
            vec!["--build", "/b", "--config", "Release", "--verbose", "--", "-j", "8", "-k0"]
        );

        assert_eq!(
            generator_args("Visual Studio 17 2022", None, 8),
            vec!["/m", "/property:GenerateFullPaths=true"]
        );
        assert!(generator_args("Ninja", Some("clean"), 8).is_empty());
        assert!(generator_args("Xcode", None, 8).is_empty());
    }

    #[test]
    fn test_configure_precedence() {
        let mut config = CMakeToolsConfig::default();
        config
            .configure_settings
            .insert("OPT".into(), SettingValue::from("user"));
        config
            .configure_settings
            .insert("CMAKE_CXX_COMPILER".into(), SettingValue::from("user-cxx"));

        let mut variant = VariantOptions::for_build_type("Release");
        variant.linkage = Some(Linkage::Static);
        variant
            .settings
            .insert("OPT".into(), SettingValue::from("variant"));

        let mut kit = Kit::unspecified();
        kit.compilers.insert("CXX".into(), "/usr/bin/clang++".into());

        let settings = configure_settings(&config, &variant, &kit, Some("Ninja"), Some("/opt"));
        assert_eq!(settings["OPT"], SettingValue::from("variant"));
        assert_eq!(settings["CMAKE_CXX_COMPILER"], SettingValue::from("/usr/bin/clang++"));
        assert_eq!(settings["CMAKE_BUILD_TYPE"], SettingValue::from("Release"));
        assert_eq!(settings["BUILD_SHARED_LIBS"], SettingValue::Bool(false));
        assert_eq!(settings["CMAKE_INSTALL_PREFIX"], SettingValue::from("/opt"));
        assert_eq!(settings["CMAKE_EXPORT_COMPILE_COMMANDS"], SettingValue::Bool(true));

        let multi = configure_settings(&config, &variant, &kit, Some("Ninja Multi-Config"), None);
        assert!(!multi.contains_key("CMAKE_BUILD_TYPE"));
        assert!(!multi.contains_key("CMAKE_INSTALL_PREFIX"));
    }

    #[test]
    fn test_compose_configure_args_order() {
        let settings = BTreeMap::from([("A".to_string(), SettingValue::Bool(true))]);
        let args = compose_configure_args(
            &settings,
            &["/init.cmake".to_string()],
            &["-Wdev".to_string()],
            &["--trace".to_string()],
        );
        assert_eq!(
            args,
            vec!["--no-warn-unused-cli", "-DA:BOOL=TRUE", "-C", "/init.cmake", "-Wdev", "--trace"]
        );
    }

    #[test]
    fn test_target_names_and_ctest() {
        assert!(is_multi_config("Xcode"));
        assert!(!is_multi_config("Unix Makefiles"));
        assert_eq!(all_target_name("Visual Studio 16 2019"), "ALL_BUILD");
        assert_eq!(all_target_name("Ninja"), "all");
        assert_eq!(
            ctest_args(2, "Debug", &["-R".to_string(), "unit".to_string()]),
            vec!["-j", "2", "-C", "Debug", "-T", "test", "--output-on-failure", "-R", "unit"]
        );
    }
}
