//! Project-level orchestration
//!
//! [`CMakeTools`] owns at most one [`CMakeDriver`] for a source directory.
//! Driver creation goes through a single async lock so concurrent callers
//! share one driver instead of racing to start two. Creation failures with
//! a remedy (a cache from another source tree) are handled here; the rest
//! propagate to the caller.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use crate::cache::CmakeCache;
use crate::config::CMakeToolsConfig;
use crate::driver::{
    BackendKind, CMakeDriver, CmsConnector, CommandExecutor, DriverError, DriverOptions, Kit,
    LoggingConsumer, ProcessConnector, VariantOptions, remove_cache_files,
};
use crate::generator::GeneratorPicker;
use crate::io::OutputConsumer;
use crate::version::{CmakeVersion, VersionError};

#[derive(Debug, thiserror::Error)]
pub enum ToolsError {
    #[error(
        "No usable CMake generator found; install Ninja or Make, or set \"generator\" in the settings"
    )]
    NoGenerator,

    #[error("Unknown executable target: {0}")]
    UnknownTarget(String),

    #[error("Project has no executable targets to debug")]
    NoExecutableTargets,

    #[error(transparent)]
    Driver(DriverError),
}

impl From<DriverError> for ToolsError {
    fn from(error: DriverError) -> Self {
        match error {
            DriverError::NoGenerator => Self::NoGenerator,
            other => Self::Driver(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MiMode {
    Gdb,
    Lldb,
}

impl MiMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Gdb => "gdb",
            Self::Lldb => "lldb",
        }
    }
}

/// What a debugger front end needs to launch a target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebugLaunch {
    pub name: String,
    pub program: PathBuf,
    pub cwd: PathBuf,
    pub mi_mode: MiMode,
    pub debugger_path: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
}

/// Pick a debugger matching the compiler
///
/// Clang on macOS pairs with lldb. Otherwise gdb, preferring one installed
/// next to the compiler (cross toolchains ship their own).
pub fn debugger_for(compiler: Option<&Path>, macos: bool) -> (MiMode, Option<PathBuf>) {
    let is_clang = compiler
        .and_then(|c| c.file_name())
        .is_some_and(|n| n.to_string_lossy().contains("clang"));
    if macos && is_clang {
        return (MiMode::Lldb, None);
    }

    let sibling = compiler
        .and_then(Path::parent)
        .map(|dir| dir.join(if cfg!(windows) { "gdb.exe" } else { "gdb" }))
        .filter(|gdb| gdb.is_file());
    let debugger = sibling.or_else(|| which::which("gdb").ok());
    (MiMode::Gdb, debugger)
}

struct ToolsSettings {
    config: CMakeToolsConfig,
    kit: Kit,
    variant: VariantOptions,
}

pub struct CMakeTools {
    source_dir: PathBuf,
    settings: Mutex<ToolsSettings>,
    /// Serializes driver creation and replacement
    driver: AsyncMutex<Option<Arc<CMakeDriver>>>,
    connector: Arc<dyn CmsConnector>,
    generator_picker: Option<Arc<dyn GeneratorPicker>>,
    commands: Option<Arc<dyn CommandExecutor>>,
    consumer: Arc<dyn OutputConsumer>,
    cmake_version: Mutex<Option<CmakeVersion>>,
    clean_stale_cache: bool,
}

impl CMakeTools {
    pub fn new(source_dir: impl Into<PathBuf>, config: CMakeToolsConfig) -> Self {
        Self {
            source_dir: source_dir.into(),
            settings: Mutex::new(ToolsSettings {
                config,
                kit: Kit::unspecified(),
                variant: VariantOptions::default(),
            }),
            driver: AsyncMutex::new(None),
            connector: Arc::new(ProcessConnector),
            generator_picker: None,
            commands: None,
            consumer: Arc::new(LoggingConsumer::new("cmake")),
            cmake_version: Mutex::new(None),
            clean_stale_cache: true,
        }
    }

    pub fn with_kit(self, kit: Kit) -> Self {
        self.update_settings(|s| s.kit = kit);
        self
    }

    pub fn with_variant(self, variant: VariantOptions) -> Self {
        self.update_settings(|s| s.variant = variant);
        self
    }

    pub fn with_connector(mut self, connector: Arc<dyn CmsConnector>) -> Self {
        self.connector = connector;
        self
    }

    pub fn with_generator_picker(mut self, picker: Arc<dyn GeneratorPicker>) -> Self {
        self.generator_picker = Some(picker);
        self
    }

    pub fn with_command_executor(mut self, commands: Arc<dyn CommandExecutor>) -> Self {
        self.commands = Some(commands);
        self
    }

    pub fn with_consumer(mut self, consumer: Arc<dyn OutputConsumer>) -> Self {
        self.consumer = consumer;
        self
    }

    /// Skip `cmake --version` and assume this version
    pub fn with_cmake_version(self, version: CmakeVersion) -> Self {
        if let Ok(mut current) = self.cmake_version.lock() {
            *current = Some(version);
        }
        self
    }

    /// Whether a cache belonging to another source tree is deleted automatically
    pub fn with_clean_stale_cache(mut self, enabled: bool) -> Self {
        self.clean_stale_cache = enabled;
        self
    }

    pub fn source_dir(&self) -> &Path {
        &self.source_dir
    }

    fn update_settings(&self, f: impl FnOnce(&mut ToolsSettings)) {
        let mut settings = self
            .settings
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut settings);
    }

    fn driver_options(&self) -> DriverOptions {
        let settings = self
            .settings
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        DriverOptions {
            config: settings.config.clone(),
            source_dir: self.source_dir.clone(),
            kit: settings.kit.clone(),
            variant: settings.variant.clone(),
            generator_picker: self.generator_picker.clone(),
            commands: self.commands.clone(),
        }
    }

    async fn cmake_version(&self, cmake_path: &str) -> Result<CmakeVersion, VersionError> {
        if let Some(version) = self.cmake_version.lock().ok().and_then(|v| v.clone()) {
            return Ok(version);
        }
        let version = CmakeVersion::detect(cmake_path).await?;
        debug!("Detected CMake {}", version);
        if let Ok(mut current) = self.cmake_version.lock() {
            *current = Some(version.clone());
        }
        Ok(version)
    }

    /// Backend to use for the current settings
    pub async fn select_backend(&self) -> BackendKind {
        let config = self.driver_options().config;
        if !config.use_cmake_server {
            return BackendKind::Legacy;
        }
        match self.cmake_version(&config.cmake_path).await {
            Ok(version) if version.supports_server_mode() => BackendKind::Server,
            Ok(version) => {
                warn!(
                    "CMake {} does not support server mode, falling back to command-line driver",
                    version
                );
                BackendKind::Legacy
            }
            Err(e) => {
                warn!(
                    "Could not determine CMake version ({}), falling back to command-line driver",
                    e
                );
                BackendKind::Legacy
            }
        }
    }

    async fn try_create(&self, kind: BackendKind) -> Result<CMakeDriver, DriverError> {
        let options = self.driver_options();
        match kind {
            BackendKind::Server => {
                CMakeDriver::create_server(options, Arc::clone(&self.connector)).await
            }
            BackendKind::Legacy => CMakeDriver::create_legacy(options).await,
        }
    }

    async fn create_driver(&self) -> Result<CMakeDriver, ToolsError> {
        let kind = self.select_backend().await;
        match self.try_create(kind).await {
            Err(DriverError::BadHomeDirectory {
                cached,
                expecting,
                bad_cache_path,
            }) if self.clean_stale_cache => {
                warn!(
                    "Cache {} belongs to {}, not {}; removing it and configuring from scratch",
                    bad_cache_path.display(),
                    cached.display(),
                    expecting.display()
                );
                let binary_dir = bad_cache_path
                    .parent()
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|| self.source_dir.clone());
                remove_cache_files(&binary_dir)
                    .await
                    .map_err(DriverError::from)?;
                Ok(self.try_create(kind).await?)
            }
            result => Ok(result?),
        }
    }

    /// The current driver, created on first use
    pub async fn driver(&self) -> Result<Arc<CMakeDriver>, ToolsError> {
        let mut slot = self.driver.lock().await;
        if let Some(driver) = slot.as_ref() {
            return Ok(Arc::clone(driver));
        }
        let driver = Arc::new(self.create_driver().await?);
        *slot = Some(Arc::clone(&driver));
        Ok(driver)
    }

    /// The current driver without creating one
    pub async fn current_driver(&self) -> Option<Arc<CMakeDriver>> {
        self.driver.lock().await.clone()
    }

    pub async fn configure(&self, extra_args: &[String]) -> Result<i32, ToolsError> {
        let driver = self.driver().await?;
        Ok(driver
            .configure(extra_args, Arc::clone(&self.consumer))
            .await?)
    }

    pub async fn clean_configure(&self) -> Result<i32, ToolsError> {
        let driver = self.driver().await?;
        Ok(driver.clean_configure(Arc::clone(&self.consumer)).await?)
    }

    pub async fn build(&self, target: Option<&str>) -> Result<i32, ToolsError> {
        let driver = self.driver().await?;
        Ok(driver.build(target, Arc::clone(&self.consumer)).await?)
    }

    pub async fn install(&self) -> Result<i32, ToolsError> {
        let driver = self.driver().await?;
        Ok(driver.install(Arc::clone(&self.consumer)).await?)
    }

    pub async fn clean(&self) -> Result<i32, ToolsError> {
        let driver = self.driver().await?;
        Ok(driver.clean(Arc::clone(&self.consumer)).await?)
    }

    pub async fn ctest(&self) -> Result<i32, ToolsError> {
        let driver = self.driver().await?;
        Ok(driver.ctest(Arc::clone(&self.consumer)).await?)
    }

    pub async fn cache(&self) -> Result<Arc<CmakeCache>, ToolsError> {
        Ok(self.driver().await?.cache())
    }

    pub async fn set_kit(&self, kit: Kit) -> Result<(), ToolsError> {
        self.update_settings(|s| s.kit = kit.clone());
        if let Some(driver) = self.current_driver().await {
            driver.set_kit(kit).await?;
        }
        Ok(())
    }

    pub async fn set_variant(&self, variant: VariantOptions) -> Result<(), ToolsError> {
        self.update_settings(|s| s.variant = variant.clone());
        if let Some(driver) = self.current_driver().await {
            driver.set_variant_options(variant).await?;
        }
        Ok(())
    }

    /// Replace the settings; the driver is recreated on next use
    pub async fn set_config(&self, config: CMakeToolsConfig) {
        self.update_settings(|s| s.config = config);
        if let Some(driver) = self.driver.lock().await.take() {
            info!("Settings changed, disposing driver");
            driver.dispose().await;
        }
    }

    /// Cancel the running configure/build
    pub async fn stop(&self) -> bool {
        match self.current_driver().await {
            Some(driver) => driver.stop_current(),
            None => false,
        }
    }

    /// Launch description for an executable target, or the only one when
    /// `name` is `None`
    pub async fn debug_target(&self, name: Option<&str>) -> Result<DebugLaunch, ToolsError> {
        let driver = self.driver().await?;
        let targets = driver.executable_targets();
        let target = match name {
            Some(name) => targets
                .into_iter()
                .find(|t| t.name == name)
                .ok_or_else(|| ToolsError::UnknownTarget(name.to_string()))?,
            None => targets
                .into_iter()
                .next()
                .ok_or(ToolsError::NoExecutableTargets)?,
        };

        let kit = driver.kit().await?;
        let compiler = driver
            .cache()
            .get("CMAKE_CXX_COMPILER")
            .map(|e| PathBuf::from(e.as_string()))
            .or_else(|| kit.compilers.get("CXX").map(PathBuf::from));
        let (mi_mode, debugger_path) = debugger_for(compiler.as_deref(), cfg!(target_os = "macos"));

        let cwd = target
            .path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| driver.binary_dir());
        Ok(DebugLaunch {
            name: target.name,
            program: target.path,
            cwd,
            mi_mode,
            debugger_path,
            env: driver.launch_environment().await?,
        })
    }

    pub async fn dispose(&self) {
        if let Some(driver) = self.driver.lock().await.take() {
            driver.dispose().await;
        }
    }
}
