//! Configure/build driver
//!
//! A [`CMakeDriver`] owns one build directory. It composes `cmake` arguments
//! from the active kit, variant and settings, keeps at most one configure or
//! build running, and dispatches the backend-specific work either to a
//! long-lived CMake Server session or to one-shot `cmake` invocations.
//!
//! Observable state (cache, code model, phase) lives in a snapshot that can
//! be read while an operation is running.

pub mod args;
pub mod consumer;
pub mod expand;
pub mod kit;
pub mod legacy;
pub mod server;
pub mod slot;
pub mod variant;

pub use consumer::{BuildOutputConsumer, LoggingConsumer, parse_progress};
pub use expand::{CommandExecutor, ExpansionContext};
pub use kit::{Kit, UNSPECIFIED_KIT_NAME, load_kits};
pub use legacy::LegacyBackend;
pub use server::{CmsConnector, ProcessConnector, ServerBackend};
pub use slot::{OperationSlot, SlotBusy};
pub use variant::{Linkage, VariantOptions};

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::SystemTime;
use tokio::sync::{Mutex as AsyncMutex, MutexGuard, broadcast};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::cache::{CACHE_FILE_NAME, CacheError, CmakeCache};
use crate::cms::{CmsError, CodeModel, CodeModelTarget, GlobalSettingsUpdate, ProgressEvent};
use crate::config::{CMakeToolsConfig, ConfigError, SettingValue};
use crate::generator::{FixedGenerator, Generator, GeneratorPicker, PreferredGeneratorPicker};
use crate::io::{CommandOptions, OutputConsumer, ProcessError, run_command};

/// Directory CMake keeps its per-configure state in
pub const CMAKE_FILES_DIR: &str = "CMakeFiles";

const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("Another operation is already running: {running}")]
    Busy { running: &'static str },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Driver has been disposed")]
    Disposed,

    #[error("No usable CMake generator found")]
    NoGenerator,

    #[error(
        "Build directory cache {bad_cache_path} was configured for {cached}, expected {expecting}"
    )]
    BadHomeDirectory {
        cached: PathBuf,
        expecting: PathBuf,
        bad_cache_path: PathBuf,
    },

    #[error("CMake Server error: {0}")]
    Cms(#[source] CmsError),

    #[error("Process error: {0}")]
    Process(#[from] ProcessError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Cache watcher error: {0}")]
    Watch(#[from] notify::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<CmsError> for DriverError {
    fn from(error: CmsError) -> Self {
        match error {
            CmsError::NoGenerator => Self::NoGenerator,
            CmsError::BadHomeDirectory {
                cached,
                expecting,
                bad_cache_path,
            } => Self::BadHomeDirectory {
                cached,
                expecting,
                bad_cache_path,
            },
            other => Self::Cms(other),
        }
    }
}

impl From<SlotBusy> for DriverError {
    fn from(busy: SlotBusy) -> Self {
        Self::Busy {
            running: busy.running,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Server,
    Legacy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverPhase {
    Uninitialized,
    Configuring,
    Idle,
    Building,
    Disposed,
}

/// Notifications published by a driver
#[derive(Debug, Clone, PartialEq)]
pub enum DriverEvent {
    CodeModelChanged,
    CacheReloaded,
    Reconfigured { exit_code: i32 },
    ServerCrashed { exit_code: Option<i32> },
    Progress(ProgressEvent),
    BuildProgress(u32),
    Dirty,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutableTarget {
    pub name: String,
    pub path: PathBuf,
}

/// State readable without waiting for a running operation
#[derive(Debug, Clone)]
pub struct DriverSnapshot {
    pub binary_dir: PathBuf,
    pub build_type: String,
    pub generator: Option<String>,
    pub cache: Arc<CmakeCache>,
    pub code_model: Option<Arc<CodeModel>>,
    pub phase: DriverPhase,
}

/// State shared between the driver, its backend and background tasks
pub(crate) struct DriverShared {
    snapshot: RwLock<DriverSnapshot>,
    events: broadcast::Sender<DriverEvent>,
    dirty: AtomicBool,
    inputs: Mutex<Vec<(PathBuf, Option<SystemTime>)>>,
}

impl DriverShared {
    fn new(binary_dir: PathBuf, build_type: String) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let cache = CmakeCache::missing(binary_dir.join(CACHE_FILE_NAME));
        Arc::new(Self {
            snapshot: RwLock::new(DriverSnapshot {
                binary_dir,
                build_type,
                generator: None,
                cache: Arc::new(cache),
                code_model: None,
                phase: DriverPhase::Uninitialized,
            }),
            events,
            dirty: AtomicBool::new(true),
            inputs: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn snapshot(&self) -> DriverSnapshot {
        self.snapshot
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub(crate) fn update(&self, f: impl FnOnce(&mut DriverSnapshot)) {
        let mut snapshot = self
            .snapshot
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut snapshot);
    }

    pub(crate) fn emit(&self, event: DriverEvent) {
        // No receivers is fine
        let _ = self.events.send(event);
    }

    /// Replace the cache snapshot and announce it
    pub(crate) fn set_cache(&self, cache: CmakeCache) {
        let generator = cache.generator();
        self.update(|s| {
            if generator.is_some() {
                s.generator = generator;
            }
            s.cache = Arc::new(cache);
        });
        self.emit(DriverEvent::CacheReloaded);
    }

    pub(crate) fn set_code_model(&self, model: CodeModel) {
        self.update(|s| s.code_model = Some(Arc::new(model)));
        self.emit(DriverEvent::CodeModelChanged);
    }

    pub(crate) fn mark_dirty(&self) {
        if !self.dirty.swap(true, Ordering::SeqCst) {
            debug!("Driver marked dirty");
        }
        self.emit(DriverEvent::Dirty);
    }

    pub(crate) fn set_inputs(&self, inputs: Vec<(PathBuf, Option<SystemTime>)>) {
        if let Ok(mut current) = self.inputs.lock() {
            *current = inputs;
        }
    }

    fn set_phase(&self, phase: DriverPhase) {
        self.update(|s| s.phase = phase);
    }

    async fn inputs_changed(&self) -> bool {
        let inputs = self.inputs.lock().map(|i| i.clone()).unwrap_or_default();
        for (path, recorded) in inputs {
            let current = tokio::fs::metadata(&path)
                .await
                .and_then(|m| m.modified())
                .ok();
            if current != recorded {
                debug!("CMake input changed: {}", path.display());
                return true;
            }
        }
        false
    }

    async fn needs_reconfigure(&self) -> bool {
        self.dirty.load(Ordering::SeqCst) || self.inputs_changed().await
    }
}

/// Everything a driver is created from
#[derive(Clone)]
pub struct DriverOptions {
    pub config: CMakeToolsConfig,
    pub source_dir: PathBuf,
    pub kit: Kit,
    pub variant: VariantOptions,
    /// Overrides generator selection from settings and kit
    pub generator_picker: Option<Arc<dyn GeneratorPicker>>,
    pub commands: Option<Arc<dyn CommandExecutor>>,
}

impl DriverOptions {
    pub fn new(source_dir: impl Into<PathBuf>, config: CMakeToolsConfig) -> Self {
        Self {
            config,
            source_dir: source_dir.into(),
            kit: Kit::unspecified(),
            variant: VariantOptions::default(),
            generator_picker: None,
            commands: None,
        }
    }
}

/// Settings currently in force, owned by the driver
pub(crate) struct DriverSettings {
    pub(crate) config: CMakeToolsConfig,
    pub(crate) source_dir: PathBuf,
    pub(crate) kit: Arc<Kit>,
    pub(crate) variant: VariantOptions,
    picker: Option<Arc<dyn GeneratorPicker>>,
    commands: Option<Arc<dyn CommandExecutor>>,
}

impl DriverSettings {
    fn from_options(options: DriverOptions) -> Self {
        Self {
            config: options.config,
            source_dir: options.source_dir,
            kit: Arc::new(options.kit),
            variant: options.variant,
            picker: options.generator_picker,
            commands: options.commands,
        }
    }

    fn expansion_context(&self, generator: Option<&str>) -> ExpansionContext {
        let mut variant_vars = self.config.default_variables.clone();
        variant_vars.extend(self.variant.variant_vars.clone());
        ExpansionContext {
            source_dir: self.source_dir.clone(),
            build_type: self.variant.build_type().to_string(),
            build_kit: self.kit.name.clone(),
            generator: generator.unwrap_or_default().to_string(),
            variant_vars,
            environment: self.kit.environment_variables.clone(),
            commands: self.commands.clone(),
        }
    }

    pub(crate) async fn binary_dir(&self) -> PathBuf {
        let expanded = self
            .expansion_context(None)
            .expand(&self.config.build_directory)
            .await;
        let path = PathBuf::from(expanded);
        if path.is_absolute() {
            path
        } else {
            self.source_dir.join(path)
        }
    }

    /// Variables added to the process environment: kit, settings, variant,
    /// then the operation-specific layer
    pub(crate) async fn environment(
        &self,
        layer: &BTreeMap<String, String>,
    ) -> BTreeMap<String, String> {
        let mut env = self.kit.environment_variables.clone();
        env.extend(self.config.environment.clone());
        env.extend(self.variant.env.clone());
        env.extend(layer.clone());
        self.expansion_context(None).expand_map(&env).await
    }

    pub(crate) fn generator_picker(&self) -> Arc<dyn GeneratorPicker> {
        if let Some(picker) = &self.picker {
            return Arc::clone(picker);
        }
        if let Some(name) = &self.config.generator {
            return Arc::new(FixedGenerator(Some(Generator {
                name: name.clone(),
                platform: self.config.platform.clone(),
                toolset: self.config.toolset.clone(),
            })));
        }
        Arc::new(PreferredGeneratorPicker::from_preferences(
            self.kit.preferred_generator.as_ref(),
            &self.config.preferred_generators,
        ))
    }

    async fn configure_args(&self, generator: Option<&str>, extra_args: &[String]) -> Vec<String> {
        let ctx = self.expansion_context(generator);
        let install_prefix = match &self.config.install_prefix {
            Some(prefix) => Some(ctx.expand(prefix).await),
            None => None,
        };
        let settings = args::configure_settings(
            &self.config,
            &self.variant,
            &self.kit,
            generator,
            install_prefix.as_deref(),
        );
        let mut expanded = BTreeMap::new();
        for (key, value) in settings {
            expanded.insert(key, expand_setting(&ctx, value).await);
        }
        args::compose_configure_args(
            &expanded,
            &ctx.expand_all(&self.config.cache_init).await,
            &ctx.expand_all(&self.config.configure_args).await,
            &ctx.expand_all(extra_args).await,
        )
    }

    async fn build_args(&self, binary_dir: &Path, generator: &str, target: &str) -> Vec<String> {
        let ctx = self.expansion_context(Some(generator));
        let build_args = ctx.expand_all(&self.config.build_args).await;
        let build_tool_args = ctx.expand_all(&self.config.build_tool_args).await;
        args::build_args(&args::BuildRequest {
            binary_dir,
            build_type: self.variant.build_type(),
            target: Some(target),
            generator,
            jobs: self.config.num_jobs(),
            build_args: &build_args,
            build_tool_args: &build_tool_args,
        })
    }
}

async fn expand_setting(ctx: &ExpansionContext, value: SettingValue) -> SettingValue {
    match value {
        SettingValue::String(s) => SettingValue::String(ctx.expand(&s).await),
        SettingValue::List(items) => SettingValue::List(ctx.expand_all(&items).await),
        other => other,
    }
}

/// Delete `CMakeCache.txt` and `CMakeFiles/` from a build directory
pub async fn remove_cache_files(binary_dir: &Path) -> Result<(), std::io::Error> {
    let cache = binary_dir.join(CACHE_FILE_NAME);
    match tokio::fs::remove_file(&cache).await {
        Ok(()) => info!("Removed {}", cache.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    let files = binary_dir.join(CMAKE_FILES_DIR);
    match tokio::fs::remove_dir_all(&files).await {
        Ok(()) => info!("Removed {}", files.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    Ok(())
}

pub(crate) enum Backend {
    Server(ServerBackend),
    Legacy(LegacyBackend),
}

impl Backend {
    fn kind(&self) -> BackendKind {
        match self {
            Self::Server(_) => BackendKind::Server,
            Self::Legacy(_) => BackendKind::Legacy,
        }
    }

    async fn start(
        &mut self,
        settings: &DriverSettings,
        shared: &Arc<DriverShared>,
    ) -> Result<(), DriverError> {
        match self {
            Self::Server(backend) => backend.start(settings, shared).await,
            Self::Legacy(backend) => backend.start(shared).await,
        }
    }

    async fn do_configure(
        &mut self,
        settings: &DriverSettings,
        shared: &Arc<DriverShared>,
        args: Vec<String>,
        consumer: Arc<dyn OutputConsumer>,
        cancel: CancellationToken,
    ) -> Result<i32, DriverError> {
        match self {
            Self::Server(backend) => {
                backend
                    .configure(settings, shared, args, consumer, cancel)
                    .await
            }
            Self::Legacy(backend) => {
                backend
                    .configure(settings, shared, args, consumer, cancel)
                    .await
            }
        }
    }

    async fn do_post_build(&mut self, settings: &DriverSettings, shared: &Arc<DriverShared>) {
        if let Self::Server(backend) = self {
            backend.post_build(settings, shared).await;
        }
    }

    /// Release everything tied to the current build directory
    async fn shutdown(&mut self) {
        match self {
            Self::Server(backend) => backend.shutdown().await,
            Self::Legacy(backend) => backend.shutdown(),
        }
    }
}

struct DriverInner {
    settings: DriverSettings,
    backend: Backend,
}

/// Driver for one source/build directory pair
pub struct CMakeDriver {
    inner: AsyncMutex<DriverInner>,
    shared: Arc<DriverShared>,
    slot: OperationSlot,
    kind: BackendKind,
}

impl CMakeDriver {
    /// Driver backed by a CMake Server session, started immediately so that
    /// handshake failures surface here
    pub async fn create_server(
        options: DriverOptions,
        connector: Arc<dyn CmsConnector>,
    ) -> Result<Self, DriverError> {
        Self::create(options, Backend::Server(ServerBackend::new(connector))).await
    }

    /// Driver running `cmake` once per configure
    pub async fn create_legacy(options: DriverOptions) -> Result<Self, DriverError> {
        Self::create(options, Backend::Legacy(LegacyBackend::new())).await
    }

    #[instrument(name = "driver_create", skip_all, fields(source_dir = %options.source_dir.display()))]
    async fn create(options: DriverOptions, mut backend: Backend) -> Result<Self, DriverError> {
        options.config.validate()?;
        let auto_restart = options.config.auto_restart_build;
        let settings = DriverSettings::from_options(options);
        let binary_dir = settings.binary_dir().await;
        let shared = DriverShared::new(binary_dir.clone(), settings.variant.build_type().to_string());

        let cache = CmakeCache::from_path(binary_dir.join(CACHE_FILE_NAME)).await?;
        if cache.exists() {
            shared.set_cache(cache);
        }

        backend.start(&settings, &shared).await?;
        shared.set_phase(DriverPhase::Idle);

        let kind = backend.kind();
        info!(
            "Created {:?} driver for {} (build directory {})",
            kind,
            settings.source_dir.display(),
            binary_dir.display()
        );
        Ok(Self {
            inner: AsyncMutex::new(DriverInner { settings, backend }),
            shared,
            slot: OperationSlot::new(auto_restart),
            kind,
        })
    }

    pub fn kind(&self) -> BackendKind {
        self.kind
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DriverEvent> {
        self.shared.events.subscribe()
    }

    pub fn snapshot(&self) -> DriverSnapshot {
        self.shared.snapshot()
    }

    pub fn phase(&self) -> DriverPhase {
        self.shared.snapshot().phase
    }

    pub fn binary_dir(&self) -> PathBuf {
        self.shared.snapshot().binary_dir
    }

    pub fn cache_path(&self) -> PathBuf {
        self.binary_dir().join(CACHE_FILE_NAME)
    }

    pub fn cache(&self) -> Arc<CmakeCache> {
        self.shared.snapshot().cache
    }

    pub fn generator(&self) -> Option<String> {
        self.shared.snapshot().generator
    }

    pub fn current_build_type(&self) -> String {
        self.shared.snapshot().build_type
    }

    pub fn code_model(&self) -> Option<Arc<CodeModel>> {
        self.shared.snapshot().code_model
    }

    pub fn all_target_name(&self) -> &'static str {
        args::all_target_name(self.generator().as_deref().unwrap_or_default())
    }

    /// Targets of the configuration matching the current build type
    fn active_targets(&self) -> Vec<CodeModelTarget> {
        let snapshot = self.shared.snapshot();
        let Some(model) = snapshot.code_model else {
            return Vec::new();
        };
        let configuration = if model.configurations.len() == 1 {
            model.configurations.first()
        } else {
            model
                .configurations
                .iter()
                .find(|c| c.name == snapshot.build_type)
        };
        configuration
            .map(|c| {
                c.projects
                    .iter()
                    .flat_map(|p| p.targets.iter().cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn targets(&self) -> Vec<String> {
        self.active_targets().into_iter().map(|t| t.name).collect()
    }

    pub fn executable_targets(&self) -> Vec<ExecutableTarget> {
        self.active_targets()
            .into_iter()
            .filter(CodeModelTarget::is_executable)
            .filter_map(|t| {
                let path = t.artifacts.first()?.clone();
                Some(ExecutableTarget {
                    name: t.name,
                    path: PathBuf::from(path),
                })
            })
            .collect()
    }

    async fn lock_inner(&self) -> Result<MutexGuard<'_, DriverInner>, DriverError> {
        let inner = self.inner.lock().await;
        if self.phase() == DriverPhase::Disposed {
            return Err(DriverError::Disposed);
        }
        Ok(inner)
    }

    pub async fn check_needs_reconfigure(&self) -> bool {
        self.shared.needs_reconfigure().await
    }

    /// Configure with `extra_args` appended; returns cmake's exit code
    pub async fn configure(
        &self,
        extra_args: &[String],
        consumer: Arc<dyn OutputConsumer>,
    ) -> Result<i32, DriverError> {
        let guard = self.slot.acquire("configure").await?;
        let mut inner = self.lock_inner().await?;
        self.configure_locked(&mut inner, extra_args, consumer, guard.token())
            .await
    }

    async fn configure_locked(
        &self,
        inner: &mut DriverInner,
        extra_args: &[String],
        consumer: Arc<dyn OutputConsumer>,
        cancel: CancellationToken,
    ) -> Result<i32, DriverError> {
        let DriverInner { settings, backend } = inner;
        let generator = self.shared.snapshot().generator;
        let args = settings
            .configure_args(generator.as_deref(), extra_args)
            .await;

        self.shared.set_phase(DriverPhase::Configuring);
        let result = backend
            .do_configure(settings, &self.shared, args, consumer, cancel)
            .await;
        self.shared.set_phase(DriverPhase::Idle);

        let exit_code = result?;
        if exit_code == 0 {
            self.shared.dirty.store(false, Ordering::SeqCst);
        } else {
            warn!("Configure failed with exit code {}", exit_code);
        }
        self.shared.emit(DriverEvent::Reconfigured { exit_code });
        Ok(exit_code)
    }

    /// Wipe the cache and configure from scratch
    pub async fn clean_configure(
        &self,
        consumer: Arc<dyn OutputConsumer>,
    ) -> Result<i32, DriverError> {
        let guard = self.slot.acquire("configure").await?;
        let mut inner = self.lock_inner().await?;
        let binary_dir = self.binary_dir();
        info!("Clean configure of {}", binary_dir.display());

        inner.backend.shutdown().await;
        remove_cache_files(&binary_dir).await?;
        self.shared.update(|s| {
            s.cache = Arc::new(CmakeCache::missing(binary_dir.join(CACHE_FILE_NAME)));
            s.code_model = None;
            s.generator = None;
        });
        self.shared.set_inputs(Vec::new());
        self.shared.mark_dirty();

        let DriverInner { settings, backend } = &mut *inner;
        backend.start(settings, &self.shared).await?;
        self.configure_locked(&mut inner, &[], consumer, guard.token())
            .await
    }

    /// Build `target` (the all-target when `None`), configuring first if
    /// the build directory is out of date
    pub async fn build(
        &self,
        target: Option<&str>,
        consumer: Arc<dyn OutputConsumer>,
    ) -> Result<i32, DriverError> {
        let guard = self.slot.acquire("build").await?;
        let mut inner = self.lock_inner().await?;
        let cancel = guard.token();

        if self.shared.needs_reconfigure().await {
            info!("Build directory is out of date, configuring first");
            let exit_code = self
                .configure_locked(&mut inner, &[], Arc::clone(&consumer), cancel.clone())
                .await?;
            if exit_code != 0 {
                return Ok(exit_code);
            }
        }

        let snapshot = self.shared.snapshot();
        let generator = snapshot.generator.unwrap_or_default();
        let target = target
            .map(str::to_string)
            .unwrap_or_else(|| args::all_target_name(&generator).to_string());

        let DriverInner { settings, backend } = &mut *inner;
        let args = settings
            .build_args(&snapshot.binary_dir, &generator, &target)
            .await;
        let options = CommandOptions {
            cwd: Some(snapshot.binary_dir.clone()),
            environment: settings
                .environment(&settings.config.build_environment)
                .await,
        };
        let events = Arc::clone(&self.shared);
        let build_consumer: Arc<dyn OutputConsumer> = Arc::new(BuildOutputConsumer::new(
            consumer,
            Some(Arc::new(move |percent: u32| {
                events.emit(DriverEvent::BuildProgress(percent))
            })),
        ));

        info!("Building target {} in {}", target, snapshot.binary_dir.display());
        self.shared.set_phase(DriverPhase::Building);
        let outcome = run_command(
            &settings.config.cmake_path,
            &args,
            &options,
            Some(build_consumer),
            cancel,
        )
        .await;
        self.shared.set_phase(DriverPhase::Idle);

        let outcome = outcome?;
        if outcome.cancelled {
            return Err(DriverError::Cancelled);
        }
        backend.do_post_build(settings, &self.shared).await;
        Ok(outcome.retc())
    }

    pub async fn install(&self, consumer: Arc<dyn OutputConsumer>) -> Result<i32, DriverError> {
        self.build(Some("install"), consumer).await
    }

    pub async fn clean(&self, consumer: Arc<dyn OutputConsumer>) -> Result<i32, DriverError> {
        self.build(Some("clean"), consumer).await
    }

    /// Run `ctest` in the build directory
    pub async fn ctest(&self, consumer: Arc<dyn OutputConsumer>) -> Result<i32, DriverError> {
        let guard = self.slot.acquire("test").await?;
        let inner = self.lock_inner().await?;
        let settings = &inner.settings;
        let binary_dir = self.binary_dir();

        let ctx = settings.expansion_context(self.generator().as_deref());
        let extra = ctx.expand_all(&settings.config.ctest_args).await;
        let args = args::ctest_args(
            settings.config.num_ctest_jobs(),
            settings.variant.build_type(),
            &extra,
        );
        let options = CommandOptions {
            cwd: Some(binary_dir),
            environment: settings
                .environment(&settings.config.test_environment)
                .await,
        };
        let outcome = run_command(
            &settings.config.ctest_path,
            &args,
            &options,
            Some(consumer),
            guard.token(),
        )
        .await?;
        if outcome.cancelled {
            return Err(DriverError::Cancelled);
        }
        Ok(outcome.retc())
    }

    /// Switch kits. A different build directory or an incompatible
    /// toolchain restarts the backend; a toolchain change also wipes the cache.
    pub async fn set_kit(&self, kit: Kit) -> Result<(), DriverError> {
        let mut inner = self.lock_inner().await?;
        let DriverInner { settings, backend } = &mut *inner;
        if *settings.kit == kit {
            return Ok(());
        }

        let needs_clean = kit.needs_clean_from(&settings.kit);
        let old_binary_dir = self.binary_dir();
        info!("Switching kit from {} to {}", settings.kit.name, kit.name);
        settings.kit = Arc::new(kit);
        let new_binary_dir = settings.binary_dir().await;

        let reset_state = needs_clean || new_binary_dir != old_binary_dir;
        // The server process inherits the kit environment, so any change restarts it.
        if reset_state || matches!(backend, Backend::Server(_)) {
            backend.shutdown().await;
            if needs_clean {
                remove_cache_files(&new_binary_dir).await?;
            }
            if reset_state {
                let cache = CmakeCache::from_path(new_binary_dir.join(CACHE_FILE_NAME)).await?;
                self.shared.update(|s| {
                    s.binary_dir = new_binary_dir;
                    s.generator = None;
                    s.code_model = None;
                });
                self.shared.set_inputs(Vec::new());
                self.shared.set_cache(cache);
            }
            backend.start(settings, &self.shared).await?;
        }
        self.shared.mark_dirty();
        Ok(())
    }

    pub async fn set_variant_options(&self, variant: VariantOptions) -> Result<(), DriverError> {
        let mut inner = self.lock_inner().await?;
        if inner.settings.variant == variant {
            return Ok(());
        }
        let build_type = variant.build_type().to_string();
        inner.settings.variant = variant;
        self.shared.update(|s| s.build_type = build_type);
        self.shared.mark_dirty();
        Ok(())
    }

    /// Environment for programs launched from the build tree
    pub async fn launch_environment(&self) -> Result<BTreeMap<String, String>, DriverError> {
        let inner = self.lock_inner().await?;
        Ok(inner.settings.environment(&BTreeMap::new()).await)
    }

    pub async fn kit(&self) -> Result<Arc<Kit>, DriverError> {
        let inner = self.lock_inner().await?;
        Ok(Arc::clone(&inner.settings.kit))
    }

    /// Change CMake Server global settings; `false` for the command-line
    /// backend, which has none
    pub async fn set_server_settings(
        &self,
        update: &GlobalSettingsUpdate,
    ) -> Result<bool, DriverError> {
        let mut inner = self.lock_inner().await?;
        let DriverInner { settings, backend } = &mut *inner;
        match backend {
            Backend::Server(server) => {
                server
                    .set_global_settings(settings, &self.shared, update)
                    .await?;
                Ok(true)
            }
            Backend::Legacy(_) => Ok(false),
        }
    }

    pub fn set_auto_restart(&self, enabled: bool) {
        self.slot.set_auto_restart(enabled);
    }

    /// Cancel the running configure/build; `false` if nothing was running
    pub fn stop_current(&self) -> bool {
        self.slot.cancel_current()
    }

    /// Stop everything and release the build directory
    pub async fn dispose(&self) {
        self.slot.cancel_current();
        let mut inner = self.inner.lock().await;
        if self.phase() == DriverPhase::Disposed {
            return;
        }
        inner.backend.shutdown().await;
        self.shared.set_phase(DriverPhase::Disposed);
        debug!("Driver for {} disposed", self.binary_dir().display());
    }
}
