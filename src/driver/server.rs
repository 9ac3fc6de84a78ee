//! CMake Server backend
//!
//! Keeps one [`CmsClient`] per build directory. A client that crashed or
//! lost its connection is discarded and a new one is started on next use.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Instant, SystemTime};
use tokio_util::sync::CancellationToken;
use tracing::{Level, debug, info, warn};

use crate::cache::{CACHE_FILE_NAME, CmakeCache};
use crate::cms::{
    ClientParams, CmakeInputs, CmsClient, CmsError, CmsHandlers, GlobalSettingsUpdate, ProgressEvent,
};
use crate::driver::{DriverError, DriverEvent, DriverSettings, DriverShared};
use crate::io::OutputConsumer;
use crate::log_timing;

/// Produces connected, handshaken clients
#[async_trait]
pub trait CmsConnector: Send + Sync {
    async fn connect(&self, params: ClientParams) -> Result<CmsClient, CmsError>;
}

/// Spawns `cmake -E server` for every connection
pub struct ProcessConnector;

#[async_trait]
impl CmsConnector for ProcessConnector {
    async fn connect(&self, params: ClientParams) -> Result<CmsClient, CmsError> {
        CmsClient::start(params).await
    }
}

type ConsumerSlot = Arc<Mutex<Option<Arc<dyn OutputConsumer>>>>;

pub struct ServerBackend {
    connector: Arc<dyn CmsConnector>,
    client: Option<CmsClient>,
    crashed: Arc<AtomicBool>,
    /// Receives `message` traffic while a configure runs
    consumer: ConsumerSlot,
}

fn set_consumer(slot: &ConsumerSlot, consumer: Option<Arc<dyn OutputConsumer>>) {
    if let Ok(mut current) = slot.lock() {
        *current = consumer;
    }
}

impl ServerBackend {
    pub fn new(connector: Arc<dyn CmsConnector>) -> Self {
        Self {
            connector,
            client: None,
            crashed: Arc::new(AtomicBool::new(false)),
            consumer: Arc::new(Mutex::new(None)),
        }
    }

    fn handlers(&self, shared: &Arc<DriverShared>) -> CmsHandlers {
        let progress_shared = Arc::clone(shared);
        let dirty_shared = Arc::clone(shared);
        let crash_shared = Arc::clone(shared);
        let crashed = Arc::clone(&self.crashed);
        let consumer = Arc::clone(&self.consumer);

        CmsHandlers {
            on_progress: Some(Arc::new(move |event: ProgressEvent| {
                progress_shared.emit(DriverEvent::Progress(event));
            })),
            on_message: Some(Arc::new(move |message: &str, title: Option<&str>| {
                let current = consumer.lock().ok().and_then(|c| c.clone());
                match current {
                    Some(consumer) => {
                        for line in message.lines() {
                            consumer.output(line);
                        }
                    }
                    None => info!(target: "cmake_output", "{}{}", title.map(|t| format!("{t}: ")).unwrap_or_default(), message),
                }
            })),
            on_dirty: Some(Arc::new(move || {
                debug!("CMake Server reports the build directory is dirty");
                dirty_shared.mark_dirty();
            })),
            on_crash: Some(Arc::new(move |exit_code: Option<i32>| {
                warn!("CMake Server crashed (exit code {:?})", exit_code);
                crashed.store(true, Ordering::SeqCst);
                crash_shared.emit(DriverEvent::ServerCrashed { exit_code });
            })),
        }
    }

    /// Start a client unless a healthy one exists
    async fn ensure_client(
        &mut self,
        settings: &DriverSettings,
        shared: &Arc<DriverShared>,
    ) -> Result<(), DriverError> {
        let crashed = self.crashed.swap(false, Ordering::SeqCst);
        if crashed || self.client.as_ref().is_some_and(|c| !c.is_alive()) {
            info!("Discarding unusable CMake Server session");
            self.discard().await;
        }
        if self.client.is_some() {
            return Ok(());
        }

        let started = Instant::now();
        let params = ClientParams {
            cmake_path: settings.config.cmake_path.clone(),
            source_dir: settings.source_dir.clone(),
            binary_dir: shared.snapshot().binary_dir,
            environment: settings
                .environment(&settings.config.configure_environment)
                .await,
            generator_picker: settings.generator_picker(),
            handlers: self.handlers(shared),
        };
        let client = self.connector.connect(params).await?;

        match client.get_global_settings().await {
            Ok(global) if !global.generator.is_empty() => {
                shared.update(|s| s.generator = Some(global.generator));
            }
            Ok(_) => {}
            Err(e) => warn!("Could not read CMake Server global settings: {}", e),
        }
        log_timing!(Level::DEBUG, "cms_session_start", started.elapsed());
        self.client = Some(client);
        Ok(())
    }

    pub(crate) async fn start(
        &mut self,
        settings: &DriverSettings,
        shared: &Arc<DriverShared>,
    ) -> Result<(), DriverError> {
        self.ensure_client(settings, shared).await
    }

    pub(crate) async fn configure(
        &mut self,
        settings: &DriverSettings,
        shared: &Arc<DriverShared>,
        args: Vec<String>,
        consumer: Arc<dyn OutputConsumer>,
        cancel: CancellationToken,
    ) -> Result<i32, DriverError> {
        self.ensure_client(settings, shared).await?;
        let Some(client) = self.client.as_ref() else {
            return Err(CmsError::ConnectionClosed.into());
        };

        set_consumer(&self.consumer, Some(Arc::clone(&consumer)));
        let result = tokio::select! {
            result = async {
                client.configure(args).await?;
                client.compute().await
            } => Some(result),
            _ = cancel.cancelled() => None,
        };
        set_consumer(&self.consumer, None);

        let Some(result) = result else {
            info!("Configure cancelled, stopping CMake Server");
            self.discard().await;
            return Err(DriverError::Cancelled);
        };

        match result {
            Ok(()) => {
                self.refresh(settings, shared).await?;
                Ok(0)
            }
            Err(CmsError::Server { message, .. }) => {
                for line in message.lines() {
                    consumer.error(line);
                }
                Ok(-1)
            }
            Err(e) if e.is_fatal() => {
                warn!("CMake Server session lost during configure: {}", e);
                self.discard().await;
                Err(e.into())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Reload inputs, cache and code model from the server
    async fn refresh(
        &self,
        settings: &DriverSettings,
        shared: &Arc<DriverShared>,
    ) -> Result<(), DriverError> {
        let Some(client) = self.client.as_ref() else {
            return Ok(());
        };

        let inputs = client.cmake_inputs().await?;
        let files = input_files(&inputs, &settings.source_dir);
        shared.set_inputs(record_mtimes(files).await);

        let content = client.get_cmake_cache_content().await?;
        let entries: HashMap<_, _> = content
            .cache
            .iter()
            .filter_map(|e| e.to_cache_entry())
            .map(|e| (e.key().to_string(), e))
            .collect();
        let cache_path = shared.snapshot().binary_dir.join(CACHE_FILE_NAME);
        shared.set_cache(CmakeCache::from_entries(cache_path, entries));

        let model = client.codemodel().await?;
        debug!(
            "Code model has {} configuration(s)",
            model.configurations.len()
        );
        shared.set_code_model(model);
        Ok(())
    }

    pub(crate) async fn post_build(&mut self, settings: &DriverSettings, shared: &Arc<DriverShared>) {
        if self.client.as_ref().is_some_and(CmsClient::is_alive) {
            if let Err(e) = self.refresh(settings, shared).await {
                warn!("Could not refresh project state after build: {}", e);
            }
        }
    }

    /// Forward a settings change (`trace`, `debugOutput`, ...) to the server
    pub(crate) async fn set_global_settings(
        &mut self,
        settings: &DriverSettings,
        shared: &Arc<DriverShared>,
        update: &GlobalSettingsUpdate,
    ) -> Result<(), DriverError> {
        self.ensure_client(settings, shared).await?;
        match self.client.as_ref() {
            Some(client) => Ok(client.set_global_settings(update).await?),
            None => Err(CmsError::ConnectionClosed.into()),
        }
    }

    async fn discard(&mut self) {
        if let Some(client) = self.client.take() {
            if let Err(e) = client.shutdown().await {
                debug!("Error shutting down CMake Server: {}", e);
            }
        }
    }

    pub(crate) async fn shutdown(&mut self) {
        self.discard().await;
        self.crashed.store(false, Ordering::SeqCst);
    }
}

/// Non-temporary build files, made absolute
fn input_files(inputs: &CmakeInputs, fallback_source: &Path) -> Vec<PathBuf> {
    let source = if inputs.source_directory.is_empty() {
        fallback_source.to_path_buf()
    } else {
        PathBuf::from(&inputs.source_directory)
    };
    inputs
        .build_files
        .iter()
        .filter(|group| !group.is_temporary)
        .flat_map(|group| group.sources.iter())
        .map(|file| {
            let path = Path::new(file);
            if path.is_absolute() {
                path.to_path_buf()
            } else {
                source.join(path)
            }
        })
        .collect()
}

async fn record_mtimes(files: Vec<PathBuf>) -> Vec<(PathBuf, Option<SystemTime>)> {
    let mut recorded = Vec::with_capacity(files.len());
    for file in files {
        let mtime = tokio::fs::metadata(&file)
            .await
            .and_then(|m| m.modified())
            .ok();
        recorded.push((file, mtime));
    }
    recorded
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cms::protocol::BuildFiles;

    #[test]
    fn test_input_files_skip_temporary() {
        let inputs = CmakeInputs {
            build_files: vec![
                BuildFiles {
                    is_cmake: false,
                    is_temporary: false,
                    sources: vec!["CMakeLists.txt".into(), "/abs/cmake/deps.cmake".into()],
                },
                BuildFiles {
                    is_cmake: true,
                    is_temporary: true,
                    sources: vec!["CMakeFiles/gen.cmake".into()],
                },
            ],
            cmake_root_directory: "/usr/share/cmake".into(),
            source_directory: "/src".into(),
        };
        assert_eq!(
            input_files(&inputs, Path::new("/fallback")),
            vec![
                PathBuf::from("/src/CMakeLists.txt"),
                PathBuf::from("/abs/cmake/deps.cmake")
            ]
        );
    }

    #[test]
    fn test_input_files_fallback_source() {
        let inputs = CmakeInputs {
            build_files: vec![BuildFiles {
                is_cmake: false,
                is_temporary: false,
                sources: vec!["CMakeLists.txt".into()],
            }],
            ..Default::default()
        };
        assert_eq!(
            input_files(&inputs, Path::new("/fallback")),
            vec![PathBuf::from("/fallback/CMakeLists.txt")]
        );
    }

    #[tokio::test]
    async fn test_missing_inputs_recorded_without_mtime() {
        let dir = tempfile::TempDir::new().unwrap();
        let present = dir.path().join("CMakeLists.txt");
        std::fs::write(&present, "").unwrap();
        let recorded = record_mtimes(vec![present.clone(), dir.path().join("gone.cmake")]).await;
        assert!(recorded[0].1.is_some());
        assert_eq!(recorded[1], (dir.path().join("gone.cmake"), None));
    }
}
