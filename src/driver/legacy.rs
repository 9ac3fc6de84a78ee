//! Command-line backend
//!
//! Runs `cmake -H<src> -B<bin>` once per configure and keeps the cache
//! snapshot in sync with `CMakeCache.txt`, including edits made by someone
//! else running cmake in the same build directory.

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{CACHE_FILE_NAME, CacheError, CmakeCache};
use crate::driver::{DriverError, DriverSettings, DriverShared};
use crate::io::{CommandOptions, OutputConsumer, run_command};

/// Quiet period before a changed cache file is re-read
const RELOAD_DEBOUNCE: Duration = Duration::from_millis(200);

#[derive(Default)]
pub struct LegacyBackend {
    watcher: Option<RecommendedWatcher>,
    reload_task: Option<JoinHandle<()>>,
}

impl LegacyBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) async fn start(&mut self, shared: &Arc<DriverShared>) -> Result<(), DriverError> {
        self.shutdown();
        let binary_dir = shared.snapshot().binary_dir;
        tokio::fs::create_dir_all(&binary_dir).await?;
        reload_cache(shared).await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            match res {
                Ok(event) if touches_cache(&event) => {
                    let _ = tx.send(());
                }
                Ok(_) => {}
                Err(e) => warn!("Cache watcher error: {}", e),
            }
        })?;
        watcher.watch(&binary_dir, RecursiveMode::NonRecursive)?;
        debug!("Watching {} for cache changes", binary_dir.display());

        self.reload_task = Some(tokio::spawn(reload_loop(rx, Arc::downgrade(shared))));
        self.watcher = Some(watcher);
        Ok(())
    }

    pub(crate) async fn configure(
        &mut self,
        settings: &DriverSettings,
        shared: &Arc<DriverShared>,
        args: Vec<String>,
        consumer: Arc<dyn OutputConsumer>,
        cancel: CancellationToken,
    ) -> Result<i32, DriverError> {
        let binary_dir = shared.snapshot().binary_dir;
        let mut full_args = vec![
            format!("-H{}", settings.source_dir.display()),
            format!("-B{}", binary_dir.display()),
        ];

        let has_cache = tokio::fs::try_exists(binary_dir.join(CACHE_FILE_NAME))
            .await
            .unwrap_or(false);
        if !has_cache {
            let generator = settings
                .generator_picker()
                .pick_generator()
                .await
                .ok_or(DriverError::NoGenerator)?;
            info!("Configuring fresh build directory with {}", generator.name);
            full_args.push(format!("-G{}", generator.name));
            if let Some(toolset) = &generator.toolset {
                full_args.push(format!("-T{toolset}"));
            }
            if let Some(platform) = &generator.platform {
                full_args.push(format!("-A{platform}"));
            }
            shared.update(|s| s.generator = Some(generator.name.clone()));
        }
        full_args.extend(args);

        let options = CommandOptions {
            cwd: Some(settings.source_dir.clone()),
            environment: settings
                .environment(&settings.config.configure_environment)
                .await,
        };
        let outcome = run_command(
            &settings.config.cmake_path,
            &full_args,
            &options,
            Some(consumer),
            cancel,
        )
        .await?;

        if let Err(e) = reload_cache(shared).await {
            warn!("Could not reload cache after configure: {}", e);
        }
        if outcome.cancelled {
            return Err(DriverError::Cancelled);
        }
        Ok(outcome.retc())
    }

    pub(crate) fn shutdown(&mut self) {
        self.watcher = None;
        if let Some(task) = self.reload_task.take() {
            task.abort();
        }
    }
}

impl Drop for LegacyBackend {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn touches_cache(event: &Event) -> bool {
    matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    ) && event
        .paths
        .iter()
        .any(|p| p.file_name().is_some_and(|n| n == CACHE_FILE_NAME))
}

async fn reload_cache(shared: &DriverShared) -> Result<(), CacheError> {
    let path = shared.snapshot().binary_dir.join(CACHE_FILE_NAME);
    let cache = CmakeCache::from_path(&path).await?;
    shared.set_cache(cache);
    Ok(())
}

async fn reload_loop(mut rx: mpsc::UnboundedReceiver<()>, shared: Weak<DriverShared>) {
    while rx.recv().await.is_some() {
        tokio::time::sleep(RELOAD_DEBOUNCE).await;
        while rx.try_recv().is_ok() {}

        let Some(shared) = shared.upgrade() else {
            break;
        };
        debug!("Cache file changed on disk, reloading");
        if let Err(e) = reload_cache(&shared).await {
            warn!("Could not reload cache: {}", e);
        }
    }
    debug!("Cache watcher stopped");
}
