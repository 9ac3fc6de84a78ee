//! Test utilities and global setup
//!
//! Shared logging setup plus fixtures for cmake scripts, caches and
//! captured output.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::cache::CACHE_FILE_NAME;
use crate::io::OutputConsumer;

/// Test logging utilities
#[cfg(all(test, feature = "test-logging"))]
pub mod logging {
    use std::sync::Once;
    use tracing_subscriber::{EnvFilter, fmt};

    static INIT: Once = Once::new();

    /// Initialize test logging once per test binary
    ///
    /// Honors `RUST_LOG`, defaulting to debug for this crate:
    ///
    /// ```bash
    /// RUST_LOG=cmake_driver::cms=trace cargo test --features test-logging
    /// ```
    pub fn init() {
        INIT.call_once(|| {
            let env_filter = EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("debug,tokio=info,notify=info"));

            fmt()
                .with_env_filter(env_filter)
                .with_test_writer()
                .with_target(true)
                .with_thread_ids(true)
                .compact()
                .try_init()
                .ok();
        });
    }
}

/// Initialize test logging for every test in the enclosing module
#[cfg(all(test, feature = "test-logging"))]
#[macro_export]
macro_rules! setup_test_logging {
    () => {
        #[ctor::ctor]
        fn init_test_logging() {
            $crate::test_utils::logging::init();
        }
    };
}

/// Write an executable `/bin/sh` script named `cmake` into `dir`
#[cfg(unix)]
pub fn write_fake_cmake(dir: &Path, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join("cmake");
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Write `CMakeCache.txt` into `binary_dir` with `KEY:TYPE=value` lines
pub fn write_cache(binary_dir: &Path, entries: &[(&str, &str)]) -> PathBuf {
    std::fs::create_dir_all(binary_dir).unwrap();
    let mut content = String::from("# This is the CMakeCache file.\n\n");
    for (key, value) in entries {
        content.push_str(&format!("{key}={value}\n"));
    }
    let path = binary_dir.join(CACHE_FILE_NAME);
    std::fs::write(&path, content).unwrap();
    path
}

/// Records everything it is given
#[derive(Debug, Default)]
pub struct CollectingConsumer {
    output: Mutex<Vec<String>>,
    errors: Mutex<Vec<String>>,
}

impl CollectingConsumer {
    pub fn output_lines(&self) -> Vec<String> {
        self.output.lock().unwrap().clone()
    }

    pub fn error_lines(&self) -> Vec<String> {
        self.errors.lock().unwrap().clone()
    }
}

impl OutputConsumer for CollectingConsumer {
    fn output(&self, line: &str) {
        self.output.lock().unwrap().push(line.to_string());
    }

    fn error(&self, line: &str) {
        self.errors.lock().unwrap().push(line.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CmakeCache;

    #[tokio::test]
    async fn test_write_cache_is_parseable() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = write_cache(
            dir.path(),
            &[("CMAKE_GENERATOR:INTERNAL", "Ninja"), ("OPT:BOOL", "ON")],
        );
        let cache = CmakeCache::from_path(&path).await.unwrap();
        assert_eq!(cache.generator().as_deref(), Some("Ninja"));
        assert!(cache.get("OPT").unwrap().value().is_truthy());
    }
}
