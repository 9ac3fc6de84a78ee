//! CMake Server client
//!
//! Owns a `cmake -E server` child process and the pipe connection to it.
//! Requests are stamped with a random cookie and parked in a pending table
//! until the matching `reply`/`error` arrives. Unsolicited `progress`,
//! `message` and `signal` messages go straight to the registered handlers.

use futures::{SinkExt, StreamExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::fs::OpenOptions;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{Level, debug, error, info, instrument, trace, warn};

use crate::cache::{CACHE_FILE_NAME, CmakeCache};
use crate::cms::codec::CmsCodec;
use crate::cms::error::CmsError;
use crate::cms::protocol::{
    CacheContent, CmakeInputs, CodeModel, ConfigureParams, Decoded, GlobalSettings,
    GlobalSettingsUpdate, HandshakeParams, NoParams, ProtocolVersion, ServerMessage,
    decode_message, encode_request,
};
use crate::generator::GeneratorPicker;
use crate::io::pipe::{self, CONNECT_RETRY_INTERVAL, CONNECT_TIMEOUT};
use crate::io::{ChildProcessManager, ProcessExit, StopMode};
use crate::{log_cms_message, log_timing};

/// Consecutive undecodable messages after which the connection is abandoned
pub const MAX_GARBLED_MESSAGES: u32 = 16;

/// Time the server gets to exit after its pipe is closed
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Server stderr is mirrored here, inside the build directory
pub const SERVER_LOG_FILE_NAME: &str = "cmake-server.log";

/// A `progress` message
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressEvent {
    pub message: String,
    pub minimum: i64,
    pub current: i64,
    pub maximum: i64,
}

pub type ProgressCallback = Arc<dyn Fn(ProgressEvent) + Send + Sync>;
pub type MessageCallback = Arc<dyn Fn(&str, Option<&str>) + Send + Sync>;
pub type DirtyCallback = Arc<dyn Fn() + Send + Sync>;
pub type CrashCallback = Arc<dyn Fn(Option<i32>) + Send + Sync>;

/// Callbacks for unsolicited server traffic
#[derive(Clone, Default)]
pub struct CmsHandlers {
    pub on_progress: Option<ProgressCallback>,
    pub on_message: Option<MessageCallback>,
    pub on_dirty: Option<DirtyCallback>,
    /// Fired once if the server dies after a completed handshake
    pub on_crash: Option<CrashCallback>,
}

impl std::fmt::Debug for CmsHandlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CmsHandlers")
            .field("on_progress", &self.on_progress.is_some())
            .field("on_message", &self.on_message.is_some())
            .field("on_dirty", &self.on_dirty.is_some())
            .field("on_crash", &self.on_crash.is_some())
            .finish()
    }
}

/// Everything needed to start a server for one build directory
#[derive(Clone)]
pub struct ClientParams {
    pub cmake_path: String,
    pub source_dir: PathBuf,
    pub binary_dir: PathBuf,
    pub environment: BTreeMap<String, String>,
    pub generator_picker: Arc<dyn GeneratorPicker>,
    pub handlers: CmsHandlers,
}

struct PendingRequest {
    request: String,
    tx: oneshot::Sender<Result<Map<String, Value>, CmsError>>,
}

/// State shared between the client handle, the reader and the exit monitor
struct Shared {
    pending: Mutex<HashMap<String, PendingRequest>>,
    hello_tx: Mutex<Option<oneshot::Sender<Vec<ProtocolVersion>>>>,
    handlers: CmsHandlers,
    shutdown_requested: AtomicBool,
    handshake_complete: AtomicBool,
    connection_lost: AtomicBool,
    crash_reported: AtomicBool,
    garbled: AtomicU32,
}

impl Shared {
    fn new(handlers: CmsHandlers, hello_tx: oneshot::Sender<Vec<ProtocolVersion>>) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            hello_tx: Mutex::new(Some(hello_tx)),
            handlers,
            shutdown_requested: AtomicBool::new(false),
            handshake_complete: AtomicBool::new(false),
            connection_lost: AtomicBool::new(false),
            crash_reported: AtomicBool::new(false),
            garbled: AtomicU32::new(0),
        }
    }

    fn take_pending(&self, cookie: &str) -> Option<PendingRequest> {
        self.pending.lock().ok().and_then(|mut p| p.remove(cookie))
    }

    fn fail_all(&self, make_error: impl Fn() -> CmsError) {
        let drained: Vec<_> = match self.pending.lock() {
            Ok(mut pending) => pending.drain().collect(),
            Err(_) => return,
        };
        for (cookie, request) in drained {
            debug!(
                "CmsClient: abandoning pending '{}' ({})",
                request.request, cookie
            );
            let _ = request.tx.send(Err(make_error()));
        }
    }

    /// Returns `false` once the garbled-message limit is reached
    fn dispatch(&self, text: &str) -> bool {
        match decode_message(text) {
            Decoded::Message(message) => {
                self.garbled.store(0, Ordering::SeqCst);
                log_cms_message!(Level::TRACE, "recv", message.kind(), text);
                self.handle(message);
                true
            }
            Decoded::Unknown(kind) => {
                self.garbled.store(0, Ordering::SeqCst);
                warn!("CmsClient: ignoring message of unknown type '{}'", kind);
                true
            }
            Decoded::Garbled(e) => {
                let count = self.garbled.fetch_add(1, Ordering::SeqCst) + 1;
                warn!(
                    "CmsClient: dropping malformed message ({} in a row): {}",
                    count, e
                );
                if count >= MAX_GARBLED_MESSAGES {
                    error!(
                        "CmsClient: {} consecutive malformed messages, abandoning connection",
                        count
                    );
                    return false;
                }
                true
            }
        }
    }

    fn handle(&self, message: ServerMessage) {
        match message {
            ServerMessage::Hello {
                supported_protocol_versions,
            } => {
                let tx = self.hello_tx.lock().ok().and_then(|mut h| h.take());
                match tx {
                    Some(tx) => {
                        let _ = tx.send(supported_protocol_versions);
                    }
                    None => warn!("CmsClient: unexpected second hello"),
                }
            }
            ServerMessage::Reply {
                cookie,
                in_reply_to,
                payload,
            } => match self.take_pending(&cookie) {
                Some(pending) => {
                    let _ = pending.tx.send(Ok(payload));
                }
                None => warn!(
                    "CmsClient: reply to '{}' with unknown cookie {}",
                    in_reply_to, cookie
                ),
            },
            ServerMessage::Error {
                cookie,
                in_reply_to,
                error_message,
            } => match self.take_pending(&cookie) {
                Some(pending) => {
                    let _ = pending
                        .tx
                        .send(Err(CmsError::server(pending.request, error_message)));
                }
                None => warn!(
                    "CmsClient: error for '{}' with unknown cookie {}: {}",
                    in_reply_to, cookie, error_message
                ),
            },
            ServerMessage::Progress {
                progress_message,
                progress_minimum,
                progress_current,
                progress_maximum,
                ..
            } => {
                if let Some(on_progress) = &self.handlers.on_progress {
                    on_progress(ProgressEvent {
                        message: progress_message,
                        minimum: progress_minimum,
                        current: progress_current,
                        maximum: progress_maximum,
                    });
                }
            }
            ServerMessage::Message { message, title, .. } => {
                debug!("cmake: {}", message);
                if let Some(on_message) = &self.handlers.on_message {
                    on_message(&message, title.as_deref());
                }
            }
            ServerMessage::Signal { name, .. } => match name.as_str() {
                "dirty" => {
                    debug!("CmsClient: build system is dirty");
                    if let Some(on_dirty) = &self.handlers.on_dirty {
                        on_dirty();
                    }
                }
                "fileChange" => trace!("CmsClient: fileChange signal"),
                other => debug!("CmsClient: unhandled signal '{}'", other),
            },
        }
    }

    fn is_shutting_down(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }

    /// Fire the crash callback at most once, and only for an established session
    fn report_crash(&self, exit_code: Option<i32>) {
        self.connection_lost.store(true, Ordering::SeqCst);
        if self.is_shutting_down() || !self.handshake_complete.load(Ordering::SeqCst) {
            return;
        }
        if self.crash_reported.swap(true, Ordering::SeqCst) {
            return;
        }
        error!("CMake Server crashed (exit code {:?})", exit_code);
        if let Some(on_crash) = &self.handlers.on_crash {
            on_crash(exit_code);
        }
    }
}

enum LogEntry {
    Line(String),
    Close(Option<ProcessExit>),
}

/// Append-only mirror of the server's stderr, written by a background task
#[derive(Clone)]
struct ServerLog {
    tx: mpsc::UnboundedSender<LogEntry>,
}

impl ServerLog {
    fn spawn(path: PathBuf) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(write_server_log(path, rx));
        (Self { tx }, task)
    }

    fn line(&self, line: &str) {
        let _ = self.tx.send(LogEntry::Line(line.to_string()));
    }

    fn close(&self, exit: Option<ProcessExit>) {
        let _ = self.tx.send(LogEntry::Close(exit));
    }
}

async fn write_server_log(path: PathBuf, mut rx: mpsc::UnboundedReceiver<LogEntry>) {
    let mut file = match OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .await
    {
        Ok(file) => {
            debug!("CMake Server logs will be written to {}", path.display());
            file
        }
        Err(e) => {
            warn!("Failed to open server log {}: {}", path.display(), e);
            return;
        }
    };

    let timestamp = chrono::Utc::now().format("%Y-%m-%d %H:%M:%S UTC");
    let header = format!("\n=== CMAKE SERVER STARTED: {timestamp} ===\n");
    if let Err(e) = file.write_all(header.as_bytes()).await {
        warn!("Failed to write header to server log: {}", e);
    }

    while let Some(entry) = rx.recv().await {
        let (text, last) = match entry {
            LogEntry::Line(line) => {
                let timestamp = chrono::Utc::now().format("%Y-%m-%d %H:%M:%S.%3f");
                (format!("[{timestamp}] {line}\n"), false)
            }
            LogEntry::Close(exit) => {
                let timestamp = chrono::Utc::now().format("%Y-%m-%d %H:%M:%S UTC");
                let code = exit.and_then(|e| e.code);
                let footer =
                    format!("=== CMAKE SERVER ENDED: {timestamp} (exit code {code:?}) ===\n\n");
                (footer, true)
            }
        };
        if let Err(e) = file.write_all(text.as_bytes()).await {
            warn!("Failed to write to server log: {}", e);
        }
        if last {
            break;
        }
    }
    let _ = file.flush().await;
}

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// A connected, handshaken CMake Server session
pub struct CmsClient {
    shared: Arc<Shared>,
    writer: tokio::sync::Mutex<Option<FramedWrite<BoxedWriter, CmsCodec>>>,
    process: tokio::sync::Mutex<Option<ChildProcessManager>>,
    exit_rx: Option<watch::Receiver<Option<ProcessExit>>>,
    reader_task: JoinHandle<()>,
    monitor_task: Option<JoinHandle<()>>,
    pipe_name: Option<PathBuf>,
    binary_dir: PathBuf,
}

impl CmsClient {
    /// Spawn `cmake -E server`, connect to its pipe and perform the handshake
    #[instrument(name = "cms_start", skip_all, fields(binary_dir = %params.binary_dir.display()))]
    pub async fn start(params: ClientParams) -> Result<Self, CmsError> {
        let started = Instant::now();
        tokio::fs::create_dir_all(&params.binary_dir).await?;

        let pipe_name = pipe::pipe_name(&params.binary_dir);
        let args = vec![
            "-E".to_string(),
            "server".to_string(),
            "--experimental".to_string(),
            format!("--pipe={}", pipe_name.display()),
        ];
        let mut process = ChildProcessManager::new(
            params.cmake_path.clone(),
            args,
            Some(params.binary_dir.clone()),
        )
        .with_environment(params.environment.clone());

        let (log, _log_task) = ServerLog::spawn(params.binary_dir.join(SERVER_LOG_FILE_NAME));
        let stderr_log = log.clone();
        process.on_stderr_line(move |line| {
            debug!("cmake-server stderr: {}", line);
            stderr_log.line(&line);
        });
        process.on_stdout_line(|line| trace!("cmake-server stdout: {}", line));
        process.start().await?;

        let mut exit_rx = process.exit_receiver();
        let connected = tokio::select! {
            stream = pipe::connect_with_retry(&pipe_name, CONNECT_RETRY_INTERVAL, CONNECT_TIMEOUT) => stream,
            exit = exit_rx.wait_for(Option::is_some) => {
                let exit_code = exit.ok().and_then(|e| (*e).and_then(|x| x.code));
                log.close(None);
                pipe::remove_pipe(&pipe_name);
                return Err(CmsError::StartupFailed { exit_code });
            }
        };
        let stream = match connected {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Could not connect to {}: {}", pipe_name.display(), e);
                let _ = process.stop(StopMode::Force).await;
                log.close(None);
                pipe::remove_pipe(&pipe_name);
                return Err(CmsError::Pipe(e));
            }
        };

        let client = Self::connect_inner(stream, params, Some(process), Some(pipe_name), Some(log))
            .await?;
        log_timing!(Level::DEBUG, "cms_start", started.elapsed());
        Ok(client)
    }

    /// Run a session over an already-connected stream
    pub async fn connect_stream<S>(stream: S, params: ClientParams) -> Result<Self, CmsError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::connect_inner(stream, params, None, None, None).await
    }

    async fn connect_inner<S>(
        stream: S,
        params: ClientParams,
        process: Option<ChildProcessManager>,
        pipe_name: Option<PathBuf>,
        log: Option<ServerLog>,
    ) -> Result<Self, CmsError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let (hello_tx, hello_rx) = oneshot::channel();
        let shared = Arc::new(Shared::new(params.handlers.clone(), hello_tx));

        let has_process = process.is_some();
        let reader = FramedRead::new(read_half, CmsCodec::new());
        let reader_task = tokio::spawn(read_loop(reader, Arc::clone(&shared), has_process));

        let exit_rx = process.as_ref().map(ChildProcessManager::exit_receiver);
        let monitor_task = exit_rx
            .clone()
            .map(|rx| tokio::spawn(monitor_exit(rx, Arc::clone(&shared), log)));

        let writer: BoxedWriter = Box::new(write_half);
        let client = Self {
            shared,
            writer: tokio::sync::Mutex::new(Some(FramedWrite::new(writer, CmsCodec::new()))),
            process: tokio::sync::Mutex::new(process),
            exit_rx,
            reader_task,
            monitor_task,
            pipe_name,
            binary_dir: params.binary_dir.clone(),
        };

        match client.establish(hello_rx, &params).await {
            Ok(()) => Ok(client),
            Err(e) => {
                warn!("CMake Server startup failed: {}", e);
                let _ = client.shutdown().await;
                Err(e)
            }
        }
    }

    async fn establish(
        &self,
        hello_rx: oneshot::Receiver<Vec<ProtocolVersion>>,
        params: &ClientParams,
    ) -> Result<(), CmsError> {
        let versions = match self.exit_rx.clone() {
            Some(mut exit_rx) => tokio::select! {
                hello = hello_rx => hello.map_err(|_| CmsError::ConnectionClosed)?,
                exit = exit_rx.wait_for(Option::is_some) => {
                    let exit_code = exit.ok().and_then(|e| (*e).and_then(|x| x.code));
                    return Err(CmsError::StartupFailed { exit_code });
                }
            },
            None => hello_rx.await.map_err(|_| CmsError::ConnectionClosed)?,
        };
        debug!("CMake Server supports protocol versions {:?}", versions);

        let handshake = handshake_params(
            &params.source_dir,
            &params.binary_dir,
            params.generator_picker.as_ref(),
            versions.first().copied(),
        )
        .await?;
        self.request_raw("handshake", &handshake).await?;
        self.shared.handshake_complete.store(true, Ordering::SeqCst);
        info!(
            "CMake Server ready for {} (generator {:?})",
            params.binary_dir.display(),
            handshake.generator
        );
        Ok(())
    }

    async fn request_raw<P: Serialize>(
        &self,
        kind: &str,
        params: &P,
    ) -> Result<Map<String, Value>, CmsError> {
        if self.shared.is_shutting_down() {
            return Err(CmsError::ShuttingDown);
        }
        if self.shared.connection_lost.load(Ordering::SeqCst) {
            return Err(CmsError::ConnectionClosed);
        }

        let cookie = uuid::Uuid::new_v4().simple().to_string();
        let text = encode_request(kind, &cookie, params).map_err(CmsError::Serialization)?;

        let (tx, rx) = oneshot::channel();
        if let Ok(mut pending) = self.shared.pending.lock() {
            pending.insert(
                cookie.clone(),
                PendingRequest {
                    request: kind.to_string(),
                    tx,
                },
            );
        }

        log_cms_message!(Level::DEBUG, "send", kind, &text);
        let sent = {
            let mut writer = self.writer.lock().await;
            match writer.as_mut() {
                Some(writer) => writer.send(text).await.map_err(CmsError::from),
                None => Err(CmsError::ConnectionClosed),
            }
        };
        if let Err(e) = sent {
            self.shared.take_pending(&cookie);
            return Err(e);
        }

        let started = Instant::now();
        let result = rx.await.unwrap_or(Err(CmsError::ConnectionClosed));
        log_timing!(Level::TRACE, kind, started.elapsed());
        result
    }

    async fn request<P: Serialize, R: DeserializeOwned>(
        &self,
        kind: &str,
        params: &P,
    ) -> Result<R, CmsError> {
        let payload = self.request_raw(kind, params).await?;
        serde_json::from_value(Value::Object(payload)).map_err(|source| {
            CmsError::Deserialization {
                request: kind.to_string(),
                source,
            }
        })
    }

    pub async fn set_global_settings(&self, update: &GlobalSettingsUpdate) -> Result<(), CmsError> {
        self.request_raw("setGlobalSettings", update).await.map(|_| ())
    }

    pub async fn get_global_settings(&self) -> Result<GlobalSettings, CmsError> {
        self.request("globalSettings", &NoParams {}).await
    }

    pub async fn get_cmake_cache_content(&self) -> Result<CacheContent, CmsError> {
        self.request("cache", &NoParams {}).await
    }

    pub async fn configure(&self, cache_arguments: Vec<String>) -> Result<(), CmsError> {
        self.request_raw("configure", &ConfigureParams { cache_arguments })
            .await
            .map(|_| ())
    }

    pub async fn compute(&self) -> Result<(), CmsError> {
        self.request_raw("compute", &NoParams {}).await.map(|_| ())
    }

    pub async fn codemodel(&self) -> Result<CodeModel, CmsError> {
        self.request("codemodel", &NoParams {}).await
    }

    pub async fn cmake_inputs(&self) -> Result<CmakeInputs, CmsError> {
        self.request("cmakeInputs", &NoParams {}).await
    }

    /// `true` until the server exits, the pipe closes or shutdown begins
    pub fn is_alive(&self) -> bool {
        !self.shared.is_shutting_down() && !self.shared.connection_lost.load(Ordering::SeqCst)
    }

    pub fn pending_count(&self) -> usize {
        self.shared.pending.lock().map(|p| p.len()).unwrap_or(0)
    }

    pub fn binary_dir(&self) -> &Path {
        &self.binary_dir
    }

    /// Close the pipe and wait for the server to exit
    pub async fn shutdown(&self) -> Result<(), CmsError> {
        if self.shared.shutdown_requested.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        debug!("Shutting down CMake Server for {}", self.binary_dir.display());

        if let Some(mut writer) = self.writer.lock().await.take() {
            if let Err(e) = writer.close().await {
                debug!("Error closing server pipe: {}", e);
            }
        }

        let mut process = self.process.lock().await;
        if let Some(process) = process.as_mut() {
            if process.is_running() {
                match tokio::time::timeout(SHUTDOWN_TIMEOUT, process.wait()).await {
                    Ok(exit) => debug!("CMake Server exited: {:?}", exit),
                    Err(_) => {
                        warn!("CMake Server did not exit after pipe close, killing it");
                        let _ = process.stop(StopMode::Force).await;
                        let _ = tokio::time::timeout(SHUTDOWN_TIMEOUT, process.wait()).await;
                    }
                }
            }
        }

        self.reader_task.abort();
        self.shared.fail_all(|| CmsError::ShuttingDown);
        if let Some(name) = &self.pipe_name {
            pipe::remove_pipe(name);
        }
        Ok(())
    }
}

impl Drop for CmsClient {
    fn drop(&mut self) {
        self.reader_task.abort();
        if let Some(task) = self.monitor_task.take() {
            task.abort();
        }
        if let Some(process) = self.process.get_mut().as_mut() {
            process.kill_sync();
        }
        if let Some(name) = &self.pipe_name {
            pipe::remove_pipe(name);
        }
    }
}

async fn read_loop<R>(mut reader: FramedRead<R, CmsCodec>, shared: Arc<Shared>, has_process: bool)
where
    R: AsyncRead + Unpin,
{
    while let Some(frame) = reader.next().await {
        match frame {
            Ok(text) => {
                if !shared.dispatch(&text) {
                    shared.report_crash(None);
                    break;
                }
            }
            Err(e) => {
                warn!("CmsClient: read error: {}", e);
                break;
            }
        }
    }

    trace!("CmsClient: reader finished");
    shared.connection_lost.store(true, Ordering::SeqCst);
    if let Ok(mut hello) = shared.hello_tx.lock() {
        hello.take();
    }
    // With a process the exit monitor decides whether this was a crash
    if !has_process {
        shared.report_crash(None);
    }
    shared.fail_all(|| CmsError::ConnectionClosed);
}

async fn monitor_exit(
    mut exit_rx: watch::Receiver<Option<ProcessExit>>,
    shared: Arc<Shared>,
    log: Option<ServerLog>,
) {
    let exit = match exit_rx.wait_for(Option::is_some).await {
        Ok(exit) => *exit,
        Err(_) => None,
    };
    if let Some(log) = &log {
        log.close(exit);
    }

    let exit_code = exit.and_then(|e| e.code);
    shared.fail_all(|| CmsError::ProcessExited { exit_code });
    match exit {
        Some(exit) if exit.success() => {
            shared.connection_lost.store(true, Ordering::SeqCst);
            if !shared.is_shutting_down() {
                info!("CMake Server exited normally");
            }
        }
        _ => shared.report_crash(exit_code),
    }
}

/// Compare paths the way CMake compares source directories
pub fn paths_equivalent(a: &Path, b: &Path) -> bool {
    normalize_path(a) == normalize_path(b)
}

fn normalize_path(path: &Path) -> String {
    let text = path.to_string_lossy();
    let text = if cfg!(windows) {
        text.replace('\\', "/").to_lowercase()
    } else {
        text.into_owned()
    };
    let trimmed = text.trim_end_matches('/');
    if trimmed.is_empty() && text.starts_with('/') {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

fn non_empty_cache_value(cache: &CmakeCache, key: &str) -> Option<String> {
    cache
        .get(key)
        .map(|e| e.as_string())
        .filter(|v| !v.is_empty())
}

/// Build handshake parameters for `binary_dir`.
///
/// An existing cache must belong to `source_dir`; its generator is reused.
/// Without a cache the generator comes from `picker`.
pub async fn handshake_params(
    source_dir: &Path,
    binary_dir: &Path,
    picker: &dyn GeneratorPicker,
    protocol_version: Option<ProtocolVersion>,
) -> Result<HandshakeParams, CmsError> {
    let cache_path = binary_dir.join(CACHE_FILE_NAME);
    let cache = CmakeCache::from_path(&cache_path).await?;

    let mut params = HandshakeParams {
        protocol_version,
        build_directory: binary_dir.to_string_lossy().into_owned(),
        source_directory: Some(source_dir.to_string_lossy().into_owned()),
        ..Default::default()
    };

    if cache.exists() {
        if let Some(cached) = cache.home_directory() {
            if !paths_equivalent(&cached, source_dir) {
                return Err(CmsError::BadHomeDirectory {
                    cached,
                    expecting: source_dir.to_path_buf(),
                    bad_cache_path: cache_path,
                });
            }
            params.source_directory = Some(cached.to_string_lossy().into_owned());
        }
        params.generator = cache.generator();
        params.extra_generator = non_empty_cache_value(&cache, "CMAKE_EXTRA_GENERATOR");
        params.platform = non_empty_cache_value(&cache, "CMAKE_GENERATOR_PLATFORM");
        params.toolset = non_empty_cache_value(&cache, "CMAKE_GENERATOR_TOOLSET");
    }

    if params.generator.is_none() {
        let generator = picker
            .pick_generator()
            .await
            .ok_or(CmsError::NoGenerator)?;
        params.generator = Some(generator.name);
        params.platform = generator.platform;
        params.toolset = generator.toolset;
    }

    Ok(params)
}
