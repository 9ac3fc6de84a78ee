//! In-process fake CMake Server for tests
//!
//! Speaks the framed protocol over a duplex stream: sends `hello`, records
//! every request, and answers from a table of canned replies.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::DuplexStream;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::cms::client::{ClientParams, CmsClient, CmsHandlers};
use crate::cms::codec::CmsCodec;
use crate::cms::error::CmsError;
use crate::driver::CmsConnector;
use crate::generator::{FixedGenerator, Generator};

#[derive(Debug, Clone)]
enum FakeReply {
    Payload(Value),
    Error(String),
    HangUp,
}

/// Requests received by a fake server, shared with the test
#[derive(Debug, Clone, Default)]
pub struct RequestLog(Arc<Mutex<Vec<Value>>>);

impl RequestLog {
    fn push(&self, request: Value) {
        self.0.lock().unwrap().push(request);
    }

    /// Most recent request of the given type
    pub fn find(&self, kind: &str) -> Option<Value> {
        self.0
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|r| r["type"] == kind)
            .cloned()
    }

    pub fn kinds(&self) -> Vec<String> {
        self.0
            .lock()
            .unwrap()
            .iter()
            .filter_map(|r| r["type"].as_str().map(str::to_string))
            .collect()
    }

    pub fn count(&self, kind: &str) -> usize {
        self.kinds().iter().filter(|k| *k == kind).count()
    }
}

#[derive(Debug, Clone)]
pub struct FakeCmakeServer {
    replies: HashMap<String, FakeReply>,
    preludes: HashMap<String, Vec<String>>,
    delays: HashMap<String, Duration>,
    log: RequestLog,
    send_hello: bool,
    close_immediately: bool,
}

impl Default for FakeCmakeServer {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeCmakeServer {
    pub fn new() -> Self {
        let mut replies = HashMap::new();
        replies.insert(
            "globalSettings".to_string(),
            FakeReply::Payload(json!({
                "generator": "Ninja",
                "sourceDirectory": "/s",
                "buildDirectory": "/b",
                "warnUnusedCli": true
            })),
        );
        replies.insert(
            "codemodel".to_string(),
            FakeReply::Payload(json!({ "configurations": [] })),
        );
        replies.insert(
            "cmakeInputs".to_string(),
            FakeReply::Payload(json!({ "buildFiles": [] })),
        );
        replies.insert(
            "cache".to_string(),
            FakeReply::Payload(json!({ "cache": [] })),
        );
        Self {
            replies,
            preludes: HashMap::new(),
            delays: HashMap::new(),
            log: RequestLog::default(),
            send_hello: true,
            close_immediately: false,
        }
    }

    pub fn with_log(mut self, log: RequestLog) -> Self {
        self.log = log;
        self
    }

    pub fn reply(mut self, kind: &str, payload: Value) -> Self {
        self.replies
            .insert(kind.to_string(), FakeReply::Payload(payload));
        self
    }

    pub fn error(mut self, kind: &str, message: &str) -> Self {
        self.replies
            .insert(kind.to_string(), FakeReply::Error(message.to_string()));
        self
    }

    /// Close the connection instead of answering `kind`
    pub fn hang_up_on(mut self, kind: &str) -> Self {
        self.replies.insert(kind.to_string(), FakeReply::HangUp);
        self
    }

    /// Send `message` before answering `kind`; `"$cookie"` is replaced
    /// with the request's cookie
    pub fn before(self, kind: &str, message: Value) -> Self {
        let text = message.to_string();
        self.before_raw(kind, &text)
    }

    pub fn before_raw(mut self, kind: &str, text: &str) -> Self {
        self.preludes
            .entry(kind.to_string())
            .or_default()
            .push(text.to_string());
        self
    }

    pub fn delay(mut self, kind: &str, delay: Duration) -> Self {
        self.delays.insert(kind.to_string(), delay);
        self
    }

    pub fn without_hello(mut self) -> Self {
        self.send_hello = false;
        self
    }

    pub fn close_immediately(mut self) -> Self {
        self.close_immediately = true;
        self
    }

    pub fn request_log(&self) -> RequestLog {
        self.log.clone()
    }

    /// Start serving; returns the client end of the connection
    pub fn spawn(self) -> (DuplexStream, JoinHandle<()>) {
        let (client, server) = tokio::io::duplex(256 * 1024);
        let task = tokio::spawn(self.serve(server));
        (client, task)
    }

    async fn serve(self, stream: DuplexStream) {
        if self.close_immediately {
            return;
        }
        let (read_half, write_half) = tokio::io::split(stream);
        let mut reader = FramedRead::new(read_half, CmsCodec::new());
        let mut writer = FramedWrite::new(write_half, CmsCodec::new());

        if self.send_hello {
            let hello = json!({
                "type": "hello",
                "supportedProtocolVersions": [{"major": 1, "minor": 1}]
            });
            if writer.send(hello.to_string()).await.is_err() {
                return;
            }
        }

        while let Some(Ok(text)) = reader.next().await {
            let Ok(request) = serde_json::from_str::<Value>(&text) else {
                continue;
            };
            let kind = request["type"].as_str().unwrap_or_default().to_string();
            let cookie = request["cookie"].as_str().unwrap_or_default().to_string();
            self.log.push(request);

            for prelude in self.preludes.get(&kind).into_iter().flatten() {
                let _ = writer.send(prelude.replace("$cookie", &cookie)).await;
            }
            if let Some(delay) = self.delays.get(&kind) {
                tokio::time::sleep(*delay).await;
            }

            let response = match self.replies.get(&kind) {
                Some(FakeReply::HangUp) => return,
                Some(FakeReply::Error(message)) => json!({
                    "type": "error",
                    "cookie": cookie,
                    "inReplyTo": kind,
                    "errorMessage": message
                }),
                Some(FakeReply::Payload(payload)) => {
                    let mut reply = payload.clone();
                    if let Value::Object(map) = &mut reply {
                        map.insert("type".into(), json!("reply"));
                        map.insert("cookie".into(), json!(cookie));
                        map.insert("inReplyTo".into(), json!(kind));
                    }
                    reply
                }
                None => json!({ "type": "reply", "cookie": cookie, "inReplyTo": kind }),
            };
            if writer.send(response.to_string()).await.is_err() {
                return;
            }
        }
    }
}

/// Client parameters with a fixed Ninja generator and no handlers
pub fn test_params(source_dir: &Path, binary_dir: &Path) -> ClientParams {
    ClientParams {
        cmake_path: "cmake".to_string(),
        source_dir: source_dir.to_path_buf(),
        binary_dir: binary_dir.to_path_buf(),
        environment: BTreeMap::new(),
        generator_picker: Arc::new(FixedGenerator(Some(Generator::new("Ninja")))),
        handlers: CmsHandlers::default(),
    }
}

/// Connects every session to a fresh copy of a fake server
pub struct FakeConnector {
    server: FakeCmakeServer,
    connects: AtomicUsize,
}

impl FakeConnector {
    pub fn new(server: FakeCmakeServer) -> Self {
        Self {
            server,
            connects: AtomicUsize::new(0),
        }
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CmsConnector for FakeConnector {
    async fn connect(&self, params: ClientParams) -> Result<CmsClient, CmsError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let (stream, _task) = self.server.clone().spawn();
        CmsClient::connect_stream(stream, params).await
    }
}
