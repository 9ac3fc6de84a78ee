//! CMake Server message types
//!
//! Inbound messages are tagged by their `type` field. Requests are JSON
//! objects `{type, cookie, ...params}`; replies echo the cookie.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use crate::cache::{CacheEntry, CacheEntryType, CacheValue};

/// A message sent by the server
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    Hello {
        supported_protocol_versions: Vec<ProtocolVersion>,
    },
    Reply {
        cookie: String,
        #[serde(default)]
        in_reply_to: String,
        #[serde(flatten)]
        payload: Map<String, Value>,
    },
    Error {
        cookie: String,
        #[serde(default)]
        in_reply_to: String,
        #[serde(default)]
        error_message: String,
    },
    Progress {
        #[serde(default)]
        cookie: String,
        #[serde(default)]
        progress_message: String,
        #[serde(default)]
        progress_minimum: i64,
        #[serde(default)]
        progress_current: i64,
        #[serde(default)]
        progress_maximum: i64,
    },
    Message {
        #[serde(default)]
        cookie: String,
        #[serde(default)]
        message: String,
        #[serde(default)]
        title: Option<String>,
    },
    Signal {
        name: String,
        #[serde(flatten)]
        payload: Map<String, Value>,
    },
}

impl ServerMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::Hello { .. } => "hello",
            ServerMessage::Reply { .. } => "reply",
            ServerMessage::Error { .. } => "error",
            ServerMessage::Progress { .. } => "progress",
            ServerMessage::Message { .. } => "message",
            ServerMessage::Signal { .. } => "signal",
        }
    }
}

/// Outcome of decoding one frame
#[derive(Debug)]
pub enum Decoded {
    Message(ServerMessage),
    /// Well-formed JSON with a `type` this client does not handle
    Unknown(String),
    /// Not a protocol message at all
    Garbled(serde_json::Error),
}

pub fn decode_message(text: &str) -> Decoded {
    match serde_json::from_str::<ServerMessage>(text) {
        Ok(message) => Decoded::Message(message),
        Err(e) => match serde_json::from_str::<Value>(text) {
            Ok(Value::Object(obj)) => match obj.get("type").and_then(Value::as_str) {
                Some(kind) if !is_known_kind(kind) => Decoded::Unknown(kind.to_string()),
                _ => Decoded::Garbled(e),
            },
            _ => Decoded::Garbled(e),
        },
    }
}

fn is_known_kind(kind: &str) -> bool {
    matches!(
        kind,
        "hello" | "reply" | "error" | "progress" | "message" | "signal"
    )
}

/// Serialize a request, merging `params` into `{type, cookie}`
pub fn encode_request<P: Serialize>(
    kind: &str,
    cookie: &str,
    params: &P,
) -> Result<String, serde_json::Error> {
    let mut object = match serde_json::to_value(params)? {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert("params".to_string(), other);
            map
        }
    };
    object.insert("type".to_string(), Value::String(kind.to_string()));
    object.insert("cookie".to_string(), Value::String(cookie.to_string()));
    serde_json::to_string(&Value::Object(object))
}

/// Requests that carry no parameters
#[derive(Debug, Default, Serialize)]
pub struct NoParams {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolVersion {
    pub major: u32,
    pub minor: u32,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_experimental: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeParams {
    pub protocol_version: Option<ProtocolVersion>,
    pub build_directory: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_directory: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generator: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra_generator: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub toolset: Option<String>,
}

/// Reply to `globalSettings`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GlobalSettings {
    pub source_directory: String,
    pub build_directory: String,
    pub generator: String,
    pub extra_generator: String,
    pub debug_output: bool,
    pub trace: bool,
    pub trace_expand: bool,
    pub warn_uninitialized: bool,
    pub warn_unused: bool,
    pub warn_unused_cli: bool,
    pub check_system_vars: bool,
}

/// Parameters of `setGlobalSettings`; unset fields are left unchanged
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalSettingsUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub debug_output: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_expand: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warn_uninitialized: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warn_unused: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warn_unused_cli: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub check_system_vars: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigureParams {
    pub cache_arguments: Vec<String>,
}

/// Reply to `cache`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheContent {
    #[serde(default)]
    pub cache: Vec<ServerCacheEntry>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerCacheEntry {
    pub key: String,
    #[serde(rename = "type")]
    pub entry_type: String,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub properties: ServerCacheProperties,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerCacheProperties {
    #[serde(rename = "HELPSTRING", default)]
    pub helpstring: String,
    #[serde(rename = "ADVANCED", default)]
    pub advanced: Option<String>,
}

impl ServerCacheEntry {
    /// Convert to a [`CacheEntry`]; entries with an unknown type are dropped
    pub fn to_cache_entry(&self) -> Option<CacheEntry> {
        let Some(entry_type) = CacheEntryType::from_type_name(&self.entry_type) else {
            warn!(
                "Server cache entry {} has unknown type {}",
                self.key, self.entry_type
            );
            return None;
        };
        let advanced = self.properties.advanced.as_deref() == Some("1");
        Some(CacheEntry::new(
            self.key.clone(),
            CacheValue::String(self.value.clone()),
            entry_type,
            self.properties.helpstring.clone(),
            advanced,
        ))
    }
}

/// Reply to `codemodel`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CodeModel {
    pub configurations: Vec<CodeModelConfiguration>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CodeModelConfiguration {
    pub name: String,
    pub projects: Vec<CodeModelProject>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CodeModelProject {
    pub name: String,
    pub source_directory: String,
    pub build_directory: String,
    pub targets: Vec<CodeModelTarget>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CodeModelTarget {
    pub name: String,
    #[serde(rename = "type")]
    pub target_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_name: Option<String>,
    pub artifacts: Vec<String>,
    pub source_directory: String,
    pub build_directory: String,
    pub file_groups: Vec<CodeModelFileGroup>,
}

impl CodeModelTarget {
    pub fn is_executable(&self) -> bool {
        self.target_type == "EXECUTABLE"
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CodeModelFileGroup {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compile_flags: Option<String>,
    pub defines: Vec<String>,
    pub include_path: Vec<IncludePath>,
    pub is_generated: bool,
    pub sources: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IncludePath {
    pub path: String,
    pub is_system: bool,
}

/// Reply to `cmakeInputs`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CmakeInputs {
    pub build_files: Vec<BuildFiles>,
    pub cmake_root_directory: String,
    pub source_directory: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BuildFiles {
    pub is_cmake: bool,
    pub is_temporary: bool,
    pub sources: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_hello() {
        let text = r#"{"supportedProtocolVersions":[{"isExperimental":true,"major":1,"minor":2}],"type":"hello"}"#;
        let Decoded::Message(ServerMessage::Hello {
            supported_protocol_versions,
        }) = decode_message(text)
        else {
            panic!("expected hello");
        };
        assert_eq!(
            supported_protocol_versions,
            vec![ProtocolVersion {
                major: 1,
                minor: 2,
                is_experimental: true
            }]
        );
    }

    #[test]
    fn test_decode_reply_keeps_payload() {
        let text = r#"{"type":"reply","cookie":"c1","inReplyTo":"codemodel","configurations":[]}"#;
        let Decoded::Message(ServerMessage::Reply {
            cookie,
            in_reply_to,
            payload,
        }) = decode_message(text)
        else {
            panic!("expected reply");
        };
        assert_eq!(cookie, "c1");
        assert_eq!(in_reply_to, "codemodel");
        assert_eq!(payload.get("configurations"), Some(&json!([])));
        assert!(!payload.contains_key("cookie"));
    }

    #[test]
    fn test_decode_error_progress_signal() {
        assert!(matches!(
            decode_message(r#"{"type":"error","cookie":"x","errorMessage":"nope"}"#),
            Decoded::Message(ServerMessage::Error { error_message, .. }) if error_message == "nope"
        ));
        assert!(matches!(
            decode_message(
                r#"{"type":"progress","cookie":"x","progressMessage":"Configuring","progressMinimum":0,"progressCurrent":3,"progressMaximum":10}"#
            ),
            Decoded::Message(ServerMessage::Progress { progress_current: 3, progress_maximum: 10, .. })
        ));
        assert!(matches!(
            decode_message(r#"{"type":"signal","name":"dirty"}"#),
            Decoded::Message(ServerMessage::Signal { name, .. }) if name == "dirty"
        ));
    }

    #[test]
    fn test_decode_unknown_and_garbled() {
        assert!(matches!(
            decode_message(r#"{"type":"telemetry"}"#),
            Decoded::Unknown(kind) if kind == "telemetry"
        ));
        assert!(matches!(decode_message("{not json"), Decoded::Garbled(_)));
        assert!(matches!(
            decode_message(r#"{"type":"reply"}"#),
            Decoded::Garbled(_)
        ));
    }

    #[test]
    fn test_encode_request_merges_params() {
        let params = ConfigureParams {
            cache_arguments: vec!["-DA=1".into()],
        };
        let text = encode_request("configure", "abc", &params).unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(
            value,
            json!({"type": "configure", "cookie": "abc", "cacheArguments": ["-DA=1"]})
        );

        let text = encode_request("compute", "c2", &NoParams {}).unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value, json!({"type": "compute", "cookie": "c2"}));
    }

    #[test]
    fn test_handshake_params_skip_unset() {
        let params = HandshakeParams {
            protocol_version: Some(ProtocolVersion {
                major: 1,
                minor: 1,
                is_experimental: false,
            }),
            build_directory: "/b".into(),
            generator: Some("Ninja".into()),
            source_directory: Some("/s".into()),
            ..Default::default()
        };
        let value = serde_json::to_value(&params).unwrap();
        assert_eq!(
            value,
            json!({
                "protocolVersion": {"major": 1, "minor": 1},
                "buildDirectory": "/b",
                "sourceDirectory": "/s",
                "generator": "Ninja"
            })
        );
    }

    #[test]
    fn test_server_cache_entry_conversion() {
        let content: CacheContent = serde_json::from_value(json!({
            "cache": [
                {"key": "CMAKE_BUILD_TYPE", "type": "STRING", "value": "Debug",
                 "properties": {"HELPSTRING": "Build type", "ADVANCED": "0"}},
                {"key": "CMAKE_AR", "type": "FILEPATH", "value": "/usr/bin/ar",
                 "properties": {"HELPSTRING": "Archiver", "ADVANCED": "1"}},
                {"key": "ON_OFF", "type": "BOOL", "value": "OFF"},
                {"key": "WEIRD", "type": "MYSTERY", "value": "x"}
            ]
        }))
        .unwrap();

        let entries: Vec<_> = content
            .cache
            .iter()
            .filter_map(ServerCacheEntry::to_cache_entry)
            .collect();
        assert_eq!(entries.len(), 3);
        assert!(!entries[0].advanced());
        assert_eq!(entries[0].help_string(), "Build type");
        assert!(entries[1].advanced());
        assert_eq!(entries[2].value(), &CacheValue::Bool(false));
    }

    #[test]
    fn test_code_model_defaults() {
        let model: CodeModel = serde_json::from_value(json!({
            "configurations": [{
                "name": "Debug",
                "projects": [{
                    "name": "demo",
                    "targets": [
                        {"name": "app", "type": "EXECUTABLE", "artifacts": ["/b/app"]},
                        {"name": "lib", "type": "STATIC_LIBRARY"}
                    ]
                }]
            }]
        }))
        .unwrap();
        let targets = &model.configurations[0].projects[0].targets;
        assert!(targets[0].is_executable());
        assert!(!targets[1].is_executable());
        assert!(targets[1].file_groups.is_empty());
    }
}
