//! CMakeCache.txt reader
//!
//! Parses CMake's on-disk text cache into typed entries. Parsing is lenient:
//! malformed lines are logged and skipped, never fatal.
//!
//! Cache file format:
//! ```text
//! // Documentation for the next entry
//! # Full-line comment
//! NAME:TYPE=VALUE
//! NAME-ADVANCED:INTERNAL=1
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, error, trace, warn};

/// File name of the cache inside a binary directory
pub const CACHE_FILE_NAME: &str = "CMakeCache.txt";

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Failed to read cache file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Type tag of a cache entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CacheEntryType {
    Bool,
    String,
    Path,
    FilePath,
    Internal,
    Uninitialized,
    Static,
}

impl CacheEntryType {
    /// Map a cache type name to its tag
    pub fn from_type_name(name: &str) -> Option<Self> {
        match name {
            "BOOL" => Some(Self::Bool),
            "STRING" => Some(Self::String),
            "PATH" => Some(Self::Path),
            "FILEPATH" => Some(Self::FilePath),
            "INTERNAL" => Some(Self::Internal),
            "UNINITIALIZED" => Some(Self::Uninitialized),
            "STATIC" => Some(Self::Static),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Bool => "BOOL",
            Self::String => "STRING",
            Self::Path => "PATH",
            Self::FilePath => "FILEPATH",
            Self::Internal => "INTERNAL",
            Self::Uninitialized => "UNINITIALIZED",
            Self::Static => "STATIC",
        }
    }
}

impl fmt::Display for CacheEntryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.type_name())
    }
}

/// Value of a cache entry. `BOOL` entries are canonicalized to `Bool`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CacheValue {
    Bool(bool),
    String(String),
}

impl CacheValue {
    /// Interpret the value using CMake truthiness rules
    pub fn is_truthy(&self) -> bool {
        match self {
            CacheValue::Bool(b) => *b,
            CacheValue::String(s) => is_truthy(s),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            CacheValue::String(s) => Some(s),
            CacheValue::Bool(_) => None,
        }
    }
}

impl fmt::Display for CacheValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheValue::Bool(true) => f.write_str("ON"),
            CacheValue::Bool(false) => f.write_str("OFF"),
            CacheValue::String(s) => f.write_str(s),
        }
    }
}

/// CMake truthiness for string values.
///
/// `""`, `FALSE`, `OFF`, `0`, `NOTFOUND`, `NO`, `N`, `IGNORE` and anything
/// ending in `-NOTFOUND` are false. Comparison is case-sensitive.
pub fn is_truthy(value: &str) -> bool {
    !matches!(
        value,
        "" | "FALSE" | "OFF" | "0" | "NOTFOUND" | "NO" | "N" | "IGNORE"
    ) && !value.ends_with("-NOTFOUND")
}

/// A single typed cache entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    key: String,
    value: CacheValue,
    entry_type: CacheEntryType,
    help_string: String,
    advanced: bool,
}

impl CacheEntry {
    /// Build an entry, canonicalizing `BOOL` string values
    pub fn new(
        key: impl Into<String>,
        value: CacheValue,
        entry_type: CacheEntryType,
        help_string: impl Into<String>,
        advanced: bool,
    ) -> Self {
        let value = match (entry_type, value) {
            (CacheEntryType::Bool, CacheValue::String(s)) => CacheValue::Bool(is_truthy(&s)),
            (_, v) => v,
        };
        Self {
            key: key.into(),
            value,
            entry_type,
            help_string: help_string.into(),
            advanced,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn value(&self) -> &CacheValue {
        &self.value
    }

    pub fn entry_type(&self) -> CacheEntryType {
        self.entry_type
    }

    pub fn help_string(&self) -> &str {
        &self.help_string
    }

    pub fn advanced(&self) -> bool {
        self.advanced
    }

    /// String form of the value (bools rendered as `ON`/`OFF`)
    pub fn as_string(&self) -> String {
        self.value.to_string()
    }

    /// Render as a `NAME:TYPE=VALUE` cache line
    pub fn to_cache_line(&self) -> String {
        let key = if self.key.contains([':', '=', ' ']) {
            format!("\"{}\"", self.key)
        } else {
            self.key.clone()
        };
        format!("{}:{}={}", key, self.entry_type, self.value)
    }
}

/// Parse cache text into entries keyed by variable name.
///
/// Never fails. `//` lines accumulate documentation for the next entry,
/// `#` lines and blank lines are skipped, `*-ADVANCED` markers are dropped.
pub fn parse(text: &str) -> HashMap<String, CacheEntry> {
    let mut entries = HashMap::new();
    let mut docs = String::new();

    for raw_line in text.lines() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        if let Some(doc) = line.strip_prefix("//") {
            docs.push_str(doc);
            docs.push(' ');
            continue;
        }

        let Some((name, type_name, value)) = split_cache_line(line) else {
            warn!("Unexpected cache line: {}", line);
            continue;
        };

        if name.ends_with("-ADVANCED") && value == "1" {
            trace!("Skipping advanced marker: {}", name);
            continue;
        }

        let Some(type_name) = type_name else {
            warn!("Cache entry '{}' has no type", name);
            docs.clear();
            continue;
        };

        let Some(entry_type) = CacheEntryType::from_type_name(type_name) else {
            error!("Cache entry '{}' has unknown type: '{}'", name, type_name);
            docs.clear();
            continue;
        };

        let help = docs.trim().to_string();
        docs.clear();

        let entry = CacheEntry::new(
            name,
            CacheValue::String(value.to_string()),
            entry_type,
            help,
            false,
        );
        entries.insert(name.to_string(), entry);
    }

    entries
}

/// Split `NAME:TYPE=VALUE` (NAME optionally quoted). `NAME=VALUE` yields no type.
fn split_cache_line(line: &str) -> Option<(&str, Option<&str>, &str)> {
    let (name, rest) = if let Some(quoted) = line.strip_prefix('"') {
        let end = quoted.find('"')?;
        (&quoted[..end], &quoted[end + 1..])
    } else {
        let end = line.find([':', '='])?;
        (&line[..end], &line[end..])
    };

    if name.is_empty() {
        return None;
    }

    if let Some(rest) = rest.strip_prefix(':') {
        let eq = rest.find('=')?;
        let type_name = &rest[..eq];
        if type_name.is_empty() {
            return None;
        }
        Some((name, Some(type_name), &rest[eq + 1..]))
    } else {
        let value = rest.strip_prefix('=')?;
        Some((name, None, value))
    }
}

/// Snapshot of a cache file at a point in time
#[derive(Debug, Clone, Default)]
pub struct CmakeCache {
    path: PathBuf,
    exists: bool,
    entries: HashMap<String, CacheEntry>,
}

impl CmakeCache {
    /// Read and parse the cache at `path`. A missing file is an empty snapshot.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, CacheError> {
        let path = path.as_ref();
        match tokio::fs::read_to_string(path).await {
            Ok(content) => {
                let entries = parse(&content);
                debug!(
                    "Loaded {} cache entries from {}",
                    entries.len(),
                    path.display()
                );
                Ok(Self {
                    path: path.to_path_buf(),
                    exists: true,
                    entries,
                })
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No cache file at {}", path.display());
                Ok(Self::missing(path))
            }
            Err(source) => Err(CacheError::Read {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    /// Empty snapshot for a cache that does not exist
    pub fn missing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            exists: false,
            entries: HashMap::new(),
        }
    }

    /// Snapshot assembled from entries that did not come from a file read
    pub fn from_entries(path: impl Into<PathBuf>, entries: HashMap<String, CacheEntry>) -> Self {
        Self {
            path: path.into(),
            exists: true,
            entries,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.exists
    }

    pub fn get(&self, key: &str) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    pub fn entries(&self) -> &HashMap<String, CacheEntry> {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries sorted by key
    pub fn sorted_entries(&self) -> Vec<&CacheEntry> {
        let mut entries: Vec<_> = self.entries.values().collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        entries
    }

    /// `CMAKE_HOME_DIRECTORY`, the source dir the cache was configured for
    pub fn home_directory(&self) -> Option<PathBuf> {
        self.get("CMAKE_HOME_DIRECTORY")
            .map(|e| PathBuf::from(e.as_string()))
    }

    pub fn generator(&self) -> Option<String> {
        self.get("CMAKE_GENERATOR").map(|e| e.as_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"# This is the CMakeCache file.
# For build in directory: /tmp/build

//Choose the type of build, options are: None Debug Release
// RelWithDebInfo MinSizeRel ...
CMAKE_BUILD_TYPE:STRING=Debug

//Enable/Disable output of compile commands during generation.
CMAKE_EXPORT_COMPILE_COMMANDS:BOOL=ON

//Build tests
ENABLE_TESTS:BOOL=OFF
CMAKE_AR:FILEPATH=/usr/bin/ar
CMAKE_AR-ADVANCED:INTERNAL=1
CMAKE_HOME_DIRECTORY:INTERNAL=/a/b
"#;

    #[test]
    fn test_parse_sample_cache() {
        let entries = parse(SAMPLE);
        assert_eq!(entries.len(), 5);

        let build_type = &entries["CMAKE_BUILD_TYPE"];
        assert_eq!(build_type.entry_type(), CacheEntryType::String);
        assert_eq!(build_type.value(), &CacheValue::String("Debug".into()));
        assert_eq!(
            build_type.help_string(),
            "Choose the type of build, options are: None Debug Release  RelWithDebInfo MinSizeRel ..."
        );

        assert_eq!(
            entries["CMAKE_EXPORT_COMPILE_COMMANDS"].value(),
            &CacheValue::Bool(true)
        );
        assert_eq!(entries["ENABLE_TESTS"].value(), &CacheValue::Bool(false));
        assert_eq!(entries["CMAKE_AR"].help_string(), "");
        assert!(!entries.contains_key("CMAKE_AR-ADVANCED"));
        assert!(!entries["CMAKE_AR"].advanced());
    }

    #[test]
    fn test_docstring_attaches_to_next_entry_only() {
        let entries = parse("//doc one\nA:STRING=1\nB:STRING=2\n");
        assert_eq!(entries["A"].help_string(), "doc one");
        assert_eq!(entries["B"].help_string(), "");
    }

    #[test]
    fn test_bool_truthiness() {
        for falsy in [
            "", "FALSE", "OFF", "0", "NOTFOUND", "NO", "N", "IGNORE", "Foo-NOTFOUND",
        ] {
            assert!(!is_truthy(falsy), "{falsy:?} should be false");
        }
        for truthy in ["ON", "TRUE", "1", "YES", "Y", "anything", "off"] {
            assert!(is_truthy(truthy), "{truthy:?} should be true");
        }

        let entries = parse("X:BOOL=NO\nY:BOOL=YES\nZ:BOOL=lib-NOTFOUND\n");
        assert_eq!(entries["X"].value(), &CacheValue::Bool(false));
        assert_eq!(entries["Y"].value(), &CacheValue::Bool(true));
        assert_eq!(entries["Z"].value(), &CacheValue::Bool(false));
    }

    #[test]
    fn test_malformed_lines_are_skipped() {
        let text = "garbage line\nGOOD:STRING=ok\nBAD:NOSUCHTYPE=1\n:STRING=nokey\nUNTYPED=1\n";
        let entries = parse(text);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries["GOOD"].as_string(), "ok");
    }

    #[test]
    fn test_comments_and_whitespace_only() {
        assert!(parse("").is_empty());
        assert!(parse("   \n\n# comment\n  # indented comment\n").is_empty());
        assert!(parse("// dangling doc with no entry\n").is_empty());
    }

    #[test]
    fn test_value_may_contain_separators() {
        let entries = parse("FLAGS:STRING=-DFOO=1 -I/x:y\n\"WITH SPACE\":PATH=/p\n");
        assert_eq!(entries["FLAGS"].as_string(), "-DFOO=1 -I/x:y");
        assert_eq!(entries["WITH SPACE"].entry_type(), CacheEntryType::Path);
    }

    #[test]
    fn test_cache_line_round_trip() {
        let originals = [
            CacheEntry::new(
                "NAME",
                CacheValue::String("value=with:stuff".into()),
                CacheEntryType::String,
                "",
                false,
            ),
            CacheEntry::new(
                "P",
                CacheValue::String("/usr/bin".into()),
                CacheEntryType::Path,
                "",
                false,
            ),
            CacheEntry::new(
                "B",
                CacheValue::String("NO".into()),
                CacheEntryType::Bool,
                "",
                false,
            ),
        ];
        for entry in originals {
            let parsed = parse(&entry.to_cache_line());
            let back = &parsed[entry.key()];
            assert_eq!(back.key(), entry.key());
            assert_eq!(back.entry_type(), entry.entry_type());
            assert_eq!(back.value(), entry.value());
        }
    }

    #[tokio::test]
    async fn test_missing_file_is_empty_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CmakeCache::from_path(dir.path().join(CACHE_FILE_NAME))
            .await
            .unwrap();
        assert!(!cache.exists());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_from_path_reads_home_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CACHE_FILE_NAME);
        std::fs::write(&path, SAMPLE).unwrap();

        let cache = CmakeCache::from_path(&path).await.unwrap();
        assert!(cache.exists());
        assert_eq!(cache.home_directory(), Some(PathBuf::from("/a/b")));
        assert_eq!(cache.sorted_entries()[0].key(), "CMAKE_AR");
    }
}
