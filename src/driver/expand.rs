//! `${variable}` expansion for settings strings
//!
//! Supported references:
//!
//! | Reference | Value |
//! |---|---|
//! | `${workspaceFolder}` / `${workspaceRoot}` | source directory |
//! | `${workspaceFolderBasename}` / `${workspaceRootFolderName}` | its final component |
//! | `${buildType}`, `${buildKit}`, `${generator}`, `${userHome}` | current selections |
//! | `${variant:NAME}` | variant-defined variable |
//! | `${env:NAME}` / `${env.NAME}` | environment variable, empty if unset |
//! | `${command:ID}` | output of an editor command, run at most once per string |
//!
//! Unknown references are left untouched.

use async_trait::async_trait;
use regex::Regex;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, LazyLock};
use tracing::{debug, trace};

static VARIABLE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([^}]+)\}").expect("valid regex"));

/// Runs host commands referenced as `${command:ID}`
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn execute(&self, command: &str) -> Option<String>;
}

#[derive(Clone, Default)]
pub struct ExpansionContext {
    pub source_dir: PathBuf,
    pub build_type: String,
    pub build_kit: String,
    pub generator: String,
    pub variant_vars: BTreeMap<String, String>,
    /// Consulted before the process environment
    pub environment: BTreeMap<String, String>,
    pub commands: Option<Arc<dyn CommandExecutor>>,
}

impl std::fmt::Debug for ExpansionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExpansionContext")
            .field("source_dir", &self.source_dir)
            .field("build_type", &self.build_type)
            .field("build_kit", &self.build_kit)
            .field("generator", &self.generator)
            .finish_non_exhaustive()
    }
}

fn user_home() -> String {
    std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .unwrap_or_default()
}

impl ExpansionContext {
    fn env_value(&self, name: &str) -> String {
        self.environment
            .get(name)
            .cloned()
            .or_else(|| std::env::var(name).ok())
            .unwrap_or_default()
    }

    fn simple_value(&self, name: &str) -> Option<String> {
        let value = match name {
            "workspaceFolder" | "workspaceRoot" => self.source_dir.to_string_lossy().into_owned(),
            "workspaceFolderBasename" | "workspaceRootFolderName" => self
                .source_dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            "buildType" => self.build_type.clone(),
            "buildKit" => self.build_kit.clone(),
            "generator" => self.generator.clone(),
            "userHome" => user_home(),
            _ => {
                if let Some(var) = name
                    .strip_prefix("env:")
                    .or_else(|| name.strip_prefix("env."))
                {
                    return Some(self.env_value(var));
                }
                if let Some(var) = name.strip_prefix("variant:") {
                    return self.variant_vars.get(var).cloned();
                }
                return None;
            }
        };
        Some(value)
    }

    /// Expand every reference in `input`
    pub async fn expand(&self, input: &str) -> String {
        if !input.contains("${") {
            return input.to_string();
        }

        let references: Vec<(usize, usize, String)> = VARIABLE_RE
            .captures_iter(input)
            .filter_map(|caps| {
                let whole = caps.get(0)?;
                let name = caps.get(1)?;
                Some((whole.start(), whole.end(), name.as_str().to_string()))
            })
            .collect();

        let mut commands: HashMap<String, Option<String>> = HashMap::new();
        let mut out = String::with_capacity(input.len());
        let mut last = 0;
        for (start, end, name) in references {
            out.push_str(&input[last..start]);
            let value = match name.strip_prefix("command:") {
                Some(command) => self.run_command(command, &mut commands).await,
                None => self.simple_value(&name),
            };
            match value {
                Some(value) => out.push_str(&value),
                None => {
                    debug!("Leaving unknown variable ${{{}}} unexpanded", name);
                    out.push_str(&input[start..end]);
                }
            }
            last = end;
        }
        out.push_str(&input[last..]);
        trace!("Expanded '{}' to '{}'", input, out);
        out
    }

    async fn run_command(
        &self,
        command: &str,
        memo: &mut HashMap<String, Option<String>>,
    ) -> Option<String> {
        if let Some(result) = memo.get(command) {
            return result.clone();
        }
        let result = match &self.commands {
            Some(executor) => executor.execute(command).await,
            None => None,
        };
        memo.insert(command.to_string(), result.clone());
        result
    }

    pub async fn expand_all(&self, inputs: &[String]) -> Vec<String> {
        let mut out = Vec::with_capacity(inputs.len());
        for input in inputs {
            out.push(self.expand(input).await);
        }
        out
    }

    pub async fn expand_map(&self, map: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        let mut out = BTreeMap::new();
        for (key, value) in map {
            out.insert(key.clone(), self.expand(value).await);
        }
        out
    }
}
