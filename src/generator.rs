//! CMake generator selection
//!
//! A fresh build directory needs a generator. Selection is pluggable through
//! [`GeneratorPicker`]; the default picker walks a preference list and takes
//! the first generator whose build tool is installed.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

/// Generator used when neither the kit nor the settings name one
pub const DEFAULT_PREFERRED_GENERATORS: &[&str] = &["Ninja", "Unix Makefiles"];

/// A CMake generator with optional platform/toolset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Generator {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub toolset: Option<String>,
}

impl Generator {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            platform: None,
            toolset: None,
        }
    }
}

/// Callback consulted when a fresh configure needs a generator
#[async_trait]
pub trait GeneratorPicker: Send + Sync {
    /// Returns `None` when no usable generator is available
    async fn pick_generator(&self) -> Option<Generator>;
}

/// Picks a fixed generator (useful when the user already chose one)
pub struct FixedGenerator(pub Option<Generator>);

#[async_trait]
impl GeneratorPicker for FixedGenerator {
    async fn pick_generator(&self) -> Option<Generator> {
        self.0.clone()
    }
}

/// Walks a preference list and returns the first generator whose build
/// program can be found on `PATH`
pub struct PreferredGeneratorPicker {
    candidates: Vec<Generator>,
}

impl PreferredGeneratorPicker {
    pub fn new(candidates: Vec<Generator>) -> Self {
        Self { candidates }
    }

    /// Candidates from the kit's preference, then the configured list,
    /// then the built-in defaults
    pub fn from_preferences(kit_preferred: Option<&Generator>, configured: &[String]) -> Self {
        let mut candidates: Vec<Generator> = kit_preferred.cloned().into_iter().collect();
        let names: Vec<String> = if configured.is_empty() {
            DEFAULT_PREFERRED_GENERATORS
                .iter()
                .map(|s| s.to_string())
                .collect()
        } else {
            configured.to_vec()
        };
        for name in names {
            if !candidates.iter().any(|g| g.name == name) {
                candidates.push(Generator::new(name));
            }
        }
        Self { candidates }
    }

    pub fn candidates(&self) -> &[Generator] {
        &self.candidates
    }
}

/// Build programs that must exist for a generator to be usable.
/// An empty list means availability cannot be probed and is assumed.
fn build_programs(generator: &str) -> &'static [&'static str] {
    match generator {
        "Ninja" | "Ninja Multi-Config" => &["ninja", "ninja-build"],
        "Unix Makefiles" => &["make"],
        "MinGW Makefiles" => &["mingw32-make", "make"],
        "NMake Makefiles" | "NMake Makefiles JOM" => &["nmake"],
        "MSYS Makefiles" => &["make"],
        _ => &[],
    }
}

fn generator_available(generator: &Generator) -> bool {
    if generator.name.starts_with("Visual Studio") {
        return cfg!(windows);
    }
    if generator.name == "Xcode" {
        return cfg!(target_os = "macos");
    }
    let programs = build_programs(&generator.name);
    if programs.is_empty() {
        return true;
    }
    programs.iter().any(|program| {
        let found = which::which(program).is_ok();
        trace!("Probing {} for generator {}: {}", program, generator.name, found);
        found
    })
}

#[async_trait]
impl GeneratorPicker for PreferredGeneratorPicker {
    async fn pick_generator(&self) -> Option<Generator> {
        let candidates = self.candidates.clone();
        let picked = tokio::task::spawn_blocking(move || {
            candidates.into_iter().find(generator_available)
        })
        .await
        .ok()
        .flatten();

        match &picked {
            Some(g) => debug!("Picked generator: {}", g.name),
            None => debug!("No usable generator among preferences"),
        }
        picked
    }
}
