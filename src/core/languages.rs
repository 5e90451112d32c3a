//! Language runner registry
//!
//! Maps a language id (or alias) to the recipe used to build and run it.
//! The registry is filled once at startup and only read afterwards, so the
//! engine shares it behind an `Arc` without locking.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use super::limits::ResourceLimits;
use crate::error::{EngineError, Result};

/// Built-in language catalog
const BUILTIN_CATALOG: &str = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/files/languages.toml"));

/// Placeholder replaced by the language's source file name in command templates
const SOURCE_PLACEHOLDER: &str = "{source}";

/// Build/run recipe for one language
#[derive(Debug, Clone, PartialEq)]
pub struct RunnerDescriptor {
    /// Canonical language id (lowercase)
    pub id: String,
    /// Display name (e.g., "C++")
    pub name: String,
    /// Toolchain version shown to users
    pub version: String,
    /// Name of the source file for single-file submissions (e.g., "main.cpp")
    pub source_file: String,
    /// Build command template (None for interpreted languages)
    pub build_command: Option<Vec<String>>,
    /// Run command template
    pub run_command: Vec<String>,
    /// Default run-phase ceilings
    pub limits: ResourceLimits,
    /// Build-phase ceilings
    pub build_limits: ResourceLimits,
    /// Reference to the pre-built toolchain environment
    pub environment: Option<String>,
}

impl RunnerDescriptor {
    pub fn new(id: impl Into<String>, source_file: impl Into<String>, run_command: &[&str]) -> Self {
        let id = id.into().to_lowercase();
        Self {
            name: id.clone(),
            id,
            version: String::new(),
            source_file: source_file.into(),
            build_command: None,
            run_command: run_command.iter().map(|s| s.to_string()).collect(),
            limits: ResourceLimits::RUN_DEFAULT,
            build_limits: ResourceLimits::BUILD_DEFAULT,
            environment: None,
        }
    }

    pub fn with_build_command(mut self, command: &[&str]) -> Self {
        self.build_command = Some(command.iter().map(|s| s.to_string()).collect());
        self
    }

    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_build_limits(mut self, limits: ResourceLimits) -> Self {
        self.build_limits = limits;
        self
    }

    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = Some(environment.into());
        self
    }

    /// Interpreted languages have no build phase.
    pub fn needs_build(&self) -> bool {
        self.build_command.is_some()
    }

    /// Build argv with placeholders expanded
    pub fn build_argv(&self) -> Option<Vec<String>> {
        self.build_command.as_deref().map(|cmd| self.render(cmd))
    }

    /// Run argv with placeholders expanded
    pub fn run_argv(&self) -> Vec<String> {
        self.render(&self.run_command)
    }

    fn render(&self, template: &[String]) -> Vec<String> {
        template
            .iter()
            .map(|arg| arg.replace(SOURCE_PLACEHOLDER, &self.source_file))
            .collect()
    }

    pub fn info(&self) -> LanguageInfo {
        LanguageInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            version: self.version.clone(),
        }
    }
}

/// Public catalog entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LanguageInfo {
    pub id: String,
    pub name: String,
    pub version: String,
}

/// Language id -> descriptor table
#[derive(Debug, Default)]
pub struct Registry {
    descriptors: HashMap<String, Arc<RunnerDescriptor>>,
    aliases: HashMap<String, String>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in catalog (python, cpp, javascript)
    pub fn builtin() -> Result<Self> {
        Self::from_toml(BUILTIN_CATALOG)
    }

    /// Load a catalog file, falling back to the built-in one when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => {
                let content = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read language catalog {}", path.display()))
                    .map_err(|e| EngineError::Config(format!("{:#}", e)))?;
                Self::from_toml(&content)
            }
            None => Self::builtin(),
        }
    }

    /// Parse a TOML catalog and register every language in it
    pub fn from_toml(content: &str) -> Result<Self> {
        let raw: RawCatalog =
            toml::from_str(content).map_err(|e| EngineError::Config(e.to_string()))?;

        let build_defaults = raw.build_limits.apply(ResourceLimits::BUILD_DEFAULT)?;
        let run_defaults = raw.limits.apply(ResourceLimits::RUN_DEFAULT)?;

        let mut registry = Registry::new();
        for (id, lang) in raw.languages {
            let run_command = lang.run_command.into_argv();
            if run_command.is_empty() {
                return Err(EngineError::Config(format!(
                    "empty run_command for {}",
                    id
                )));
            }
            let build_command = lang.build_command.map(RawCommand::into_argv);
            if matches!(&build_command, Some(cmd) if cmd.is_empty()) {
                return Err(EngineError::Config(format!(
                    "empty build_command for {}",
                    id
                )));
            }

            let descriptor = RunnerDescriptor {
                id: id.to_lowercase(),
                name: lang.name.unwrap_or_else(|| id.clone()),
                version: lang.version.unwrap_or_default(),
                source_file: lang.source_file,
                build_command,
                run_command,
                limits: lang.limits.apply(run_defaults)?,
                build_limits: lang.build_limits.apply(build_defaults)?,
                environment: lang.environment,
            };
            let canonical = descriptor.id.clone();
            registry.register(&canonical, descriptor)?;

            for alias in lang.aliases {
                registry.alias(&alias, &canonical)?;
            }
        }

        Ok(registry)
    }

    /// Register a descriptor under `id`, which must be the descriptor's own
    /// id (case-insensitive). `resolve` hands back this exact descriptor.
    pub fn register(&mut self, id: &str, descriptor: RunnerDescriptor) -> Result<()> {
        let key = id.to_lowercase();
        if descriptor.id.to_lowercase() != key {
            return Err(EngineError::Config(format!(
                "descriptor {} registered under id {}",
                descriptor.id, id
            )));
        }
        if self.contains(&key) {
            return Err(EngineError::DuplicateLanguage(key));
        }
        descriptor.limits.validate()?;
        descriptor.build_limits.validate()?;

        self.descriptors.insert(key, Arc::new(descriptor));
        Ok(())
    }

    /// Make `alias` resolve to the already registered `id`.
    pub fn alias(&mut self, alias: &str, id: &str) -> Result<()> {
        let alias = alias.to_lowercase();
        let id = id.to_lowercase();
        if !self.descriptors.contains_key(&id) {
            return Err(EngineError::UnknownLanguage(id));
        }
        if self.contains(&alias) {
            return Err(EngineError::DuplicateLanguage(alias));
        }
        self.aliases.insert(alias, id);
        Ok(())
    }

    /// Look up a language by id or alias (case-insensitive)
    pub fn resolve(&self, language: &str) -> Result<Arc<RunnerDescriptor>> {
        let key = language.to_lowercase();
        let id = self.aliases.get(&key).unwrap_or(&key);
        self.descriptors
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::UnknownLanguage(language.to_string()))
    }

    pub fn contains(&self, language: &str) -> bool {
        let key = language.to_lowercase();
        self.descriptors.contains_key(&key) || self.aliases.contains_key(&key)
    }

    /// All registered languages, sorted by id (aliases excluded)
    pub fn languages(&self) -> Vec<LanguageInfo> {
        let mut infos: Vec<_> = self.descriptors.values().map(|d| d.info()).collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}

/// Raw TOML catalog
#[derive(Debug, Deserialize)]
struct RawCatalog {
    #[serde(default)]
    limits: RawLimits,
    #[serde(default)]
    build_limits: RawLimits,
    #[serde(default)]
    languages: BTreeMap<String, RawLanguageConfig>,
}

/// Raw TOML configuration for a language
#[derive(Debug, Deserialize)]
struct RawLanguageConfig {
    name: Option<String>,
    version: Option<String>,
    source_file: String,
    build_command: Option<RawCommand>,
    run_command: RawCommand,
    environment: Option<String>,
    #[serde(default)]
    limits: RawLimits,
    #[serde(default)]
    build_limits: RawLimits,
    #[serde(default)]
    aliases: Vec<String>,
}

/// A command either as a whitespace-separated line or as an explicit argv
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawCommand {
    Line(String),
    Argv(Vec<String>),
}

impl RawCommand {
    fn into_argv(self) -> Vec<String> {
        match self {
            RawCommand::Line(line) => line.split_whitespace().map(|s| s.to_string()).collect(),
            RawCommand::Argv(argv) => argv,
        }
    }
}

/// Limits in catalog units; unset fields inherit
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawLimits {
    cpu_time_ms: Option<u64>,
    wall_time_ms: Option<u64>,
    memory_mb: Option<u64>,
    output_kb: Option<u64>,
    processes: Option<u32>,
}

impl RawLimits {
    fn apply(&self, base: ResourceLimits) -> Result<ResourceLimits> {
        let limits = ResourceLimits {
            cpu_time_ms: self.cpu_time_ms.unwrap_or(base.cpu_time_ms),
            wall_time_ms: self.wall_time_ms.unwrap_or(base.wall_time_ms),
            memory_bytes: scaled("memory_mb", self.memory_mb, 1024 * 1024)?
                .unwrap_or(base.memory_bytes),
            output_bytes: scaled("output_kb", self.output_kb, 1024)?.unwrap_or(base.output_bytes),
            processes: self.processes.unwrap_or(base.processes),
        };
        limits.validate()?;
        Ok(limits)
    }
}

/// Convert a catalog quantity to bytes
fn scaled(name: &str, value: Option<u64>, unit: u64) -> Result<Option<u64>> {
    value
        .map(|v| {
            v.checked_mul(unit)
                .ok_or_else(|| EngineError::Config(format!("{} = {} is too large", name, v)))
        })
        .transpose()
}
