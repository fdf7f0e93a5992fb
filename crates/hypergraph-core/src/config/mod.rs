//! Configuration management
//!
//! Settings live in `settings.toml` at the project root. Loading applies
//! command-line overrides (a TOML table deep-merged over the file), resolves
//! relative storage paths against the root directory, and validates the
//! result. API keys are never read from the file; each model names the
//! environment variable that holds its key.

use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, anyhow, bail};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// File name searched for in the project root
pub const SETTINGS_FILE: &str = "settings.toml";

/// Model id used by every workflow unless configured otherwise
pub const DEFAULT_COMPLETION_MODEL_ID: &str = "default_completion_model";

/// Hypergraph configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Root directory the configuration was loaded from
    #[serde(skip)]
    pub root_dir: PathBuf,
    /// Completion models by id
    pub models: BTreeMap<String, ModelConfig>,
    pub cache: CacheConfig,
    pub input_storage: StorageConfig,
    pub output_storage: StorageConfig,
    /// Where incremental runs stage their delta output
    pub update_output_storage: StorageConfig,
    pub reporting: ReportingConfig,
    /// Ceiling on in-flight work items per stage
    pub concurrent_requests: usize,
    pub extract_graph: ExtractGraphConfig,
    pub summarize_descriptions: SummarizeDescriptionsConfig,
    pub extract_claims: ExtractClaimsConfig,
    pub entity_resolution: EntityResolutionConfig,
    pub prune_graph: PruneGraphConfig,
    pub snapshots: SnapshotsConfig,
    /// Explicit workflow list overriding the default pipeline
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflows: Option<Vec<String>>,
}

/// Settings for one completion model
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ModelConfig {
    /// Provider discriminator (`openai_compatible`, `mock`)
    pub provider: String,
    /// Model name sent to the provider
    pub model: String,
    /// Base URL of an OpenAI-compatible endpoint
    pub api_base: Option<String>,
    /// Environment variable holding the API key
    pub api_key_env: Option<String>,
    /// Must stay empty: keys come from the environment only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    pub timeout_secs: u64,
    /// Canned responses for the `mock` provider (cycled in order)
    pub mock_responses: Vec<String>,
    pub rate_limit: RateLimitConfig,
    pub retry: RetryConfig,
    /// Record per-model metrics
    pub metrics: bool,
    /// Probability of injecting a transient failure (testing aid)
    pub failure_rate: f64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: "openai_compatible".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_base: None,
            api_key_env: Some("OPENAI_API_KEY".to_string()),
            api_key: None,
            temperature: 0.0,
            max_tokens: None,
            timeout_secs: 180,
            mock_responses: Vec::new(),
            rate_limit: RateLimitConfig::default(),
            retry: RetryConfig::default(),
            metrics: true,
            failure_rate: 0.0,
        }
    }
}

impl ModelConfig {
    /// Resolve the API key from the configured environment variable
    pub fn resolved_api_key(&self) -> Option<String> {
        self.api_key_env
            .as_deref()
            .and_then(|name| env::var(name).ok())
            .filter(|key| !key.is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Limiter discriminator (`quota`, `none`)
    pub strategy: String,
    /// Maximum concurrent in-flight calls
    pub max_concurrent: usize,
    /// Requests allowed per period
    pub requests_per_period: Option<u32>,
    /// Estimated tokens allowed per period
    pub tokens_per_period: Option<u64>,
    pub period_secs: u64,
    /// How long a caller may wait for a permit
    pub acquire_timeout_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            strategy: "quota".to_string(),
            max_concurrent: 25,
            requests_per_period: None,
            tokens_per_period: None,
            period_secs: 60,
            acquire_timeout_secs: 600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    /// Backoff discriminator (`exponential_backoff`, `immediate`)
    pub strategy: String,
    /// Total attempts, including the first
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            strategy: "exponential_backoff".to_string(),
            max_attempts: 5,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            jitter: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    /// Backend discriminator (`memory`, `file`, `none`)
    pub backend: String,
    pub base_dir: PathBuf,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: "file".to_string(),
            base_dir: PathBuf::from("cache"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StorageConfig {
    pub base_dir: PathBuf,
}

impl StorageConfig {
    fn new(base_dir: &str) -> Self {
        Self {
            base_dir: PathBuf::from(base_dir),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::new("output")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReportingConfig {
    pub base_dir: PathBuf,
}

impl Default for ReportingConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("logs"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExtractGraphConfig {
    pub completion_model_id: String,
    /// Cache partition for this workflow's model calls
    pub model_instance_name: String,
    /// Path to a custom extraction prompt
    pub prompt: Option<PathBuf>,
    pub entity_types: Vec<String>,
    pub relationship_types: Vec<String>,
    /// Drop entities whose type is not in `entity_types`
    pub strict_entity_types: bool,
    /// Drop relationships whose label is not in `relationship_types`
    pub strict_relationship_types: bool,
    /// Raw ontology text injected into the prompt
    pub ontology: Option<String>,
    pub max_gleanings: u32,
}

impl Default for ExtractGraphConfig {
    fn default() -> Self {
        Self {
            completion_model_id: DEFAULT_COMPLETION_MODEL_ID.to_string(),
            model_instance_name: "extract_graph".to_string(),
            prompt: None,
            entity_types: ["organization", "person", "geo", "event"]
                .into_iter()
                .map(String::from)
                .collect(),
            relationship_types: Vec::new(),
            strict_entity_types: false,
            strict_relationship_types: false,
            ontology: None,
            max_gleanings: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SummarizeDescriptionsConfig {
    pub completion_model_id: String,
    pub model_instance_name: String,
    pub prompt: Option<PathBuf>,
    /// Target summary length in words
    pub max_length: usize,
    /// Input budget for the descriptions fed to one summary call
    pub max_input_tokens: usize,
}

impl Default for SummarizeDescriptionsConfig {
    fn default() -> Self {
        Self {
            completion_model_id: DEFAULT_COMPLETION_MODEL_ID.to_string(),
            model_instance_name: "summarize_descriptions".to_string(),
            prompt: None,
            max_length: 500,
            max_input_tokens: 4_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExtractClaimsConfig {
    pub enabled: bool,
    pub completion_model_id: String,
    pub model_instance_name: String,
    pub prompt: Option<PathBuf>,
    /// What counts as a claim
    pub description: String,
    pub max_gleanings: u32,
}

impl Default for ExtractClaimsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            completion_model_id: DEFAULT_COMPLETION_MODEL_ID.to_string(),
            model_instance_name: "extract_claims".to_string(),
            prompt: None,
            description: "Any claims or facts that could be relevant to information discovery."
                .to_string(),
            max_gleanings: 1,
        }
    }
}

/// Fold entities the model judges to be the same, before summarization
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EntityResolutionConfig {
    pub enabled: bool,
    pub completion_model_id: String,
    pub model_instance_name: String,
    pub prompt: Option<PathBuf>,
}

impl Default for EntityResolutionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            completion_model_id: DEFAULT_COMPLETION_MODEL_ID.to_string(),
            model_instance_name: "entity_resolution".to_string(),
            prompt: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PruneGraphConfig {
    pub enabled: bool,
    pub min_node_freq: u64,
    pub min_node_degree: u64,
    /// Percentile (0-100) below which edges are dropped
    pub min_edge_weight_pct: f64,
}

impl Default for PruneGraphConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            min_node_freq: 2,
            min_node_degree: 1,
            min_edge_weight_pct: 40.0,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SnapshotsConfig {
    /// Write `raw_entities` / `raw_relationships` before summarization
    pub raw_graph: bool,
}

impl Default for Config {
    fn default() -> Self {
        let mut models = BTreeMap::new();
        models.insert(
            DEFAULT_COMPLETION_MODEL_ID.to_string(),
            ModelConfig::default(),
        );

        Self {
            root_dir: PathBuf::from("."),
            models,
            cache: CacheConfig::default(),
            input_storage: StorageConfig::new("input"),
            output_storage: StorageConfig::new("output"),
            update_output_storage: StorageConfig::new("update_output"),
            reporting: ReportingConfig::default(),
            concurrent_requests: 25,
            extract_graph: ExtractGraphConfig::default(),
            summarize_descriptions: SummarizeDescriptionsConfig::default(),
            extract_claims: ExtractClaimsConfig::default(),
            entity_resolution: EntityResolutionConfig::default(),
            prune_graph: PruneGraphConfig::default(),
            snapshots: SnapshotsConfig::default(),
            workflows: None,
        }
    }
}

impl Config {
    /// Path of the settings file under `root_dir`
    pub fn settings_path(root_dir: &Path) -> PathBuf {
        root_dir.join(SETTINGS_FILE)
    }

    /// Load configuration from `root_dir`, applying overrides on top.
    ///
    /// A missing settings file yields the defaults (still overridable).
    pub fn load(root_dir: &Path, overrides: Option<&toml::Table>) -> anyhow::Result<Self> {
        let path = Self::settings_path(root_dir);

        let mut table = if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            contents
                .parse::<toml::Table>()
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?
        } else {
            toml::Table::new()
        };

        if let Some(overrides) = overrides {
            deep_merge(&mut table, overrides);
        }

        let mut config: Config = toml::Value::Table(table)
            .try_into()
            .with_context(|| format!("Invalid configuration in {}", path.display()))?;
        config.root_dir = root_dir.to_path_buf();
        config.resolve_paths();
        config.validate()?;
        Ok(config)
    }

    fn resolve_paths(&mut self) {
        let root = self.root_dir.clone();
        let resolve = |path: &mut PathBuf| {
            if path.is_relative() {
                *path = root.join(&*path);
            }
        };
        resolve(&mut self.cache.base_dir);
        resolve(&mut self.input_storage.base_dir);
        resolve(&mut self.output_storage.base_dir);
        resolve(&mut self.update_output_storage.base_dir);
        resolve(&mut self.reporting.base_dir);
        for prompt in [
            &mut self.extract_graph.prompt,
            &mut self.summarize_descriptions.prompt,
            &mut self.extract_claims.prompt,
            &mut self.entity_resolution.prompt,
        ]
        .into_iter()
        .flatten()
        {
            resolve(prompt);
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let extract = &self.extract_graph;
        if extract.strict_entity_types && !has_non_blank(&extract.entity_types) {
            bail!(
                "extract_graph.strict_entity_types requires extract_graph.entity_types to include at least one type."
            );
        }
        if extract.strict_relationship_types && !has_non_blank(&extract.relationship_types) {
            bail!(
                "extract_graph.strict_relationship_types requires extract_graph.relationship_types to include at least one type."
            );
        }

        if self.concurrent_requests == 0 {
            bail!("concurrent_requests must be greater than 0");
        }

        // (section, completion_model_id, model_instance_name)
        let mut referenced = vec![
            (
                "extract_graph",
                extract.completion_model_id.as_str(),
                extract.model_instance_name.as_str(),
            ),
            (
                "summarize_descriptions",
                self.summarize_descriptions.completion_model_id.as_str(),
                self.summarize_descriptions.model_instance_name.as_str(),
            ),
        ];
        if self.extract_claims.enabled {
            referenced.push((
                "extract_claims",
                self.extract_claims.completion_model_id.as_str(),
                self.extract_claims.model_instance_name.as_str(),
            ));
        }
        if self.entity_resolution.enabled {
            referenced.push((
                "entity_resolution",
                self.entity_resolution.completion_model_id.as_str(),
                self.entity_resolution.model_instance_name.as_str(),
            ));
        }
        let mut instances: BTreeMap<&str, (&str, &str)> = BTreeMap::new();
        for (section, model_id, instance) in referenced {
            if !self.models.contains_key(model_id) {
                bail!(
                    "{}.completion_model_id references unknown model '{}'. Configured models: {}",
                    section,
                    model_id,
                    self.models.keys().cloned().collect::<Vec<_>>().join(", ")
                );
            }
            // One instance is one cache partition and one limiter; it cannot serve two models
            match instances.get(instance) {
                Some((other_section, other_model)) if *other_model != model_id => bail!(
                    "{}.model_instance_name '{}' is also used by {} with model '{}'; give each model its own model_instance_name",
                    section,
                    instance,
                    other_section,
                    other_model
                ),
                Some(_) => {}
                None => {
                    instances.insert(instance, (section, model_id));
                }
            }
        }

        for (id, model) in &self.models {
            if model.api_key.is_some() {
                return Err(anyhow!(
                    "models.{}.api_key: API keys must be provided via environment variables (api_key_env), not stored in configuration",
                    id
                ));
            }
            if model.rate_limit.max_concurrent == 0 {
                bail!("models.{}.rate_limit.max_concurrent must be greater than 0", id);
            }
            if model.rate_limit.period_secs == 0 {
                bail!("models.{}.rate_limit.period_secs must be greater than 0", id);
            }
            if model.retry.max_attempts == 0 {
                bail!("models.{}.retry.max_attempts must be at least 1", id);
            }
            if !(0.0..=1.0).contains(&model.failure_rate) {
                bail!("models.{}.failure_rate must be between 0.0 and 1.0", id);
            }
        }

        if !(0.0..=100.0).contains(&self.prune_graph.min_edge_weight_pct) {
            bail!("prune_graph.min_edge_weight_pct must be between 0 and 100");
        }

        Ok(())
    }

    /// Look up a completion model by id
    pub fn completion_model(&self, model_id: &str) -> Result<&ModelConfig> {
        self.models.get(model_id).ok_or_else(|| {
            Error::ConfigError(format!("Completion model '{}' is not configured", model_id))
        })
    }

    /// Get a configuration value by dotted key, rendered as TOML
    pub fn get(&self, key: &str) -> anyhow::Result<String> {
        let root = toml::Value::try_from(self).context("Failed to serialize config")?;
        let value = key
            .split('.')
            .try_fold(&root, |value, segment| value.get(segment))
            .ok_or_else(|| anyhow!("Unknown configuration key: {}", key))?;

        Ok(match value {
            toml::Value::String(s) => s.clone(),
            toml::Value::Table(table) => toml::to_string_pretty(table)?,
            other => other.to_string(),
        })
    }

    /// Render the whole configuration as TOML
    pub fn to_toml(&self) -> anyhow::Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize config")
    }
}

fn has_non_blank(values: &[String]) -> bool {
    values.iter().any(|v| !v.trim().is_empty())
}

/// Recursively merge `overrides` into `base`; tables merge, everything else replaces
pub fn deep_merge(base: &mut toml::Table, overrides: &toml::Table) {
    for (key, value) in overrides {
        match (base.get_mut(key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                deep_merge(existing, incoming);
            }
            _ => {
                base.insert(key.clone(), value.clone());
            }
        }
    }
}

/// Parse `a.b.c=value` assignments into a nested override table.
///
/// Values are parsed as TOML scalars or arrays when possible and fall back
/// to plain strings, so `--set concurrent_requests=4` yields an integer and
/// `--set output_storage.base_dir=out` a string.
pub fn parse_overrides<S: AsRef<str>>(assignments: &[S]) -> anyhow::Result<toml::Table> {
    let mut table = toml::Table::new();
    for assignment in assignments {
        let assignment = assignment.as_ref();
        let (key, raw) = assignment
            .split_once('=')
            .ok_or_else(|| anyhow!("Override '{}' must have the form key=value", assignment))?;
        let segments: Vec<&str> = key.trim().split('.').map(str::trim).collect();
        if segments.iter().any(|s| s.is_empty()) {
            bail!("Override key '{}' is not a valid dotted path", key);
        }

        let value = parse_override_value(raw.trim());
        let mut nested = toml::Table::new();
        let (leaf, parents) = segments
            .split_last()
            .ok_or_else(|| anyhow!("Override key '{}' is empty", key))?;
        nested.insert(leaf.to_string(), value);
        for parent in parents.iter().rev() {
            let mut wrapper = toml::Table::new();
            wrapper.insert(parent.to_string(), toml::Value::Table(nested));
            nested = wrapper;
        }
        deep_merge(&mut table, &nested);
    }
    Ok(table)
}

fn parse_override_value(raw: &str) -> toml::Value {
    format!("v = {}", raw)
        .parse::<toml::Table>()
        .ok()
        .and_then(|mut t| t.remove("v"))
        .unwrap_or_else(|| toml::Value::String(raw.to_string()))
}
