use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;
use std::sync::RwLock;
use std::time::Duration;

use ai_agent::AgentConfig;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Stored credential bundle for one provider, keyed by credential name.
pub type Credentials = BTreeMap<String, String>;

/// What happens to a step whose dependency ended in error.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyPolicy {
    /// Dispatch anyway with whatever context is available.
    #[default]
    BestEffort,
    /// Mark the step failed without dispatching it.
    FailFast,
}

/// Tunables for the orchestration core. Every field has a default so a
/// partial JSON file is enough.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub gateway_timeout_ms: u64,
    pub approval_timeout_ms: u64,
    pub channel_approval_timeout_ms: u64,
    pub search_limit: usize,
    pub step_max_iterations: usize,
    pub dependency_context_chars: usize,
    pub dependency_policy: DependencyPolicy,
    pub cost_lookup_timeout_ms: u64,
    pub turn_max_steps: usize,
    pub system_prompt: Option<String>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            gateway_timeout_ms: 120_000,
            approval_timeout_ms: 120_000,
            channel_approval_timeout_ms: 300_000,
            search_limit: 10,
            step_max_iterations: 3,
            dependency_context_chars: 4_000,
            dependency_policy: DependencyPolicy::BestEffort,
            cost_lookup_timeout_ms: 2_000,
            turn_max_steps: ai_agent::DEFAULT_AGENT_MAX_STEPS,
            system_prompt: None,
        }
    }
}

impl OrchestratorConfig {
    /// Reads the config from a JSON file, falling back to defaults when the
    /// file does not exist.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading orchestrator config at {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("parsing orchestrator config at {}", path.display()))
    }

    pub fn gateway_timeout(&self) -> Duration {
        Duration::from_millis(self.gateway_timeout_ms)
    }

    pub fn approval_timeout(&self) -> Duration {
        Duration::from_millis(self.approval_timeout_ms)
    }

    pub fn channel_approval_timeout(&self) -> Duration {
        Duration::from_millis(self.channel_approval_timeout_ms)
    }

    pub fn agent_config(&self) -> AgentConfig {
        let mut config = AgentConfig {
            max_steps: self.turn_max_steps,
            cost_lookup_timeout: Duration::from_millis(self.cost_lookup_timeout_ms),
            ..AgentConfig::default()
        };
        if let Some(prompt) = &self.system_prompt {
            config.system_prompt = prompt.clone();
        }
        config
    }
}

/// Read-only view of provider enablement and credentials. The orchestration
/// core never writes through this trait.
pub trait ConfigStore: Send + Sync {
    fn is_enabled(&self, provider_id: &str) -> bool;
    fn credentials(&self, provider_id: &str) -> Credentials;
    fn oauth_completed(&self, provider_id: &str) -> bool;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderSettings {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub credentials: Credentials,
    #[serde(default)]
    pub oauth_completed: bool,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    providers: HashMap<String, ProviderSettings>,
}

/// Process-local configuration store; providers missing from it count as
/// disabled.
#[derive(Debug, Default)]
pub struct InMemoryConfigStore {
    providers: RwLock<HashMap<String, ProviderSettings>>,
}

impl InMemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let file: ConfigFile = serde_json::from_str(raw).context("parsing provider settings")?;
        Ok(Self {
            providers: RwLock::new(file.providers),
        })
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading provider settings at {}", path.display()))?;
        Self::from_json(&raw)
    }

    pub fn upsert(&self, provider_id: &str, settings: ProviderSettings) {
        self.providers
            .write()
            .expect("provider settings poisoned")
            .insert(provider_id.to_string(), settings);
    }

    pub fn set_enabled(&self, provider_id: &str, enabled: bool) {
        self.update(provider_id, |settings| settings.enabled = enabled);
    }

    pub fn set_credential(&self, provider_id: &str, key: &str, value: &str) {
        self.update(provider_id, |settings| {
            settings
                .credentials
                .insert(key.to_string(), value.to_string());
        });
    }

    pub fn remove_credential(&self, provider_id: &str, key: &str) {
        self.update(provider_id, |settings| {
            settings.credentials.remove(key);
        });
    }

    pub fn set_oauth_completed(&self, provider_id: &str, completed: bool) {
        self.update(provider_id, |settings| settings.oauth_completed = completed);
    }

    fn update(&self, provider_id: &str, apply: impl FnOnce(&mut ProviderSettings)) {
        let mut guard = self.providers.write().expect("provider settings poisoned");
        let settings = guard
            .entry(provider_id.to_string())
            .or_insert_with(|| ProviderSettings {
                enabled: false,
                ..ProviderSettings::default()
            });
        apply(settings);
    }

    fn read<T>(&self, provider_id: &str, project: impl FnOnce(&ProviderSettings) -> T) -> Option<T> {
        self.providers
            .read()
            .expect("provider settings poisoned")
            .get(provider_id)
            .map(project)
    }
}

impl ConfigStore for InMemoryConfigStore {
    fn is_enabled(&self, provider_id: &str) -> bool {
        self.read(provider_id, |settings| settings.enabled)
            .unwrap_or(false)
    }

    fn credentials(&self, provider_id: &str) -> Credentials {
        self.read(provider_id, |settings| settings.credentials.clone())
            .unwrap_or_default()
    }

    fn oauth_completed(&self, provider_id: &str) -> bool {
        self.read(provider_id, |settings| settings.oauth_completed)
            .unwrap_or(false)
    }
}
