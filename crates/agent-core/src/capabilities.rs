use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use ai_agent::{param_summary, McpToolDescription, ParamSpec};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::{ConfigStore, Credentials};

const COMPOSITE_SEPARATOR: &str = "__";

/// Invocation contract of a single capability function.
#[async_trait]
pub trait CapabilityHandler: Send + Sync {
    async fn call(&self, args: Value, credentials: Credentials) -> anyhow::Result<Value>;
}

#[derive(Clone)]
pub struct FunctionDef {
    pub name: String,
    pub description: String,
    pub params: Vec<ParamSpec>,
    /// Exempt from approval gating.
    pub auto_allow: bool,
    pub handler: Arc<dyn CapabilityHandler>,
}

impl FunctionDef {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        handler: Arc<dyn CapabilityHandler>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            params: Vec::new(),
            auto_allow: false,
            handler,
        }
    }

    pub fn with_params(mut self, params: Vec<ParamSpec>) -> Self {
        self.params = params;
        self
    }

    pub fn auto_allow(mut self) -> Self {
        self.auto_allow = true;
        self
    }
}

#[derive(Debug, Clone)]
pub struct ModuleDef {
    pub id: String,
    pub name: String,
    pub description: String,
    pub functions: Vec<String>,
}

impl ModuleDef {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        description: impl Into<String>,
        functions: &[&str],
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: description.into(),
            functions: functions.iter().map(|name| name.to_string()).collect(),
        }
    }
}

/// A loaded capability provider and the functions it declares.
#[derive(Clone)]
pub struct ProviderManifest {
    pub id: String,
    pub display_name: String,
    pub description: String,
    pub category: String,
    pub required_credentials: Vec<String>,
    pub requires_oauth: bool,
    pub functions: Vec<FunctionDef>,
    pub modules: Vec<ModuleDef>,
}

impl ProviderManifest {
    pub fn new(
        id: impl Into<String>,
        display_name: impl Into<String>,
        category: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            description: String::new(),
            category: category.into(),
            required_credentials: Vec::new(),
            requires_oauth: false,
            functions: Vec::new(),
            modules: Vec::new(),
        }
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn requires_credential(mut self, key: impl Into<String>) -> Self {
        self.required_credentials.push(key.into());
        self
    }

    pub fn requires_oauth(mut self) -> Self {
        self.requires_oauth = true;
        self
    }

    pub fn function(mut self, function: FunctionDef) -> Self {
        self.functions.push(function);
        self
    }

    pub fn module(mut self, module: ModuleDef) -> Self {
        self.modules.push(module);
        self
    }
}

/// Live set of loaded capability providers.
pub trait ProviderSource: Send + Sync {
    fn providers(&self) -> Vec<Arc<ProviderManifest>>;
}

/// Providers loaded into this process, in load order.
#[derive(Default)]
pub struct ProviderCatalog {
    providers: RwLock<Vec<Arc<ProviderManifest>>>,
}

impl ProviderCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(&self, provider: ProviderManifest) {
        let mut guard = self.providers.write().expect("provider catalog poisoned");
        guard.retain(|existing| existing.id != provider.id);
        guard.push(Arc::new(provider));
    }

    pub fn unload(&self, provider_id: &str) -> bool {
        let mut guard = self.providers.write().expect("provider catalog poisoned");
        let before = guard.len();
        guard.retain(|existing| existing.id != provider_id);
        guard.len() != before
    }
}

impl ProviderSource for ProviderCatalog {
    fn providers(&self) -> Vec<Arc<ProviderManifest>> {
        self.providers
            .read()
            .expect("provider catalog poisoned")
            .clone()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilityRegistryEntry {
    pub full_name: String,
    pub provider_id: String,
    pub function_name: String,
    pub description: String,
    pub param_summary: String,
    pub category: String,
    pub keywords: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleCatalogEntry {
    pub module_ref: String,
    pub name: String,
    pub service: String,
    pub description: String,
    pub category: String,
}

/// Everything needed to invoke one function right now.
#[derive(Clone)]
pub struct ResolvedFunction {
    pub full_name: String,
    pub provider_id: String,
    pub description: String,
    pub params: Vec<ParamSpec>,
    pub auto_allow: bool,
    pub credentials: Credentials,
    pub handler: Arc<dyn CapabilityHandler>,
}

impl ResolvedFunction {
    pub fn tool_description(&self) -> McpToolDescription {
        McpToolDescription::from_params(&self.full_name, &self.description, &self.params)
    }
}

struct LiveFunction {
    provider: Arc<ProviderManifest>,
    function: FunctionDef,
}

struct LiveModule {
    entry: ModuleCatalogEntry,
    functions: Vec<String>,
}

#[derive(Default)]
struct RegistrySnapshot {
    entries: Vec<CapabilityRegistryEntry>,
    functions: HashMap<String, LiveFunction>,
    modules: Vec<LiveModule>,
}

/// Rebuildable index of callable functions. Readers always see one complete
/// snapshot; `rebuild` swaps in a new one.
pub struct CapabilityRegistry {
    source: Arc<dyn ProviderSource>,
    config: Arc<dyn ConfigStore>,
    snapshot: RwLock<Arc<RegistrySnapshot>>,
}

impl CapabilityRegistry {
    pub fn new(source: Arc<dyn ProviderSource>, config: Arc<dyn ConfigStore>) -> Self {
        Self {
            source,
            config,
            snapshot: RwLock::new(Arc::new(RegistrySnapshot::default())),
        }
    }

    fn current(&self) -> Arc<RegistrySnapshot> {
        self.snapshot
            .read()
            .expect("registry snapshot poisoned")
            .clone()
    }

    fn is_available(&self, provider: &ProviderManifest) -> bool {
        if !self.config.is_enabled(&provider.id) {
            return false;
        }
        let credentials = self.config.credentials(&provider.id);
        let has_credentials = provider.required_credentials.iter().all(|key| {
            credentials
                .get(key)
                .map(|value| !value.trim().is_empty())
                .unwrap_or(false)
        });
        if !has_credentials {
            return false;
        }
        !provider.requires_oauth || self.config.oauth_completed(&provider.id)
    }

    /// Recomputes every entry from the loaded providers and their current
    /// configuration state.
    pub fn rebuild(&self) {
        let mut snapshot = RegistrySnapshot::default();

        for provider in self.source.providers() {
            if !self.is_available(&provider) {
                debug!(
                    target: "registry",
                    provider = %provider.id,
                    "provider skipped: disabled, missing credentials or authorization"
                );
                continue;
            }

            for function in &provider.functions {
                let full_name = composite_name(&provider.id, &function.name);
                if snapshot.functions.contains_key(&full_name) {
                    warn!(target: "registry", function = %full_name, "duplicate function ignored");
                    continue;
                }
                snapshot.entries.push(build_entry(&provider, function, &full_name));
                snapshot.functions.insert(
                    full_name,
                    LiveFunction {
                        provider: provider.clone(),
                        function: function.clone(),
                    },
                );
            }

            for module in provider_modules(&provider) {
                let functions: Vec<String> = module
                    .functions
                    .iter()
                    .map(|name| composite_name(&provider.id, name))
                    .filter(|full_name| snapshot.functions.contains_key(full_name))
                    .collect();
                if functions.is_empty() {
                    continue;
                }
                snapshot.modules.push(LiveModule {
                    entry: ModuleCatalogEntry {
                        module_ref: format!("{}:{}", provider.id, module.id),
                        name: module.name.clone(),
                        service: provider.display_name.clone(),
                        description: module.description.clone(),
                        category: provider.category.clone(),
                    },
                    functions,
                });
            }
        }

        info!(
            target: "registry",
            entries = snapshot.entries.len(),
            modules = snapshot.modules.len(),
            "capability registry rebuilt"
        );
        *self.snapshot.write().expect("registry snapshot poisoned") = Arc::new(snapshot);
    }

    pub fn entries(&self) -> Vec<CapabilityRegistryEntry> {
        self.current().entries.clone()
    }

    pub fn len(&self) -> usize {
        self.current().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.current().entries.is_empty()
    }

    /// Keyword search over the live entries, best matches first.
    pub fn search(
        &self,
        query: &str,
        category: Option<&str>,
        limit: usize,
    ) -> Vec<CapabilityRegistryEntry> {
        let tokens = tokenize(query);
        if tokens.is_empty() {
            return Vec::new();
        }

        let snapshot = self.current();
        let mut scored: Vec<(f64, &CapabilityRegistryEntry)> = snapshot
            .entries
            .iter()
            .filter(|entry| {
                category
                    .map(|category| entry.category.eq_ignore_ascii_case(category))
                    .unwrap_or(true)
            })
            .map(|entry| (score_entry(entry, &tokens), entry))
            .filter(|(score, _)| *score > 0.0)
            .collect();

        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(Ordering::Equal));
        scored
            .into_iter()
            .take(limit)
            .map(|(_, entry)| entry.clone())
            .collect()
    }

    /// Resolves a composite name to its handler and fresh credentials.
    /// Returns `None` once the owning provider is no longer available, even
    /// if the snapshot still lists it.
    pub fn lookup(&self, full_name: &str) -> Option<ResolvedFunction> {
        let snapshot = self.current();
        let live = snapshot.functions.get(full_name)?;
        if !self.is_available(&live.provider) {
            debug!(
                target: "registry",
                function = %full_name,
                "lookup refused: provider no longer available"
            );
            return None;
        }
        Some(ResolvedFunction {
            full_name: full_name.to_string(),
            provider_id: live.provider.id.clone(),
            description: live.function.description.clone(),
            params: live.function.params.clone(),
            auto_allow: live.function.auto_allow,
            credentials: self.config.credentials(&live.provider.id),
            handler: live.function.handler.clone(),
        })
    }

    pub fn module_catalog(&self) -> Vec<ModuleCatalogEntry> {
        self.current()
            .modules
            .iter()
            .map(|module| module.entry.clone())
            .collect()
    }

    /// Composite names reachable through `module_ref`. A bare provider id
    /// addresses the provider's implicit module.
    pub fn module_functions(&self, module_ref: &str) -> Vec<String> {
        let module_ref = normalize_module_ref(module_ref);
        let snapshot = self.current();
        snapshot
            .modules
            .iter()
            .find(|module| module.entry.module_ref == module_ref)
            .map(|module| {
                module
                    .functions
                    .iter()
                    .filter(|name| snapshot.functions.contains_key(name.as_str()))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Module catalog rendered for a planning prompt.
    pub fn catalog_text(&self) -> String {
        self.module_catalog()
            .iter()
            .map(|module| {
                format!(
                    "- {} [{}] {} / {}: {}",
                    module.module_ref,
                    module.category,
                    module.service,
                    module.name,
                    module.description
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

pub fn composite_name(provider_id: &str, function_name: &str) -> String {
    format!("{provider_id}{COMPOSITE_SEPARATOR}{function_name}")
}

fn normalize_module_ref(module_ref: &str) -> String {
    let trimmed = module_ref.trim();
    if trimmed.contains(':') {
        trimmed.to_string()
    } else {
        format!("{trimmed}:{trimmed}")
    }
}

fn provider_modules(provider: &ProviderManifest) -> Vec<ModuleDef> {
    if !provider.modules.is_empty() {
        return provider.modules.clone();
    }
    vec![ModuleDef {
        id: provider.id.clone(),
        name: provider.display_name.clone(),
        description: provider.description.clone(),
        functions: provider
            .functions
            .iter()
            .map(|function| function.name.clone())
            .collect(),
    }]
}

fn build_entry(
    provider: &ProviderManifest,
    function: &FunctionDef,
    full_name: &str,
) -> CapabilityRegistryEntry {
    let mut seen = HashSet::new();
    let keywords = [
        provider.id.as_str(),
        function.name.as_str(),
        function.description.as_str(),
        provider.display_name.as_str(),
        provider.category.as_str(),
    ]
    .iter()
    .flat_map(|text| tokenize(text))
    .filter(|token| seen.insert(token.clone()))
    .collect();

    CapabilityRegistryEntry {
        full_name: full_name.to_string(),
        provider_id: provider.id.clone(),
        function_name: function.name.clone(),
        description: function.description.clone(),
        param_summary: param_summary(&function.params),
        category: provider.category.clone(),
        keywords,
    }
}

/// Lowercase tokens split on whitespace and punctuation; single characters
/// are dropped.
fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|token| token.chars().count() > 1)
        .map(str::to_string)
        .collect()
}

fn score_entry(entry: &CapabilityRegistryEntry, tokens: &[String]) -> f64 {
    let full_name = entry.full_name.to_lowercase();
    let mut score = 0.0;
    for token in tokens {
        for keyword in &entry.keywords {
            if keyword == token {
                score += 1.0;
            } else if keyword.contains(token.as_str()) || token.contains(keyword.as_str()) {
                score += 0.5;
            }
        }
        if full_name.contains(token.as_str()) {
            score += 0.5;
        }
    }
    score
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{InMemoryConfigStore, ProviderSettings};
    use ai_agent::ParamKind;
    use serde_json::json;

    struct Noop;

    #[async_trait]
    impl CapabilityHandler for Noop {
        async fn call(&self, _args: Value, _credentials: Credentials) -> anyhow::Result<Value> {
            Ok(json!({ "ok": true }))
        }
    }

    fn function(name: &str, description: &str) -> FunctionDef {
        FunctionDef::new(name, description, Arc::new(Noop))
    }

    fn mail_provider() -> ProviderManifest {
        ProviderManifest::new("gmail", "Gmail", "email")
            .describe("Read and send e-mail")
            .requires_credential("token")
            .function(
                function("send_email", "Send an e-mail message").with_params(vec![
                    ParamSpec::new("to", ParamKind::String)
                        .required()
                        .describe("Recipient"),
                ]),
            )
            .function(function("list_inbox", "List recent inbox messages").auto_allow())
            .module(ModuleDef::new(
                "inbox",
                "Inbox",
                "Reading mail",
                &["list_inbox", "archive_thread"],
            ))
            .module(ModuleDef::new("compose", "Compose", "Writing mail", &["send_email"]))
    }

    fn setup() -> (Arc<ProviderCatalog>, Arc<InMemoryConfigStore>, CapabilityRegistry) {
        let catalog = Arc::new(ProviderCatalog::new());
        catalog.load(mail_provider());
        catalog.load(
            ProviderManifest::new("todo", "Todo", "tasks")
                .describe("Task tracker")
                .function(function("add_task", "Add a task to the list")),
        );
        let store = Arc::new(InMemoryConfigStore::new());
        store.upsert(
            "gmail",
            ProviderSettings {
                enabled: true,
                credentials: [("token".to_string(), "t".to_string())].into(),
                oauth_completed: false,
            },
        );
        store.set_enabled("todo", true);
        let registry = CapabilityRegistry::new(catalog.clone(), store.clone());
        registry.rebuild();
        (catalog, store, registry)
    }

    #[test]
    fn rebuild_indexes_enabled_providers() {
        let (_, _, registry) = setup();
        let names: Vec<String> = registry.entries().into_iter().map(|e| e.full_name).collect();
        assert_eq!(names, vec!["gmail__send_email", "gmail__list_inbox", "todo__add_task"]);

        let entry = &registry.entries()[0];
        assert_eq!(entry.param_summary, "to (required): Recipient");
        assert!(entry.keywords.contains(&"send".to_string()));
        assert!(entry.keywords.contains(&"gmail".to_string()));
        let unique: HashSet<_> = entry.keywords.iter().collect();
        assert_eq!(unique.len(), entry.keywords.len());
    }

    #[test]
    fn missing_credentials_or_oauth_excludes_provider() {
        let (catalog, store, registry) = setup();
        store.remove_credential("gmail", "token");
        registry.rebuild();
        assert!(registry.lookup("gmail__send_email").is_none());
        assert_eq!(registry.module_catalog().len(), 1);

        catalog.load(
            ProviderManifest::new("calendar", "Calendar", "calendar")
                .requires_oauth()
                .function(function("list_events", "List events")),
        );
        store.set_enabled("calendar", true);
        registry.rebuild();
        assert!(registry.lookup("calendar__list_events").is_none());
        store.set_oauth_completed("calendar", true);
        registry.rebuild();
        assert!(registry.lookup("calendar__list_events").is_some());
    }

    #[test]
    fn disabling_and_reenabling_round_trips() {
        let (_, store, registry) = setup();
        store.set_enabled("gmail", false);
        registry.rebuild();
        assert!(registry.search("email", None, 10).is_empty());
        assert!(registry.lookup("gmail__list_inbox").is_none());
        assert!(registry
            .module_catalog()
            .iter()
            .all(|module| !module.module_ref.starts_with("gmail:")));

        store.set_enabled("gmail", true);
        registry.rebuild();
        assert_eq!(registry.search("email", None, 10).len(), 2);
        assert!(registry.lookup("gmail__list_inbox").is_some());
        assert_eq!(registry.module_catalog().len(), 3);
    }

    #[test]
    fn lookup_revalidates_without_rebuild() {
        let (_, store, registry) = setup();
        let resolved = registry.lookup("gmail__list_inbox").unwrap();
        assert!(resolved.auto_allow);
        assert_eq!(resolved.credentials.get("token").unwrap(), "t");

        store.set_enabled("gmail", false);
        assert!(registry.lookup("gmail__list_inbox").is_none());
    }

    #[test]
    fn exact_keyword_outranks_substring_overlap() {
        let catalog = Arc::new(ProviderCatalog::new());
        catalog.load(ProviderManifest::new("alpha", "Alpha", "misc").function(function("fetch", "mailbox")));
        catalog.load(ProviderManifest::new("beta", "Beta", "misc").function(function("fetch", "mail")));
        let store = Arc::new(InMemoryConfigStore::new());
        store.set_enabled("alpha", true);
        store.set_enabled("beta", true);
        let registry = CapabilityRegistry::new(catalog, store);
        registry.rebuild();

        let results = registry.search("mail", None, 10);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].full_name, "beta__fetch");
        assert_eq!(results[1].full_name, "alpha__fetch");
    }

    #[test]
    fn search_filters_category_and_limit() {
        let (_, _, registry) = setup();
        assert!(registry.search("a", None, 10).is_empty());
        let tasks = registry.search("add task email", Some("tasks"), 10);
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].full_name, "todo__add_task");
        assert_eq!(registry.search("email", None, 1).len(), 1);
    }

    #[test]
    fn module_catalog_only_lists_live_functions() {
        let (_, _, registry) = setup();
        let refs: Vec<String> = registry
            .module_catalog()
            .into_iter()
            .map(|module| module.module_ref)
            .collect();
        assert_eq!(refs, vec!["gmail:inbox", "gmail:compose", "todo:todo"]);

        assert_eq!(registry.module_functions("gmail:inbox"), vec!["gmail__list_inbox"]);
        assert_eq!(registry.module_functions("todo"), vec!["todo__add_task"]);
        assert!(registry.module_functions("gmail:missing").is_empty());
        assert!(registry.catalog_text().contains("- gmail:compose [email] Gmail / Compose"));
    }
}
