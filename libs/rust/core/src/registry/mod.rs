//! Component registry: per-category name -> factory maps plus the tagged
//! configuration union each category validates its `{name, config}` sections
//! against.
//!
//! Modules (built-in or plugin) hand over a [`PluginModule`] listing their
//! components and config schemas. [`RegistryLoader`] keeps only pairs where
//! both halves belong to the loader's category and share a name; everything
//! else is logged and dropped.

pub mod builtins;
pub mod plugin_manager;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::marker::PhantomData;
use std::panic;
use std::sync::Arc;

use opentelemetry::KeyValue;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info, warn};

use crate::client::ClientFactory;
use crate::error::{ConfigError, Error, Result};
use crate::metrics_ext::FEDERATION_METRICS;
use crate::metrics_logger::MetricsLoggerFactory;
use crate::ml::{DataModuleFactory, ModelFactory};
use crate::strategy::aggregator::FitResultsAggregatorFactory;
use crate::strategy::decorator::StrategyDecoratorFactory;
use crate::strategy::StrategyFactory;
use crate::telemetry::LoggerFactory;

pub use plugin_manager::{discover, load_plugins, ImportFailure, LoadedPlugins, PluginCatalog, PluginDeclarations, PluginManager};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Data,
    Model,
    Strategy,
    StrategyDecorator,
    Logger,
    MetricsLogger,
    Client,
    FitResultsAggregator,
}

impl Category {
    pub const ALL: [Category; 8] = [
        Category::Data,
        Category::Model,
        Category::Strategy,
        Category::StrategyDecorator,
        Category::Logger,
        Category::MetricsLogger,
        Category::Client,
        Category::FitResultsAggregator,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Data => "data",
            Category::Model => "model",
            Category::Strategy => "strategy",
            Category::StrategyDecorator => "strategydecorator",
            Category::Logger => "logger",
            Category::MetricsLogger => "metricslogger",
            Category::Client => "client",
            Category::FitResultsAggregator => "fitresultsaggregator",
        }
    }

    /// Accepts the key spellings used in plugin declaration files.
    pub fn parse(key: &str) -> Option<Self> {
        match key.to_ascii_lowercase().as_str() {
            "flowerfitresultsaggregator" => Some(Category::FitResultsAggregator),
            other => Category::ALL.into_iter().find(|c| c.as_str() == other),
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    Core,
    Plugin,
}

impl Origin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Origin::Core => "core",
            Origin::Plugin => "plugin",
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// A factory exported by a module, tagged with the interface it implements.
#[derive(Clone)]
pub enum Component {
    Data(Arc<dyn DataModuleFactory>),
    Model(Arc<dyn ModelFactory>),
    Strategy(Arc<dyn StrategyFactory>),
    StrategyDecorator(Arc<dyn StrategyDecoratorFactory>),
    Logger(Arc<dyn LoggerFactory>),
    MetricsLogger(Arc<dyn MetricsLoggerFactory>),
    Client(Arc<dyn ClientFactory>),
    FitResultsAggregator(Arc<dyn FitResultsAggregatorFactory>),
}

impl Component {
    pub fn category(&self) -> Category {
        match self {
            Component::Data(_) => Category::Data,
            Component::Model(_) => Category::Model,
            Component::Strategy(_) => Category::Strategy,
            Component::StrategyDecorator(_) => Category::StrategyDecorator,
            Component::Logger(_) => Category::Logger,
            Component::MetricsLogger(_) => Category::MetricsLogger,
            Component::Client(_) => Category::Client,
            Component::FitResultsAggregator(_) => Category::FitResultsAggregator,
        }
    }
}

impl fmt::Debug for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "Component({})", self.category()) }
}

/// Implemented by each category's factory trait object so a loader can pull
/// its own variant out of a [`Component`].
pub trait Registrable: Send + Sync + 'static {
    const CATEGORY: Category;
    fn from_component(component: Component) -> std::result::Result<Arc<Self>, Component>;
}

macro_rules! registrable {
    ($($variant:ident => $factory:ident),* $(,)?) => {$(
        impl Registrable for dyn $factory {
            const CATEGORY: Category = Category::$variant;
            fn from_component(component: Component) -> std::result::Result<Arc<Self>, Component> {
                match component {
                    Component::$variant(f) => Ok(f),
                    other => Err(other),
                }
            }
        }
    )*};
}

registrable! {
    Data => DataModuleFactory,
    Model => ModelFactory,
    Strategy => StrategyFactory,
    StrategyDecorator => StrategyDecoratorFactory,
    Logger => LoggerFactory,
    MetricsLogger => MetricsLoggerFactory,
    Client => ClientFactory,
    FitResultsAggregator => FitResultsAggregatorFactory,
}

/// Validator for one tagged variant's `config` sub-tree.
pub trait ConfigSchema: Send + Sync {
    /// Tag value selecting this variant.
    fn name(&self) -> &str;
    /// Human-readable label shown in listings.
    fn alias(&self) -> &str;
    fn category(&self) -> Category;
    /// Returns the normalized config (defaults filled in) or a message.
    fn validate(&self, config: Value) -> std::result::Result<Value, String>;
    fn default_config(&self) -> Value;
}

type Check<C> = fn(&C) -> std::result::Result<(), String>;

/// Schema backed by a serde type; range checks go in `with_check`.
pub struct ConfigVariant<C> {
    name: String,
    alias: String,
    category: Category,
    check: Option<Check<C>>,
    _config: PhantomData<fn() -> C>,
}

impl<C> ConfigVariant<C> {
    pub fn new(category: Category, name: impl Into<String>, alias: impl Into<String>) -> Self {
        Self { name: name.into(), alias: alias.into(), category, check: None, _config: PhantomData }
    }

    pub fn with_check(mut self, check: Check<C>) -> Self {
        self.check = Some(check);
        self
    }
}

impl<C> ConfigSchema for ConfigVariant<C>
where
    C: DeserializeOwned + Serialize + Default + 'static,
{
    fn name(&self) -> &str { &self.name }
    fn alias(&self) -> &str { &self.alias }
    fn category(&self) -> Category { self.category }

    fn validate(&self, config: Value) -> std::result::Result<Value, String> {
        let typed: C = serde_json::from_value(config).map_err(|e| e.to_string())?;
        if let Some(check) = self.check { check(&typed)?; }
        serde_json::to_value(&typed).map_err(|e| e.to_string())
    }

    fn default_config(&self) -> Value { serde_json::to_value(C::default()).unwrap_or(Value::Null) }
}

/// Deserializes an already-validated config sub-tree inside a factory.
pub fn typed_config<C: DeserializeOwned>(name: &str, config: &Value) -> Result<C> {
    let value = if config.is_null() { Value::Object(Default::default()) } else { config.clone() };
    serde_json::from_value(value).map_err(|e| ConfigError::new("config", e.to_string()).with_candidate(name).into())
}

/// A validated tagged section.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaggedConfig {
    pub name: String,
    pub config: Value,
}

#[derive(Clone)]
pub struct UnionMember {
    pub schema: Arc<dyn ConfigSchema>,
    pub origin: Origin,
}

/// The set of config variants accepted for one category, discriminated by `name`.
#[derive(Clone)]
pub struct ConfigUnion {
    category: Category,
    members: BTreeMap<String, UnionMember>,
}

impl ConfigUnion {
    pub fn category(&self) -> Category { self.category }
    pub fn len(&self) -> usize { self.members.len() }
    pub fn is_empty(&self) -> bool { self.members.is_empty() }
    pub fn names(&self) -> impl Iterator<Item = &str> { self.members.keys().map(String::as_str) }
    pub fn get(&self, name: &str) -> Option<&UnionMember> { self.members.get(name) }

    fn expected(&self) -> String { self.names().map(|n| format!("`{n}`")).collect::<Vec<_>>().join(", ") }

    /// Validates a `{name, config}` mapping found at `path`. An absent or null
    /// `config` is read as an empty mapping.
    pub fn validate(&self, path: &str, value: &Value) -> std::result::Result<TaggedConfig, ConfigError> {
        let Some(section) = value.as_object() else {
            return Err(ConfigError::new(path, format!("expected a mapping with a `name` tag, found {}", value_kind(value))));
        };
        let name = match section.get("name") {
            Some(Value::String(name)) => name.clone(),
            Some(other) => return Err(ConfigError::new(format!("{path}.name"), format!("tag must be a string, found {}", value_kind(other)))),
            None => return Err(ConfigError::new(path, format!("missing `name` tag, expected one of {}", self.expected()))),
        };
        if let Some(extra) = section.keys().find(|k| *k != "name" && *k != "config") {
            return Err(ConfigError::new(format!("{path}.{extra}"), "unknown field").with_candidate(name));
        }
        let Some(member) = self.members.get(&name) else {
            return Err(ConfigError::new(format!("{path}.name"), format!("unknown {} variant `{name}`, expected one of {}", self.category, self.expected())));
        };
        let raw = match section.get("config") {
            None | Some(Value::Null) => Value::Object(Default::default()),
            Some(v) => v.clone(),
        };
        let config = member.schema.validate(raw).map_err(|m| ConfigError::new(format!("{path}.config"), m).with_candidate(&name))?;
        Ok(TaggedConfig { name, config })
    }
}

pub(crate) fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a sequence",
        Value::Object(_) => "a mapping",
    }
}

/// What a module entrypoint hands back: components and their schemas.
#[derive(Default)]
pub struct PluginModule {
    pub components: Vec<(String, Component)>,
    pub configs: Vec<Arc<dyn ConfigSchema>>,
}

impl PluginModule {
    pub fn new() -> Self { Self::default() }

    /// Adds a matched implementation/schema pair.
    pub fn register(self, name: impl Into<String>, component: Component, schema: impl ConfigSchema + 'static) -> Self {
        self.component(name, component).config(schema)
    }

    pub fn component(mut self, name: impl Into<String>, component: Component) -> Self {
        self.components.push((name.into(), component));
        self
    }

    pub fn config(mut self, schema: impl ConfigSchema + 'static) -> Self {
        self.configs.push(Arc::new(schema));
        self
    }
}

pub type ModuleEntrypoint = fn() -> anyhow::Result<PluginModule>;

#[derive(Debug, Clone)]
pub struct ModuleSource {
    pub name: String,
    pub origin: Origin,
    pub entrypoint: ModuleEntrypoint,
}

impl ModuleSource {
    pub fn core(name: impl Into<String>, entrypoint: ModuleEntrypoint) -> Self { Self { name: name.into(), origin: Origin::Core, entrypoint } }
    pub fn plugin(name: impl Into<String>, entrypoint: ModuleEntrypoint) -> Self { Self { name: name.into(), origin: Origin::Plugin, entrypoint } }
}

pub struct RegistryEntry<T: ?Sized> {
    pub name: String,
    pub implementation: Arc<T>,
    pub schema: Arc<dyn ConfigSchema>,
    pub origin: Origin,
    pub module: String,
}

impl<T: ?Sized> Clone for RegistryEntry<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            implementation: self.implementation.clone(),
            schema: self.schema.clone(),
            origin: self.origin,
            module: self.module.clone(),
        }
    }
}

/// Name -> factory map for one category, plus its config union.
pub struct CategoryRegistry<T: ?Sized> {
    category: Category,
    entries: BTreeMap<String, RegistryEntry<T>>,
    union: Option<ConfigUnion>,
}

impl<T: ?Sized> CategoryRegistry<T> {
    pub fn category(&self) -> Category { self.category }
    pub fn len(&self) -> usize { self.entries.len() }
    pub fn is_empty(&self) -> bool { self.entries.is_empty() }
    pub fn names(&self) -> impl Iterator<Item = &str> { self.entries.keys().map(String::as_str) }
    pub fn entries(&self) -> impl Iterator<Item = &RegistryEntry<T>> { self.entries.values() }
    pub fn entry(&self, name: &str) -> Option<&RegistryEntry<T>> { self.entries.get(name) }
    pub fn get(&self, name: &str) -> Option<&Arc<T>> { self.entries.get(name).map(|e| &e.implementation) }
    pub fn union(&self) -> Option<&ConfigUnion> { self.union.as_ref() }

    pub fn resolve(&self, name: &str) -> Result<Arc<T>> {
        self.get(name).cloned().ok_or_else(|| Error::UnknownComponent { category: self.category, name: name.to_string() })
    }
}

/// Builds one category's registry from an ordered list of modules.
pub struct RegistryLoader<T: ?Sized> {
    _category: PhantomData<fn() -> Arc<T>>,
}

impl<T: Registrable + ?Sized> Default for RegistryLoader<T> {
    fn default() -> Self { Self::new() }
}

impl<T: Registrable + ?Sized> RegistryLoader<T> {
    pub fn new() -> Self { Self { _category: PhantomData } }

    pub fn category(&self) -> Category { T::CATEGORY }

    /// Runs each module entrypoint and merges its accepted pairs. Later
    /// modules override earlier ones on name collisions. The union is `None`
    /// when no config variant survives.
    pub fn register_modules(&self, modules: &[ModuleSource]) -> (BTreeMap<String, RegistryEntry<T>>, Option<ConfigUnion>) {
        let category = T::CATEGORY;
        let mut registry: BTreeMap<String, RegistryEntry<T>> = BTreeMap::new();
        let mut members: BTreeMap<String, UnionMember> = BTreeMap::new();
        let attrs = [KeyValue::new("category", category.as_str())];

        for source in modules {
            let module = match panic::catch_unwind(source.entrypoint) {
                Ok(Ok(module)) => module,
                Ok(Err(e)) => {
                    warn!(%category, module = %source.name, error = %e, "module failed to load, skipped");
                    continue;
                }
                Err(_) => {
                    error!(%category, module = %source.name, "module entrypoint panicked, skipped");
                    continue;
                }
            };

            let mut accepted: BTreeMap<String, Arc<T>> = BTreeMap::new();
            let mut rejected: BTreeSet<String> = BTreeSet::new();
            for (name, component) in module.components {
                let found = component.category();
                match T::from_component(component) {
                    Ok(implementation) => {
                        if accepted.insert(name.clone(), implementation).is_some() {
                            warn!(%category, module = %source.name, %name, "component declared twice in module, keeping the last");
                        }
                    }
                    Err(_) => {
                        warn!(%category, module = %source.name, %name, %found, "component does not implement the {category} interface, skipped");
                        FEDERATION_METRICS.registry_skipped.add(1, &attrs);
                        rejected.insert(name);
                    }
                }
            }

            let mut schemas: BTreeMap<String, Arc<dyn ConfigSchema>> = BTreeMap::new();
            for schema in &module.configs {
                let name = schema.name().to_string();
                if schema.category() != category {
                    warn!(%category, module = %source.name, %name, declared = %schema.category(), "config variant is not a {category} config, skipped");
                    FEDERATION_METRICS.registry_skipped.add(1, &attrs);
                    if accepted.remove(&name).is_some() {
                        warn!(%category, module = %source.name, %name, "component dropped with its config variant");
                    }
                    continue;
                }
                if rejected.contains(&name) {
                    warn!(%category, module = %source.name, %name, "config variant dropped with its rejected component");
                    continue;
                }
                schemas.insert(name, schema.clone());
            }

            for (name, implementation) in accepted {
                let Some(schema) = schemas.remove(&name) else {
                    warn!(%category, module = %source.name, %name, "component has no config variant, skipped");
                    FEDERATION_METRICS.registry_skipped.add(1, &attrs);
                    continue;
                };
                if let Some(previous) = registry.get(&name) {
                    warn!(%category, %name, previous = %previous.module, module = %source.name, "component overridden");
                }
                members.insert(name.clone(), UnionMember { schema: schema.clone(), origin: source.origin });
                registry.insert(name.clone(), RegistryEntry { name, implementation, schema, origin: source.origin, module: source.name.clone() });
                FEDERATION_METRICS.registry_entries.add(1, &attrs);
            }
            for name in schemas.keys() {
                warn!(%category, module = %source.name, %name, "config variant has no component, skipped");
            }
        }

        info!(%category, components = registry.len(), "registry built");
        let union = (!members.is_empty()).then(|| ConfigUnion { category, members });
        (registry, union)
    }

    pub fn load(&self, modules: &[ModuleSource]) -> CategoryRegistry<T> {
        let (entries, union) = self.register_modules(modules);
        CategoryRegistry { category: T::CATEGORY, entries, union }
    }
}

/// Every category's registry, built once per process and passed around.
pub struct PluginRegistry {
    pub data: CategoryRegistry<dyn DataModuleFactory>,
    pub model: CategoryRegistry<dyn ModelFactory>,
    pub strategy: CategoryRegistry<dyn StrategyFactory>,
    pub strategy_decorator: CategoryRegistry<dyn StrategyDecoratorFactory>,
    pub logger: CategoryRegistry<dyn LoggerFactory>,
    pub metrics_logger: CategoryRegistry<dyn MetricsLoggerFactory>,
    pub client: CategoryRegistry<dyn ClientFactory>,
    pub fit_results_aggregator: CategoryRegistry<dyn FitResultsAggregatorFactory>,
}

/// One line of a registry listing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ListedComponent {
    pub category: Category,
    pub name: String,
    pub alias: String,
    pub origin: Origin,
    pub module: String,
}

impl PluginRegistry {
    /// Built-in components only.
    pub fn builtin() -> Self { Self::build(&LoadedPlugins::default()) }

    /// Built-in modules first, then plugins, so plugins can override.
    pub fn build(plugins: &LoadedPlugins) -> Self {
        let sources = Category::ALL
            .into_iter()
            .map(|c| {
                let mut modules = builtins::modules(c);
                modules.extend(plugins.modules(c).iter().cloned());
                (c, modules)
            })
            .collect();
        Self::from_sources(&sources)
    }

    pub fn from_sources(sources: &BTreeMap<Category, Vec<ModuleSource>>) -> Self {
        let of = |c: Category| sources.get(&c).map(Vec::as_slice).unwrap_or(&[]);
        Self {
            data: RegistryLoader::new().load(of(Category::Data)),
            model: RegistryLoader::new().load(of(Category::Model)),
            strategy: RegistryLoader::new().load(of(Category::Strategy)),
            strategy_decorator: RegistryLoader::new().load(of(Category::StrategyDecorator)),
            logger: RegistryLoader::new().load(of(Category::Logger)),
            metrics_logger: RegistryLoader::new().load(of(Category::MetricsLogger)),
            client: RegistryLoader::new().load(of(Category::Client)),
            fit_results_aggregator: RegistryLoader::new().load(of(Category::FitResultsAggregator)),
        }
    }

    pub fn union(&self, category: Category) -> Option<&ConfigUnion> {
        match category {
            Category::Data => self.data.union(),
            Category::Model => self.model.union(),
            Category::Strategy => self.strategy.union(),
            Category::StrategyDecorator => self.strategy_decorator.union(),
            Category::Logger => self.logger.union(),
            Category::MetricsLogger => self.metrics_logger.union(),
            Category::Client => self.client.union(),
            Category::FitResultsAggregator => self.fit_results_aggregator.union(),
        }
    }

    pub fn listing(&self) -> Vec<ListedComponent> {
        fn list<T: ?Sized>(r: &CategoryRegistry<T>, out: &mut Vec<ListedComponent>) {
            out.extend(r.entries().map(|e| ListedComponent {
                category: r.category(),
                name: e.name.clone(),
                alias: e.schema.alias().to_string(),
                origin: e.origin,
                module: e.module.clone(),
            }));
        }
        let mut out = Vec::new();
        list(&self.data, &mut out);
        list(&self.model, &mut out);
        list(&self.strategy, &mut out);
        list(&self.strategy_decorator, &mut out);
        list(&self.logger, &mut out);
        list(&self.metrics_logger, &mut out);
        list(&self.client, &mut out);
        list(&self.fit_results_aggregator, &mut out);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::aggregator::{AggregatorConfig, WeightedAverageFactory};

    fn weighted() -> Component { Component::FitResultsAggregator(Arc::new(WeightedAverageFactory)) }

    fn good() -> anyhow::Result<PluginModule> {
        Ok(PluginModule::new().register("w", weighted(), ConfigVariant::<AggregatorConfig>::new(Category::FitResultsAggregator, "w", "W")))
    }

    fn failing() -> anyhow::Result<PluginModule> { anyhow::bail!("import error") }

    fn panicking() -> anyhow::Result<PluginModule> { panic!("boom") }

    fn unpaired() -> anyhow::Result<PluginModule> {
        Ok(PluginModule::new()
            .component("lonely", weighted())
            .config(ConfigVariant::<AggregatorConfig>::new(Category::FitResultsAggregator, "orphan", "Orphan")))
    }

    #[test]
    fn category_keys_parse() {
        assert_eq!(Category::parse("StrategyDecorator"), Some(Category::StrategyDecorator));
        assert_eq!(Category::parse("flowerfitresultsaggregator"), Some(Category::FitResultsAggregator));
        assert_eq!(Category::parse("bogus"), None);
        assert_eq!(Category::MetricsLogger.to_string(), "metricslogger");
    }

    #[test]
    fn broken_modules_are_skipped() {
        let loader = RegistryLoader::<dyn FitResultsAggregatorFactory>::new();
        let (registry, union) = loader.register_modules(&[
            ModuleSource::core("bad", failing),
            ModuleSource::core("panics", panicking),
            ModuleSource::plugin("good", good),
        ]);
        assert_eq!(registry.keys().collect::<Vec<_>>(), vec!["w"]);
        assert_eq!(registry["w"].origin, Origin::Plugin);
        assert_eq!(union.unwrap().get("w").unwrap().origin, Origin::Plugin);
    }

    #[test]
    fn unpaired_halves_are_dropped() {
        let loader = RegistryLoader::<dyn FitResultsAggregatorFactory>::new();
        let (registry, union) = loader.register_modules(&[ModuleSource::core("m", unpaired)]);
        assert!(registry.is_empty());
        assert!(union.is_none());
    }

    #[test]
    fn union_reports_paths() {
        let registry = RegistryLoader::<dyn FitResultsAggregatorFactory>::new().load(&[ModuleSource::core("good", good)]);
        let union = registry.union().unwrap();
        let ok = union.validate("agg", &serde_json::json!({"name": "w"})).unwrap();
        assert_eq!(ok.name, "w");
        let err = union.validate("agg", &serde_json::json!({"name": "nope"})).unwrap_err();
        assert_eq!(err.path, "agg.name");
        let err = union.validate("agg", &serde_json::json!({"config": {}})).unwrap_err();
        assert_eq!(err.path, "agg");
        let err = union.validate("agg", &serde_json::json!({"name": "w", "config": {"x": 1}})).unwrap_err();
        assert_eq!(err.path, "agg.config");
        assert_eq!(err.candidate.as_deref(), Some("w"));
        let err = union.validate("agg", &serde_json::json!({"name": "w", "extra": 1})).unwrap_err();
        assert_eq!(err.path, "agg.extra");
    }

    #[test]
    fn resolve_unknown_name() {
        let registry = PluginRegistry::builtin();
        assert!(matches!(registry.strategy.resolve("nope"), Err(Error::UnknownComponent { category: Category::Strategy, .. })));
        assert!(registry.strategy.resolve("fedavg").is_ok());
    }
}
