//! External plugin discovery.
//!
//! A YAML declaration file lists, per category, directories and the module
//! names to take from them:
//!
//! ```yaml
//! strategydecorator:
//!   - path: ./plugins
//!     modules: [basicstrategydecorator]
//! ```
//!
//! Module names resolve through a [`PluginCatalog`] that plugin crates fill
//! in at startup. Nothing here fails: every problem is logged and recorded.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::{info, warn};

use super::{Category, ModuleEntrypoint, ModuleSource};

pub const PLUGIN_CONF_ENV: &str = "PYBISCUS_PLUGIN_CONF_PATH";
pub const DEFAULT_PLUGIN_CONF: &str = "pybiscus-plugins-conf.yml";

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct PluginPathEntry {
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub modules: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PluginDeclarations {
    pub categories: BTreeMap<Category, Vec<PluginPathEntry>>,
}

impl PluginDeclarations {
    /// Unknown category keys are logged and ignored.
    pub fn from_yaml_str(text: &str) -> Result<Self, serde_yaml::Error> {
        let raw: Option<BTreeMap<String, Option<Vec<PluginPathEntry>>>> = serde_yaml::from_str(text)?;
        let mut categories: BTreeMap<Category, Vec<PluginPathEntry>> = BTreeMap::new();
        for (key, entries) in raw.unwrap_or_default() {
            match Category::parse(&key) {
                Some(category) => categories.entry(category).or_default().extend(entries.unwrap_or_default()),
                None => warn!(%key, "unknown plugin category, ignored"),
            }
        }
        Ok(Self { categories })
    }

    pub fn is_empty(&self) -> bool { self.categories.values().all(Vec::is_empty) }
}

/// Declaration file location: `$PYBISCUS_PLUGIN_CONF_PATH` or `pybiscus-plugins-conf.yml`.
pub fn declarations_path() -> PathBuf {
    std::env::var_os(PLUGIN_CONF_ENV).map(PathBuf::from).unwrap_or_else(|| PathBuf::from(DEFAULT_PLUGIN_CONF))
}

/// A missing or malformed file yields empty declarations.
pub fn read_declarations(path: &Path) -> PluginDeclarations {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) => {
            info!(path = %path.display(), error = %e, "no plugin declarations, running with built-in components only");
            return PluginDeclarations::default();
        }
    };
    match PluginDeclarations::from_yaml_str(&text) {
        Ok(decls) => decls,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "malformed plugin declarations, running with built-in components only");
            PluginDeclarations::default()
        }
    }
}

/// Module name -> entrypoint, as published by plugin crates.
#[derive(Debug, Clone, Default)]
pub struct PluginCatalog {
    modules: BTreeMap<String, ModuleEntrypoint>,
}

impl PluginCatalog {
    pub fn new() -> Self { Self::default() }

    pub fn provide(&mut self, module: impl Into<String>, entrypoint: ModuleEntrypoint) -> &mut Self {
        let module = module.into();
        if self.modules.insert(module.clone(), entrypoint).is_some() { warn!(%module, "plugin module provided twice, keeping the last"); }
        self
    }

    pub fn resolve(&self, module: &str) -> Option<ModuleEntrypoint> { self.modules.get(module).copied() }

    pub fn names(&self) -> impl Iterator<Item = &str> { self.modules.keys().map(String::as_str) }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportFailure {
    pub category: Category,
    pub module: String,
    pub path: Option<PathBuf>,
    pub reason: String,
}

/// Outcome of a plugin load: the imported modules per category, the failures,
/// and the directories added to the search path.
#[derive(Debug, Clone, Default)]
pub struct LoadedPlugins {
    modules: BTreeMap<Category, Vec<ModuleSource>>,
    failures: Vec<ImportFailure>,
    search_path: Vec<PathBuf>,
}

impl LoadedPlugins {
    pub fn modules(&self, category: Category) -> &[ModuleSource] { self.modules.get(&category).map(Vec::as_slice).unwrap_or(&[]) }

    /// `{category: [module names]}` for every category that imported something.
    pub fn by_category(&self) -> BTreeMap<Category, Vec<String>> {
        self.modules.iter().map(|(c, m)| (*c, m.iter().map(|s| s.name.clone()).collect())).collect()
    }

    pub fn failures(&self) -> &[ImportFailure] { &self.failures }
    pub fn search_path(&self) -> &[PathBuf] { &self.search_path }
    pub fn is_empty(&self) -> bool { self.modules.values().all(Vec::is_empty) }
}

pub struct PluginManager<'a> {
    catalog: &'a PluginCatalog,
    search_path: Vec<PathBuf>,
}

impl<'a> PluginManager<'a> {
    pub fn new(catalog: &'a PluginCatalog) -> Self { Self { catalog, search_path: Vec::new() } }

    pub fn search_path(&self) -> &[PathBuf] { &self.search_path }

    pub fn load_plugins(&mut self, declarations: &PluginDeclarations) -> LoadedPlugins {
        let mut loaded = LoadedPlugins::default();
        for (category, entries) in &declarations.categories {
            for entry in entries {
                let Some(modules) = &entry.modules else {
                    warn!(%category, path = ?entry.path, "no module defined for plugin path");
                    continue;
                };
                let dir = match &entry.path {
                    Some(p) if p.is_dir() => p.clone(),
                    other => {
                        warn!(%category, path = ?other, "invalid plugin path, skipping its modules");
                        loaded.failures.extend(modules.iter().map(|m| ImportFailure {
                            category: *category,
                            module: m.clone(),
                            path: other.clone(),
                            reason: "plugin path is missing or not a directory".into(),
                        }));
                        continue;
                    }
                };
                if !self.search_path.contains(&dir) { self.search_path.push(dir.clone()); }

                for module in modules {
                    match self.catalog.resolve(module) {
                        Some(entrypoint) => {
                            info!(%category, %module, path = %dir.display(), "plugin module imported");
                            loaded.modules.entry(*category).or_default().push(ModuleSource::plugin(module.clone(), entrypoint));
                        }
                        None => {
                            warn!(%category, %module, path = %dir.display(), "plugin module not found");
                            loaded.failures.push(ImportFailure {
                                category: *category,
                                module: module.clone(),
                                path: Some(dir.clone()),
                                reason: "module is not provided by any installed plugin package".into(),
                            });
                        }
                    }
                }
            }
        }
        loaded.search_path = self.search_path.clone();
        loaded
    }
}

pub fn load_plugins(catalog: &PluginCatalog, declarations: &PluginDeclarations) -> LoadedPlugins {
    PluginManager::new(catalog).load_plugins(declarations)
}

/// Reads the declaration file named by the environment and imports what it lists.
pub fn discover(catalog: &PluginCatalog) -> LoadedPlugins {
    let path = declarations_path();
    info!(path = %path.display(), "loading plugin declarations");
    load_plugins(catalog, &read_declarations(&path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::PluginModule;

    fn empty() -> anyhow::Result<PluginModule> { Ok(PluginModule::new()) }

    #[test]
    fn declarations_parse_and_skip_unknown_keys() {
        let decls = PluginDeclarations::from_yaml_str("model:\n  - path: /x\n    modules: [a, b]\nbogus:\n  - path: /y\nlogger:\n").unwrap();
        assert_eq!(decls.categories.len(), 2);
        assert_eq!(decls.categories[&Category::Model][0].modules.as_deref(), Some(&["a".to_string(), "b".to_string()][..]));
        assert!(decls.categories[&Category::Logger].is_empty());
        assert!(PluginDeclarations::from_yaml_str("").unwrap().is_empty());
    }

    #[test]
    fn missing_file_means_no_plugins() {
        assert!(read_declarations(Path::new("/definitely/not/here.yml")).is_empty());
    }

    #[test]
    fn entries_without_modules_are_skipped() {
        let mut catalog = PluginCatalog::new();
        catalog.provide("m", empty);
        let decls = PluginDeclarations { categories: BTreeMap::from([(Category::Model, vec![PluginPathEntry { path: Some(std::env::temp_dir()), modules: None }])]) };
        let loaded = load_plugins(&catalog, &decls);
        assert!(loaded.is_empty());
        assert!(loaded.failures().is_empty());
    }

    #[test]
    fn search_path_has_no_duplicates() {
        let mut catalog = PluginCatalog::new();
        catalog.provide("m", empty).provide("n", empty);
        let tmp = std::env::temp_dir();
        let entry = |m: &str| PluginPathEntry { path: Some(tmp.clone()), modules: Some(vec![m.to_string()]) };
        let decls = PluginDeclarations { categories: BTreeMap::from([(Category::Model, vec![entry("m"), entry("n")])]) };
        let mut manager = PluginManager::new(&catalog);
        let loaded = manager.load_plugins(&decls);
        assert_eq!(manager.search_path().len(), 1);
        assert_eq!(loaded.by_category()[&Category::Model], vec!["m", "n"]);
    }
}
