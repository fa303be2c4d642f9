//! Reconstructable categories and their registry.
//!
//! A category is a backup-log stream name (`UNIT`, `OBJECTGROUP_GRAPH`, ...).
//! Flat categories hold whole documents; graph categories hold snapshots of
//! the graph-owned fields of a flat category's documents.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{ReconError, Result};
use crate::sink::{LifecycleStore, PrimaryStore, SearchIndex};

/// Replay style of a category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CategoryKind {
    /// Whole documents, replaced on replay.
    Flat,
    /// Graph snapshots, merged field by field on replay.
    Graph,
}

fn default_strip_fields() -> Vec<String> {
    vec![crate::document::ATOMIC_VERSION.to_string()]
}

/// Configuration of one category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionConfig {
    /// Category name as used in requests and in the backup log.
    pub name: String,
    /// Flat or graph.
    pub kind: CategoryKind,
    /// Flat: sink collection name (defaults to `name`).
    /// Graph: name of the flat category whose documents it updates.
    #[serde(default)]
    pub target: Option<String>,
    /// Fields owned by the graph computation. On a graph category an empty
    /// list inherits the target's.
    #[serde(default)]
    pub graph_fields: Vec<String>,
    /// Sink-owned fields removed from restored documents.
    #[serde(default = "default_strip_fields")]
    pub strip_fields: Vec<String>,
    /// Flat only: backed-up objects carry a lifecycle that is replayed
    /// into the lifecycle store alongside the document.
    #[serde(default)]
    pub lifecycles: bool,
}

impl CollectionConfig {
    /// A flat category writing to `collection`.
    pub fn flat(name: &str, collection: &str, graph_fields: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            kind: CategoryKind::Flat,
            target: Some(collection.to_string()),
            graph_fields: graph_fields.iter().map(|f| f.to_string()).collect(),
            strip_fields: default_strip_fields(),
            lifecycles: false,
        }
    }

    /// Replay lifecycles together with documents.
    pub fn with_lifecycles(mut self) -> Self {
        self.lifecycles = true;
        self
    }

    /// A graph category updating the documents of flat category `target`.
    pub fn graph(name: &str, target: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: CategoryKind::Graph,
            target: Some(target.to_string()),
            graph_fields: Vec::new(),
            strip_fields: Vec::new(),
            lifecycles: false,
        }
    }
}

/// Everything reconstruction needs to know about one category.
#[derive(Clone)]
pub struct ReconstructableCollection {
    /// Canonical (upper-case) category name.
    pub category: String,
    /// Flat or graph.
    pub kind: CategoryKind,
    /// Collection name in both sinks.
    pub collection: String,
    /// Graph-owned fields, `_glpd` included.
    pub graph_fields: Vec<String>,
    /// Fields stripped on restore.
    pub strip_fields: Vec<String>,
    /// Primary store sink.
    pub primary: Arc<dyn PrimaryStore>,
    /// Search index sink.
    pub index: Arc<dyn SearchIndex>,
    /// Lifecycle sink, set on flat categories that replay lifecycles.
    pub lifecycles: Option<Arc<dyn LifecycleStore>>,
}

impl std::fmt::Debug for ReconstructableCollection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconstructableCollection")
            .field("category", &self.category)
            .field("kind", &self.kind)
            .field("collection", &self.collection)
            .field("graph_fields", &self.graph_fields)
            .field("lifecycles", &self.lifecycles.is_some())
            .finish()
    }
}

/// Case-insensitive category lookup, built once at startup.
#[derive(Debug, Clone, Default)]
pub struct CategoryRegistry {
    by_name: BTreeMap<String, ReconstructableCollection>,
}

fn canonical(name: &str) -> String {
    name.trim().to_uppercase()
}

impl CategoryRegistry {
    /// Build the registry, binding every category to the given sinks.
    ///
    /// Fails on empty or duplicate names and on graph categories whose
    /// target is not a registered flat category.
    pub fn build(
        configs: &[CollectionConfig],
        primary: Arc<dyn PrimaryStore>,
        index: Arc<dyn SearchIndex>,
    ) -> Result<Self> {
        Self::build_with_lifecycles(configs, primary, index, None)
    }

    /// Like [`CategoryRegistry::build`], with a lifecycle sink for the flat
    /// categories configured with `lifecycles`. Such a category without a
    /// lifecycle sink is a configuration error.
    pub fn build_with_lifecycles(
        configs: &[CollectionConfig],
        primary: Arc<dyn PrimaryStore>,
        index: Arc<dyn SearchIndex>,
        lifecycles: Option<Arc<dyn LifecycleStore>>,
    ) -> Result<Self> {
        let mut by_name = BTreeMap::new();
        let mut flats: BTreeMap<String, &CollectionConfig> = BTreeMap::new();
        let mut seen = std::collections::HashSet::new();

        for cfg in configs {
            let name = canonical(&cfg.name);
            if name.is_empty() {
                return Err(ReconError::Config {
                    msg: "category with empty name".to_string(),
                });
            }
            if !seen.insert(name.clone()) {
                return Err(ReconError::Config {
                    msg: format!("category {} declared twice", name),
                });
            }
            if cfg.kind == CategoryKind::Flat {
                flats.insert(name, cfg);
            }
        }

        for cfg in configs {
            let category = canonical(&cfg.name);
            let entry = match cfg.kind {
                CategoryKind::Flat => {
                    let lifecycle_sink = match (cfg.lifecycles, &lifecycles) {
                        (false, _) => None,
                        (true, Some(sink)) => Some(sink.clone()),
                        (true, None) => {
                            return Err(ReconError::Config {
                                msg: format!("category {} replays lifecycles but no lifecycle store is bound", category),
                            })
                        }
                    };
                    ReconstructableCollection {
                        collection: cfg.target.clone().unwrap_or_else(|| cfg.name.clone()),
                        category: category.clone(),
                        kind: CategoryKind::Flat,
                        graph_fields: cfg.graph_fields.clone(),
                        strip_fields: cfg.strip_fields.clone(),
                        primary: primary.clone(),
                        index: index.clone(),
                        lifecycles: lifecycle_sink,
                    }
                }
                CategoryKind::Graph => {
                    let target_name = cfg.target.as_deref().map(canonical).ok_or_else(|| ReconError::Config {
                        msg: format!("graph category {} has no target", category),
                    })?;
                    let target = flats.get(&target_name).ok_or_else(|| ReconError::Config {
                        msg: format!("graph category {} targets unknown flat category {}", category, target_name),
                    })?;
                    let graph_fields = if cfg.graph_fields.is_empty() {
                        target.graph_fields.clone()
                    } else {
                        cfg.graph_fields.clone()
                    };
                    if graph_fields.is_empty() {
                        return Err(ReconError::Config {
                            msg: format!("graph category {} has no graph fields", category),
                        });
                    }
                    ReconstructableCollection {
                        collection: target.target.clone().unwrap_or_else(|| target.name.clone()),
                        category: category.clone(),
                        kind: CategoryKind::Graph,
                        graph_fields,
                        strip_fields: cfg.strip_fields.clone(),
                        primary: primary.clone(),
                        index: index.clone(),
                        lifecycles: None,
                    }
                }
            };
            by_name.insert(category, entry);
        }

        Ok(Self { by_name })
    }

    /// Look a category up, ignoring case.
    pub fn get(&self, name: &str) -> Option<&ReconstructableCollection> {
        self.by_name.get(&canonical(name))
    }

    /// All graph categories, by name.
    pub fn graph_collections(&self) -> impl Iterator<Item = &ReconstructableCollection> {
        self.by_name.values().filter(|c| c.kind == CategoryKind::Graph)
    }

    /// Registered category names.
    pub fn names(&self) -> Vec<String> {
        self.by_name.keys().cloned().collect()
    }
}
