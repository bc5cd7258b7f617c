//! Extension provisioning order.
//!
//! Extensions are grouped into levels with Kahn's algorithm:
//!
//! Level 0: extensions with no dependencies
//! Level 1: extensions depending only on level 0 extensions
//! Level N: extensions depending only on extensions in levels < N
//!
//! Members of one level never depend on each other and may be applied
//! concurrently. Levels must be applied in order. Within a level extensions
//! are sorted by name so identical input always yields identical output.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use pkg_types::error::ConfigError;
use pkg_types::extension::Extension;

/// One dependency level of the extension graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionBatch {
    pub level: usize,
    pub extensions: Vec<Extension>,
}

impl ExtensionBatch {
    pub fn names(&self) -> Vec<&str> {
        self.extensions.iter().map(|e| e.name.as_str()).collect()
    }
}

/// Order a scale set's extensions into dependency levels.
///
/// Fails with `UnknownDependency` when an edge names a missing extension,
/// `DuplicateExtension` when a name repeats, and `CyclicDependency` (listing
/// one concrete cycle) when the peeling stalls.
pub fn order(extensions: &[Extension]) -> Result<Vec<ExtensionBatch>, ConfigError> {
    let mut by_name: BTreeMap<&str, &Extension> = BTreeMap::new();
    for ext in extensions {
        if by_name.insert(ext.name.as_str(), ext).is_some() {
            return Err(ConfigError::DuplicateExtension(ext.name.clone()));
        }
    }

    for ext in extensions {
        if let Some(missing) = ext
            .depends_on
            .iter()
            .find(|dep| !by_name.contains_key(dep.as_str()))
        {
            return Err(ConfigError::UnknownDependency {
                extension: ext.name.clone(),
                missing: missing.clone(),
            });
        }
    }

    let mut in_degree: BTreeMap<&str, usize> = by_name.keys().map(|name| (*name, 0)).collect();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    for ext in extensions {
        for dep in &ext.depends_on {
            if let Some(deg) = in_degree.get_mut(ext.name.as_str()) {
                *deg += 1;
            }
            dependents.entry(dep.as_str()).or_default().push(ext.name.as_str());
        }
    }

    let mut current: Vec<&str> = in_degree
        .iter()
        .filter(|&(_, deg)| *deg == 0)
        .map(|(name, _)| *name)
        .collect();
    let mut batches: Vec<ExtensionBatch> = Vec::new();
    let mut placed = 0usize;

    while !current.is_empty() {
        current.sort_unstable();
        let mut next = Vec::new();

        for name in &current {
            if let Some(deps) = dependents.get(name) {
                for dependent in deps {
                    if let Some(deg) = in_degree.get_mut(dependent) {
                        *deg = deg.saturating_sub(1);
                        if *deg == 0 {
                            next.push(*dependent);
                        }
                    }
                }
            }
        }

        placed += current.len();
        batches.push(ExtensionBatch {
            level: batches.len(),
            extensions: current.iter().map(|name| by_name[name].clone()).collect(),
        });
        current = next;
    }

    if placed < by_name.len() {
        let stalled: BTreeSet<&str> = in_degree
            .iter()
            .filter(|&(_, deg)| *deg > 0)
            .map(|(name, _)| *name)
            .collect();
        return Err(ConfigError::CyclicDependency {
            members: find_cycle(&stalled, &by_name),
        });
    }

    debug_assert_eq!(placed, extensions.len());
    Ok(batches)
}

/// Walk dependency edges among stalled nodes until one repeats. Every
/// stalled node has at least one stalled dependency, so the walk always
/// closes a cycle.
fn find_cycle(stalled: &BTreeSet<&str>, by_name: &BTreeMap<&str, &Extension>) -> Vec<String> {
    let Some(mut node) = stalled.iter().next().copied() else {
        return Vec::new();
    };
    let mut path: Vec<&str> = Vec::new();
    let mut position: HashMap<&str, usize> = HashMap::new();

    loop {
        if let Some(&idx) = position.get(node) {
            let mut cycle: Vec<String> = path[idx..].iter().map(|n| n.to_string()).collect();
            cycle.push(node.to_string());
            return cycle;
        }
        position.insert(node, path.len());
        path.push(node);

        let ext: &Extension = by_name[node];
        match ext.depends_on.iter().find(|d| stalled.contains(d.as_str())) {
            Some(dep) => node = dep.as_str(),
            None => return path.iter().map(|n| n.to_string()).collect(),
        }
    }
}

/// Ordered extension levels of one scale set, computed once per tick.
#[derive(Debug, Clone, Default)]
pub struct ExtensionGraph {
    batches: Vec<ExtensionBatch>,
}

impl ExtensionGraph {
    pub fn build(extensions: &[Extension]) -> Result<Self, ConfigError> {
        Ok(Self {
            batches: order(extensions)?,
        })
    }

    pub fn batches(&self) -> &[ExtensionBatch] {
        &self.batches
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    pub fn level_of(&self, name: &str) -> Option<usize> {
        self.batches
            .iter()
            .find(|b| b.extensions.iter().any(|e| e.name == name))
            .map(|b| b.level)
    }

    /// The levels limited to `names`, keeping level numbers. Empty levels are
    /// dropped.
    pub fn restrict(&self, names: &BTreeSet<String>) -> Vec<ExtensionBatch> {
        self.batches
            .iter()
            .filter_map(|batch| {
                let extensions: Vec<Extension> = batch
                    .extensions
                    .iter()
                    .filter(|e| names.contains(&e.name))
                    .cloned()
                    .collect();
                (!extensions.is_empty()).then(|| ExtensionBatch {
                    level: batch.level,
                    extensions,
                })
            })
            .collect()
    }
}
