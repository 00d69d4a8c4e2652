use crate::config::registry::ServiceDescriptor;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;

/// One "requires healthy" edge: `from` depends on `to`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct Edge {
    pub from: String,
    pub to: String,
}

/// Fatal graph construction problems, reported before any probing starts.
/// The offending edges are kept structured so callers can render them as
/// machine-readable output.
#[derive(Debug, Default, Serialize)]
pub struct ConstructionError {
    pub duplicates: Vec<String>,
    pub unknown: Vec<Edge>,
    pub cycle: Vec<Edge>,
}

impl ConstructionError {
    fn is_empty(&self) -> bool {
        self.duplicates.is_empty() && self.unknown.is_empty() && self.cycle.is_empty()
    }
}

impl fmt::Display for ConstructionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "dependency graph construction failed:")?;
        for name in &self.duplicates {
            writeln!(f, "  duplicate service `{name}`")?;
        }
        for edge in &self.unknown {
            writeln!(
                f,
                "  service `{}` requires unknown service `{}`",
                edge.from, edge.to
            )?;
        }
        for edge in &self.cycle {
            writeln!(f, "  cyclic edge `{}` -> `{}`", edge.from, edge.to)?;
        }
        Ok(())
    }
}

impl std::error::Error for ConstructionError {}

/// Immutable DAG of service descriptors. Built once at startup; all runtime
/// queries borrow from it.
#[derive(Debug)]
pub struct DependencyGraph {
    services: BTreeMap<String, ServiceDescriptor>,
    dependents: BTreeMap<String, Vec<String>>,
}

impl DependencyGraph {
    pub fn build(descriptors: Vec<ServiceDescriptor>) -> Result<Self, ConstructionError> {
        let mut error = ConstructionError::default();

        let mut services: BTreeMap<String, ServiceDescriptor> = BTreeMap::new();
        for descriptor in descriptors {
            if services.contains_key(&descriptor.name) {
                error.duplicates.push(descriptor.name.clone());
                continue;
            }
            services.insert(descriptor.name.clone(), descriptor);
        }

        let mut dependents: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for descriptor in services.values() {
            for dependency in &descriptor.requires {
                if !services.contains_key(dependency) {
                    error.unknown.push(Edge {
                        from: descriptor.name.clone(),
                        to: dependency.clone(),
                    });
                    continue;
                }
                dependents
                    .entry(dependency.clone())
                    .or_default()
                    .push(descriptor.name.clone());
            }
        }
        for names in dependents.values_mut() {
            names.sort();
        }

        error.cycle = detect_cycle_edges(&services);

        if error.is_empty() {
            Ok(Self {
                services,
                dependents,
            })
        } else {
            error.duplicates.sort();
            error.unknown.sort();
            error.cycle.sort();
            Err(error)
        }
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&ServiceDescriptor> {
        self.services.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.services.keys().map(String::as_str)
    }

    /// Services with no dependencies, eligible to start probing immediately
    /// and concurrently.
    pub fn roots(&self) -> Vec<&str> {
        self.services
            .values()
            .filter(|descriptor| descriptor.requires.is_empty())
            .map(|descriptor| descriptor.name.as_str())
            .collect()
    }

    pub fn dependencies_of(&self, name: &str) -> &[String] {
        self.services
            .get(name)
            .map(|descriptor| descriptor.requires.as_slice())
            .unwrap_or_default()
    }

    pub fn dependents_of(&self, name: &str) -> &[String] {
        self.dependents
            .get(name)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Direct dependents of `name` whose last unmet dependency just turned
    /// healthy. `healthy` must already contain `name` itself.
    pub fn unblocked_by(&self, name: &str, healthy: &BTreeSet<String>) -> Vec<String> {
        self.dependents_of(name)
            .iter()
            .filter(|dependent| {
                self.dependencies_of(dependent)
                    .iter()
                    .all(|dependency| healthy.contains(dependency))
            })
            .cloned()
            .collect()
    }

    /// All transitive dependents of `name`, in breadth-first order. Used for
    /// fail-fast propagation.
    pub fn downstream_of(&self, name: &str) -> Vec<String> {
        let mut visited = BTreeSet::new();
        let mut order = Vec::new();
        let mut queue: VecDeque<&str> = self.dependents_of(name).iter().map(String::as_str).collect();

        while let Some(current) = queue.pop_front() {
            if !visited.insert(current.to_string()) {
                continue;
            }
            order.push(current.to_string());
            for dependent in self.dependents_of(current) {
                queue.push_back(dependent);
            }
        }
        order
    }

    /// Kahn ordering over the whole graph; deterministic because ties are
    /// resolved in name order.
    pub fn topological_order(&self) -> Vec<String> {
        let mut indegree: BTreeMap<&str, usize> = self
            .services
            .values()
            .map(|descriptor| (descriptor.name.as_str(), descriptor.requires.len()))
            .collect();

        let mut ready: VecDeque<&str> = indegree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(name, _)| *name)
            .collect();

        let mut order = Vec::with_capacity(self.services.len());
        while let Some(current) = ready.pop_front() {
            order.push(current.to_string());
            for dependent in self.dependents_of(current) {
                if let Some(degree) = indegree.get_mut(dependent.as_str()) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.push_back(dependent.as_str());
                    }
                }
            }
        }
        order
    }
}

fn detect_cycle_edges(services: &BTreeMap<String, ServiceDescriptor>) -> Vec<Edge> {
    let mut indegree: BTreeMap<&str, usize> = BTreeMap::new();
    let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();

    for descriptor in services.values() {
        indegree.entry(descriptor.name.as_str()).or_insert(0);
        for dependency in &descriptor.requires {
            // Unknown references are reported separately; skip them here so
            // a dangling edge is not also misreported as a cycle.
            if !services.contains_key(dependency) {
                continue;
            }
            *indegree.entry(descriptor.name.as_str()).or_insert(0) += 1;
            dependents
                .entry(dependency.as_str())
                .or_default()
                .push(descriptor.name.as_str());
        }
    }

    let mut ready: VecDeque<&str> = indegree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(name, _)| *name)
        .collect();

    let mut remaining = indegree.clone();
    while let Some(current) = ready.pop_front() {
        remaining.remove(current);
        if let Some(names) = dependents.get(current) {
            for name in names {
                if let Some(degree) = remaining.get_mut(name) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.push_back(*name);
                    }
                }
            }
        }
    }

    // Every edge between two services stuck in the residual set participates
    // in (or feeds) a cycle.
    let stuck: BTreeSet<&str> = remaining.keys().copied().collect();
    let mut edges = Vec::new();
    for descriptor in services.values() {
        if !stuck.contains(descriptor.name.as_str()) {
            continue;
        }
        for dependency in &descriptor.requires {
            if stuck.contains(dependency.as_str()) {
                edges.push(Edge {
                    from: descriptor.name.clone(),
                    to: dependency.clone(),
                });
            }
        }
    }
    edges
}
