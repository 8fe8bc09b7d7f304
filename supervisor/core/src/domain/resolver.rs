// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Dependency Resolver
//!
//! Orders services so that every service comes strictly after all of its
//! dependencies. Uses Kahn's algorithm with a lexicographically ordered ready
//! set, so the same manifest always yields the same start order.

use crate::domain::manifest::ServiceSpec;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error("dependency cycle between services: {}", ids.join(", "))]
    Cycle { ids: Vec<String> },

    #[error("service '{service}' depends on unknown service '{dependency}'")]
    UnknownDependency { service: String, dependency: String },

    #[error("duplicate service id '{0}'")]
    DuplicateId(String),
}

/// Service dependency graph keyed by service id.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    /// id -> ids it depends on
    dependencies: BTreeMap<String, BTreeSet<String>>,
    /// id -> ids that depend on it
    dependents: BTreeMap<String, BTreeSet<String>>,
}

impl DependencyGraph {
    /// Build a graph from `(id, dependencies)` pairs.
    pub fn build<'a, I>(nodes: I) -> Result<Self, ResolveError>
    where
        I: IntoIterator<Item = (&'a str, &'a [String])>,
    {
        let nodes: Vec<(&str, &[String])> = nodes.into_iter().collect();
        let mut dependencies: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        let mut dependents: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();

        for (id, _) in &nodes {
            if dependencies.insert(id.to_string(), BTreeSet::new()).is_some() {
                return Err(ResolveError::DuplicateId(id.to_string()));
            }
            dependents.insert(id.to_string(), BTreeSet::new());
        }

        for (id, deps) in &nodes {
            for dep in deps.iter() {
                if !dependencies.contains_key(dep) {
                    return Err(ResolveError::UnknownDependency {
                        service: id.to_string(),
                        dependency: dep.clone(),
                    });
                }
                if let Some(set) = dependencies.get_mut(*id) {
                    set.insert(dep.clone());
                }
                if let Some(set) = dependents.get_mut(dep) {
                    set.insert(id.to_string());
                }
            }
        }

        Ok(Self {
            dependencies,
            dependents,
        })
    }

    pub fn from_services(services: &[ServiceSpec]) -> Result<Self, ResolveError> {
        Self::build(
            services
                .iter()
                .map(|service| (service.id.as_str(), service.dependencies.as_slice())),
        )
    }

    /// Topological order, ties broken by id.
    pub fn order(&self) -> Result<Vec<String>, ResolveError> {
        let mut in_degree: BTreeMap<&str, usize> = self
            .dependencies
            .iter()
            .map(|(id, deps)| (id.as_str(), deps.len()))
            .collect();

        let mut ready: BTreeSet<&str> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(id, _)| *id)
            .collect();

        let mut order = Vec::with_capacity(in_degree.len());
        while let Some(id) = ready.pop_first() {
            order.push(id.to_string());
            for dependent in self.dependents.get(id).into_iter().flatten() {
                if let Some(degree) = in_degree.get_mut(dependent.as_str()) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.insert(dependent.as_str());
                    }
                }
            }
        }

        if order.len() < in_degree.len() {
            let ids = in_degree
                .into_iter()
                .filter(|(_, degree)| *degree > 0)
                .map(|(id, _)| id.to_string())
                .collect();
            return Err(ResolveError::Cycle { ids });
        }

        Ok(order)
    }

    /// Every service `id` depends on, directly or transitively.
    pub fn ancestors(&self, id: &str) -> BTreeSet<String> {
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<&str> = VecDeque::from([id]);
        while let Some(current) = queue.pop_front() {
            for dep in self.dependencies.get(current).into_iter().flatten() {
                if seen.insert(dep.clone()) {
                    queue.push_back(dep.as_str());
                }
            }
        }
        seen
    }
}

/// Topologically sort services; see [`DependencyGraph::order`].
pub fn topo_sort(services: &[ServiceSpec]) -> Result<Vec<String>, ResolveError> {
    DependencyGraph::from_services(services)?.order()
}
