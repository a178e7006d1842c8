//! Key dependency graph.
//!
//! An edge `parent → dependent` means the dependent is derived from the
//! parent and must go when the parent goes. Registration rejects edges that
//! would close a cycle, so traversal always terminates.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::RwLock;

use thiserror::Error;

use crate::cache::lock;

const SOURCE: &str = "cache::invalidation::graph";

#[derive(Debug, Error, PartialEq, Eq)]
#[error("dependency `{parent}` -> `{dependent}` would create a cycle")]
pub struct CycleError {
    pub parent: String,
    pub dependent: String,
}

#[derive(Default)]
pub struct DependencyGraph {
    edges: RwLock<HashMap<String, BTreeSet<String>>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, parent: &str, dependent: &str) -> Result<(), CycleError> {
        let mut edges = lock::write(&self.edges, SOURCE, "register");
        if parent == dependent || reaches(&edges, dependent, parent) {
            return Err(CycleError {
                parent: parent.to_string(),
                dependent: dependent.to_string(),
            });
        }
        edges
            .entry(parent.to_string())
            .or_default()
            .insert(dependent.to_string());
        Ok(())
    }

    pub fn dependents(&self, parent: &str) -> Vec<String> {
        lock::read(&self.edges, SOURCE, "dependents")
            .get(parent)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Transitive dependents of `root` in breadth-first order, at most `limit`.
    pub fn traverse(&self, root: &str, limit: usize) -> Vec<String> {
        let edges = lock::read(&self.edges, SOURCE, "traverse");
        let mut seen: HashSet<&str> = HashSet::from([root]);
        let mut frontier: VecDeque<&str> = VecDeque::from([root]);
        let mut out = Vec::new();
        while let Some(current) = frontier.pop_front() {
            let Some(children) = edges.get(current) else {
                continue;
            };
            for child in children {
                if out.len() >= limit {
                    return out;
                }
                if seen.insert(child.as_str()) {
                    out.push(child.clone());
                    frontier.push_back(child.as_str());
                }
            }
        }
        out
    }

    pub fn edge_count(&self) -> usize {
        lock::read(&self.edges, SOURCE, "edge_count")
            .values()
            .map(BTreeSet::len)
            .sum()
    }
}

fn reaches(edges: &HashMap<String, BTreeSet<String>>, from: &str, target: &str) -> bool {
    let mut seen: HashSet<&str> = HashSet::new();
    let mut stack = vec![from];
    while let Some(current) = stack.pop() {
        if current == target {
            return true;
        }
        if !seen.insert(current) {
            continue;
        }
        if let Some(children) = edges.get(current) {
            stack.extend(children.iter().map(String::as_str));
        }
    }
    false
}
