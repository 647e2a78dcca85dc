//! Dependency index - what each class is known to depend on.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::job::{ClassSet, JobDefinition};

/// Input and parent dependencies of one class.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassDependencies {
    /// Classes used as parameter or field types
    #[serde(default)]
    pub inputs: ClassSet,

    /// Supertypes and implemented interfaces
    #[serde(default)]
    pub parents: ClassSet,
}

impl ClassDependencies {
    /// Create from explicit sets.
    pub fn new(inputs: ClassSet, parents: ClassSet) -> Self {
        Self { inputs, parents }
    }

    /// True if neither set has entries.
    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty() && self.parents.is_empty()
    }

    /// Whether `class` appears in either set.
    pub fn contains(&self, class: &str) -> bool {
        self.inputs.contains(class) || self.parents.contains(class)
    }

    /// Iterate over the union of both sets (a class in both appears twice).
    pub fn all(&self) -> impl Iterator<Item = &String> {
        self.inputs.iter().chain(self.parents.iter())
    }

    /// Union `other` into `self`, returning whether anything was added.
    pub fn union_with(&mut self, other: &ClassDependencies) -> bool {
        let before = self.inputs.len() + self.parents.len();
        self.inputs.extend(other.inputs.iter().cloned());
        self.parents.extend(other.parents.iter().cloned());
        self.inputs.len() + self.parents.len() != before
    }

    /// The part of `self` that `job` does not know about yet.
    pub fn unknown_to(&self, job: &JobDefinition) -> ClassDependencies {
        let missing = |known: Option<&ClassSet>, set: &ClassSet| -> ClassSet {
            match known {
                Some(known) => set.difference(known).cloned().collect(),
                None => set.clone(),
            }
        };
        ClassDependencies {
            inputs: missing(job.input_classes(), &self.inputs),
            parents: missing(job.parent_classes(), &self.parents),
        }
    }

    /// Inputs as an optional set, absent when empty.
    pub fn inputs_opt(&self) -> Option<ClassSet> {
        Some(self.inputs.clone()).filter(|s| !s.is_empty())
    }

    /// Parents as an optional set, absent when empty.
    pub fn parents_opt(&self) -> Option<ClassSet> {
        Some(self.parents.clone()).filter(|s| !s.is_empty())
    }
}

/// Accumulated dependency knowledge, keyed by class name.
///
/// Entries only grow: recording unions into the existing entry and nothing is
/// ever removed, so recording the same sets twice is a no-op.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyIndex {
    entries: BTreeMap<String, ClassDependencies>,
}

impl DependencyIndex {
    /// Create an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Union `inputs` and `parents` into the entry for `class`.
    ///
    /// Returns whether the entry changed.
    pub fn record(&mut self, class: &str, inputs: &ClassSet, parents: &ClassSet) -> bool {
        self.record_all(class, &ClassDependencies::new(inputs.clone(), parents.clone()))
    }

    /// Union a whole [`ClassDependencies`] into the entry for `class`.
    pub fn record_all(&mut self, class: &str, deps: &ClassDependencies) -> bool {
        match self.entries.get_mut(class) {
            Some(entry) => entry.union_with(deps),
            None => {
                self.entries.insert(class.to_string(), deps.clone());
                !deps.is_empty()
            }
        }
    }

    /// Known dependencies of `class`, empty if never recorded.
    pub fn lookup(&self, class: &str) -> ClassDependencies {
        self.entries.get(class).cloned().unwrap_or_default()
    }

    /// Borrowed entry for `class`, if recorded.
    pub fn get(&self, class: &str) -> Option<&ClassDependencies> {
        self.entries.get(class)
    }

    /// Whether `class` has an entry.
    pub fn contains(&self, class: &str) -> bool {
        self.entries.contains_key(class)
    }

    /// Classes whose recorded dependencies include `class`.
    pub fn dependents_of(&self, class: &str) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|(name, deps)| name.as_str() != class && deps.contains(class))
            .map(|(name, _)| name.as_str())
            .collect()
    }

    /// Fold every entry of `other` into this index.
    pub fn merge(&mut self, other: &DependencyIndex) {
        for (class, deps) in &other.entries {
            self.record_all(class, deps);
        }
    }

    /// Iterate over all entries in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &ClassDependencies)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of classes with an entry.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if no class has been recorded.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
