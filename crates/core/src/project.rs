//! Project manifest - the classes a session should generate tests for.

use serde::{Deserialize, Serialize};

use crate::dependency::{ClassDependencies, DependencyIndex};

/// A project as seen by the scheduler.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectManifest {
    /// Project name
    #[serde(default)]
    pub name: String,

    /// Classes under test, in declaration order
    pub classes: Vec<ClassEntry>,
}

/// One class in the manifest.
///
/// Accepts either a bare class name or an object with declared dependencies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ClassEntry {
    /// Class name only
    Name(String),
    /// Class with declared dependencies
    Declared {
        /// Fully-qualified class name
        name: String,
        /// Declared dependencies
        #[serde(flatten)]
        dependencies: ClassDependencies,
    },
}

impl ClassEntry {
    /// Class name.
    pub fn name(&self) -> &str {
        match self {
            ClassEntry::Name(name) => name,
            ClassEntry::Declared { name, .. } => name,
        }
    }

    /// Declared dependencies, if any.
    pub fn dependencies(&self) -> Option<&ClassDependencies> {
        match self {
            ClassEntry::Name(_) => None,
            ClassEntry::Declared { dependencies, .. } => Some(dependencies),
        }
    }
}

impl ProjectManifest {
    /// Manifest listing `classes` with no declared dependencies.
    pub fn from_names<I, S>(classes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: String::new(),
            classes: classes.into_iter().map(|c| ClassEntry::Name(c.into())).collect(),
        }
    }

    /// Class names in declaration order, first occurrence wins.
    pub fn class_names(&self) -> Vec<String> {
        let mut seen = std::collections::HashSet::new();
        self.classes
            .iter()
            .map(ClassEntry::name)
            .filter(|name| seen.insert(*name))
            .map(str::to_string)
            .collect()
    }

    /// Declared dependencies as an index.
    pub fn declared_dependencies(&self) -> DependencyIndex {
        let mut index = DependencyIndex::new();
        for entry in &self.classes {
            if let Some(deps) = entry.dependencies() {
                index.record_all(entry.name(), deps);
            }
        }
        index
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mixed_entries() {
        let manifest: ProjectManifest = serde_json::from_str(
            r#"{
                "name": "demo",
                "classes": [
                    "org.B",
                    {"name": "org.A", "inputs": ["org.B"], "parents": ["org.Base"]},
                    "org.B"
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(manifest.class_names(), vec!["org.B", "org.A"]);
        let index = manifest.declared_dependencies();
        assert!(index.lookup("org.A").inputs.contains("org.B"));
        assert!(index.lookup("org.A").parents.contains("org.Base"));
        assert!(!index.contains("org.B"));
    }

    #[test]
    fn test_from_names() {
        let manifest = ProjectManifest::from_names(["x.X", "y.Y"]);
        assert_eq!(manifest.class_names(), vec!["x.X", "y.Y"]);
        assert!(manifest.declared_dependencies().is_empty());
    }
}
