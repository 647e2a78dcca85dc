//! Job definition - one bounded run of the search engine against one class.

use serde::Serialize;
use std::collections::BTreeSet;

use crate::error::{CoreError, Result};
use crate::id::{JobId, JobIdCounter};

/// A set of fully-qualified class names.
pub type ClassSet = BTreeSet<String>;

/// Immutable description of a generation job.
///
/// Built only through [`JobDefinition::new`] or
/// [`JobDefinition::with_dependencies`], both of which validate their input
/// and draw a fresh id from the session's counter. Equality covers every
/// field including the id, so two jobs for the same class are never equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct JobDefinition {
    job_id: JobId,
    seconds: u32,
    memory_mb: u32,
    cut: String,
    configuration_id: i32,
    input_classes: Option<ClassSet>,
    parent_classes: Option<ClassSet>,
    dependent_on_classes: Option<ClassSet>,
}

impl JobDefinition {
    /// Create a job definition.
    ///
    /// Empty dependency sets are stored as absent.
    pub fn new(
        ids: &JobIdCounter,
        seconds: u32,
        memory_mb: u32,
        cut: impl Into<String>,
        configuration_id: i32,
        inputs: Option<ClassSet>,
        parents: Option<ClassSet>,
    ) -> Result<Self> {
        let cut = cut.into();
        if seconds == 0 {
            return Err(CoreError::InvalidJobSpec(format!(
                "{}: time budget must be positive",
                cut
            )));
        }
        if memory_mb == 0 {
            return Err(CoreError::InvalidJobSpec(format!(
                "{}: memory budget must be positive",
                cut
            )));
        }
        if cut.trim().is_empty() {
            return Err(CoreError::InvalidJobSpec(
                "class under test must not be empty".to_string(),
            ));
        }

        let input_classes = non_empty(inputs);
        let parent_classes = non_empty(parents);

        let union: ClassSet = input_classes
            .iter()
            .chain(parent_classes.iter())
            .flatten()
            .cloned()
            .collect();

        Ok(Self {
            job_id: ids.next_id(),
            seconds,
            memory_mb,
            cut,
            configuration_id,
            input_classes,
            parent_classes,
            dependent_on_classes: non_empty(Some(union)),
        })
    }

    /// Copy this job with extra input and parent dependencies merged in.
    ///
    /// One of the two sets may be absent or empty, but not both. The copy
    /// gets a new id; budget, class and configuration are preserved.
    pub fn with_dependencies(
        &self,
        ids: &JobIdCounter,
        inputs: Option<ClassSet>,
        parents: Option<ClassSet>,
    ) -> Result<Self> {
        let inputs = non_empty(inputs);
        let parents = non_empty(parents);
        if inputs.is_none() && parents.is_none() {
            return Err(CoreError::InvalidMerge {
                cut: self.cut.clone(),
            });
        }

        Self::new(
            ids,
            self.seconds,
            self.memory_mb,
            self.cut.clone(),
            self.configuration_id,
            merge(&self.input_classes, inputs),
            merge(&self.parent_classes, parents),
        )
    }

    /// Unique id of this job.
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// Wall-clock budget in seconds.
    pub fn seconds(&self) -> u32 {
        self.seconds
    }

    /// Memory ceiling in megabytes.
    pub fn memory_mb(&self) -> u32 {
        self.memory_mb
    }

    /// Fully-qualified name of the class under test.
    pub fn cut(&self) -> &str {
        &self.cut
    }

    /// Parameter profile used for this job.
    pub fn configuration_id(&self) -> i32 {
        self.configuration_id
    }

    /// Classes used as inputs by the class under test.
    pub fn input_classes(&self) -> Option<&ClassSet> {
        self.input_classes.as_ref()
    }

    /// Classes in the supertype chain of the class under test.
    pub fn parent_classes(&self) -> Option<&ClassSet> {
        self.parent_classes.as_ref()
    }

    /// Union of input and parent classes.
    pub fn dependent_on_classes(&self) -> Option<&ClassSet> {
        self.dependent_on_classes.as_ref()
    }

    /// Whether the job already knows about `class` as a dependency.
    pub fn depends_on(&self, class: &str) -> bool {
        self.dependent_on_classes
            .as_ref()
            .is_some_and(|set| set.contains(class))
    }
}

impl std::fmt::Display for JobDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.job_id, self.cut)
    }
}

fn non_empty(set: Option<ClassSet>) -> Option<ClassSet> {
    set.filter(|s| !s.is_empty())
}

fn merge(existing: &Option<ClassSet>, extra: Option<ClassSet>) -> Option<ClassSet> {
    match (existing, extra) {
        (Some(old), Some(mut new)) => {
            new.extend(old.iter().cloned());
            Some(new)
        }
        (Some(old), None) => Some(old.clone()),
        (None, new) => new,
    }
}
