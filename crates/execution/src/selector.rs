//! Class ranking strategies.

use std::cmp::{Ordering, Reverse};

use ctgen_core::{DependencyIndex, ScheduleStrategy, TieBreak};

use crate::dependency::PendingGraph;

/// A pending class as seen by a selector.
#[derive(Debug, Clone)]
pub struct Candidate<'a> {
    /// Class name
    pub class: &'a str,
    /// Declaration order in the project
    pub order: usize,
    /// Priority lost to earlier timeouts
    pub penalty: u32,
    /// Coverage reached in the last session that completed the class
    pub previous_coverage: Option<f64>,
}

impl Candidate<'_> {
    /// How much the class would gain from running, from its history alone.
    /// Never-run classes get the maximum.
    fn history_need(&self) -> u32 {
        match self.previous_coverage {
            Some(coverage) => ((1.0 - coverage.clamp(0.0, 1.0)) * 1000.0).round() as u32,
            None => 1000,
        }
    }
}

/// Strategy for ordering pending classes.
pub trait ClassSelector: Send + Sync {
    /// Return indices into `candidates`, best first.
    fn rank(&self, candidates: &[Candidate<'_>], index: &DependencyIndex) -> Vec<usize>;
}

/// Orders by declaration (or name) only.
pub struct SimpleSelector {
    tie_break: TieBreak,
}

impl SimpleSelector {
    /// Create a simple selector.
    pub fn new(tie_break: TieBreak) -> Self {
        Self { tie_break }
    }
}

impl ClassSelector for SimpleSelector {
    fn rank(&self, candidates: &[Candidate<'_>], _index: &DependencyIndex) -> Vec<usize> {
        let mut order: Vec<usize> = (0..candidates.len()).collect();
        order.sort_by(|&a, &b| tie_break(self.tie_break, &candidates[a], &candidates[b]));
        order
    }
}

/// Prefers classes that other pending classes depend on.
///
/// Score is the size of the pending dependents closure minus the timeout
/// penalty. With `history_first`, history need is compared before the
/// dependency score instead of after it.
pub struct DependencyFirstSelector {
    tie_break: TieBreak,
    history_first: bool,
}

impl DependencyFirstSelector {
    /// Create a dependency-first selector.
    pub fn new(tie_break: TieBreak) -> Self {
        Self {
            tie_break,
            history_first: false,
        }
    }

    /// Compare history need before the dependency score.
    pub fn with_history_first(mut self, history_first: bool) -> Self {
        self.history_first = history_first;
        self
    }
}

impl ClassSelector for DependencyFirstSelector {
    fn rank(&self, candidates: &[Candidate<'_>], index: &DependencyIndex) -> Vec<usize> {
        let names: Vec<&str> = candidates.iter().map(|c| c.class).collect();
        let graph = PendingGraph::build(&names, index);

        let scores: Vec<(i64, u32)> = candidates
            .iter()
            .map(|c| {
                let deps = graph.dependents_closure(c.class) as i64 - i64::from(c.penalty);
                (deps, c.history_need())
            })
            .collect();

        let mut order: Vec<usize> = (0..candidates.len()).collect();
        order.sort_by(|&a, &b| {
            let (dep_a, need_a) = scores[a];
            let (dep_b, need_b) = scores[b];
            let primary = if self.history_first {
                (Reverse(need_a), Reverse(dep_a)).cmp(&(Reverse(need_b), Reverse(dep_b)))
            } else {
                (Reverse(dep_a), Reverse(need_a)).cmp(&(Reverse(dep_b), Reverse(need_b)))
            };
            primary.then_with(|| tie_break(self.tie_break, &candidates[a], &candidates[b]))
        });
        order
    }
}

/// Selector strategies available.
pub enum SelectorStrategy {
    /// Declaration order
    Simple(SimpleSelector),
    /// Dependency-first, optionally history-first
    DependencyFirst(DependencyFirstSelector),
}

impl SelectorStrategy {
    /// Selector for a configured strategy.
    pub fn from_config(strategy: ScheduleStrategy, tie_break: TieBreak) -> Self {
        match strategy {
            ScheduleStrategy::Simple => Self::Simple(SimpleSelector::new(tie_break)),
            ScheduleStrategy::Seeding => {
                Self::DependencyFirst(DependencyFirstSelector::new(tie_break))
            }
            ScheduleStrategy::History => Self::DependencyFirst(
                DependencyFirstSelector::new(tie_break).with_history_first(true),
            ),
        }
    }
}

impl ClassSelector for SelectorStrategy {
    fn rank(&self, candidates: &[Candidate<'_>], index: &DependencyIndex) -> Vec<usize> {
        match self {
            Self::Simple(s) => s.rank(candidates, index),
            Self::DependencyFirst(s) => s.rank(candidates, index),
        }
    }
}

fn tie_break(policy: TieBreak, a: &Candidate<'_>, b: &Candidate<'_>) -> Ordering {
    match policy {
        TieBreak::Declaration => a.order.cmp(&b.order),
        TieBreak::Alphabetical => a.class.cmp(b.class).then(a.order.cmp(&b.order)),
    }
}
