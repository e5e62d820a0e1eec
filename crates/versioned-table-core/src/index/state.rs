//! Per-table build state machine.

use std::fmt;

use log::debug;

use crate::error::{CorruptStateSnafu, EngineResult};
use crate::model::IdAndVersion;

/// Where a table's index build currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexBuildState {
    /// The index already matches the truth.
    NoWorkNeeded,
    /// A COLUMN change is being applied.
    SchemaAlterationPending,
    /// ROW changes are being applied.
    RowBatchesPending,
    /// Secondary indices are being optimized.
    Optimizing,
    /// Terminal: the index is queryable.
    Available,
    /// Terminal: the build failed.
    Failed,
}

impl IndexBuildState {
    /// True for `Available`, `Failed` and `NoWorkNeeded`.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            IndexBuildState::Available | IndexBuildState::Failed | IndexBuildState::NoWorkNeeded
        )
    }

    /// Whether `self -> next` is a legal transition.
    pub fn can_transition_to(self, next: IndexBuildState) -> bool {
        use IndexBuildState::*;
        match (self, next) {
            (_, Failed) => !self.is_terminal() || self == NoWorkNeeded,
            (NoWorkNeeded, _) => true,
            (SchemaAlterationPending | RowBatchesPending, SchemaAlterationPending | RowBatchesPending) => true,
            (SchemaAlterationPending | RowBatchesPending, Optimizing) => true,
            (Optimizing, Available) => true,
            _ => false,
        }
    }
}

impl fmt::Display for IndexBuildState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IndexBuildState::NoWorkNeeded => "no work needed",
            IndexBuildState::SchemaAlterationPending => "schema alteration pending",
            IndexBuildState::RowBatchesPending => "row batches pending",
            IndexBuildState::Optimizing => "optimizing",
            IndexBuildState::Available => "available",
            IndexBuildState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Tracks the transitions of one build and rejects illegal ones.
#[derive(Debug, Clone)]
pub struct BuildStateTracker {
    table: IdAndVersion,
    current: IndexBuildState,
    transitions: Vec<IndexBuildState>,
}

impl BuildStateTracker {
    /// Start tracking a build of `table`.
    pub fn new(table: IdAndVersion) -> Self {
        Self {
            table,
            current: IndexBuildState::NoWorkNeeded,
            transitions: Vec::new(),
        }
    }

    /// Current state.
    pub fn current(&self) -> IndexBuildState {
        self.current
    }

    /// Every state entered, in order.
    pub fn transitions(&self) -> &[IndexBuildState] {
        &self.transitions
    }

    /// Move to `next`; repeated entries of the same state are collapsed.
    pub fn enter(&mut self, next: IndexBuildState) -> EngineResult<()> {
        if next == self.current && !self.transitions.is_empty() {
            return Ok(());
        }
        if !self.current.can_transition_to(next) {
            return CorruptStateSnafu {
                msg: format!(
                    "illegal build transition for {}: {} -> {next}",
                    self.table, self.current
                ),
            }
            .fail();
        }
        debug!("{}: {} -> {next}", self.table, self.current);
        self.current = next;
        self.transitions.push(next);
        Ok(())
    }
}
