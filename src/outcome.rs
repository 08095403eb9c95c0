//! Per-dispatch result value carrying the instance disposition flags

use crate::SagaId;
use std::collections::HashMap;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct SagaFlags {
    complete: bool,
    unchanged: bool,
}

/// The handler pipeline's verdict on each instance it touched.
///
/// Instead of mutable flags on the saga object itself, handlers record
/// "marked complete" and "marked unchanged" here and return the value from
/// the pipeline. Completeness wins when both flags are set for an instance.
#[derive(Debug, Default)]
pub struct DispatchOutcome {
    flags: HashMap<SagaId, SagaFlags>,
}

impl DispatchOutcome {
    /// An outcome with no flags set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the instance's workflow as finished; a loaded instance will be
    /// deleted, a created one never persisted.
    pub fn mark_complete(&mut self, id: SagaId) {
        self.flags.entry(id).or_default().complete = true;
    }

    /// Mark the instance as untouched, skipping the no-op write.
    pub fn mark_unchanged(&mut self, id: SagaId) {
        self.flags.entry(id).or_default().unchanged = true;
    }

    /// Was the instance marked complete?
    pub fn is_marked_complete(&self, id: SagaId) -> bool {
        self.flags.get(&id).map(|f| f.complete).unwrap_or(false)
    }

    /// Was the instance marked unchanged? (Raw flag; completeness takes
    /// precedence during classification.)
    pub fn is_marked_unchanged(&self, id: SagaId) -> bool {
        self.flags.get(&id).map(|f| f.unchanged).unwrap_or(false)
    }
}
