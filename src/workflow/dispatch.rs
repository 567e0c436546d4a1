//! Duplicate-submission suppression
//!
//! The dispatcher admits each workflow id at most once. A second submission
//! with the same id is a collision, not an error, and must not re-execute
//! the unit.

use super::WorkflowId;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Tracks admitted workflow ids for one process
#[derive(Clone, Default)]
pub struct Dispatcher {
    admitted: Arc<Mutex<HashSet<String>>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to admit a workflow id. Returns false on collision, in which
    /// case the caller must skip the unit.
    pub fn admit(&self, id: &WorkflowId) -> bool {
        let mut admitted = self.admitted.lock().expect("dispatcher lock");
        let fresh = admitted.insert(id.as_str().to_string());
        if !fresh {
            debug!(workflow_id = %id, "Duplicate submission suppressed");
        }
        fresh
    }

    /// Number of units admitted so far
    pub fn admitted_count(&self) -> usize {
        self.admitted.lock().expect("dispatcher lock").len()
    }
}
