//! Blue/green replacement of a node pool.
//!
//! Changes the service cannot apply in place are rolled out by standing up a
//! temporary pool with the desired settings, recreating the original under its
//! own name, and removing the temporary pool again. Workloads always have a pool
//! to run on except between deleting the original and recreating it.

use std::fmt;

use crate::error::NodePoolError;
use crate::types::NodePool;

/// Name of the stand-in pool used while the original is recreated.
pub const TEMP_NODE_POOL_NAME: &str = "temp-node-pool";

/// One step of a replacement, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReplacementStep {
    /// Create the temporary pool with the desired settings.
    CreateTemp,
    /// Delete the original pool.
    DeleteOriginal,
    /// Recreate the original pool with the desired settings.
    CreateOriginal,
    /// Delete the temporary pool.
    DeleteTemp,
}

impl ReplacementStep {
    /// Every step, in execution order.
    pub const ALL: [ReplacementStep; 4] = [
        ReplacementStep::CreateTemp,
        ReplacementStep::DeleteOriginal,
        ReplacementStep::CreateOriginal,
        ReplacementStep::DeleteTemp,
    ];

    /// Whether the step creates a pool.
    pub fn is_create(self) -> bool {
        matches!(self, ReplacementStep::CreateTemp | ReplacementStep::CreateOriginal)
    }

    /// Whether the step acts on the temporary pool.
    pub fn is_temp(self) -> bool {
        matches!(self, ReplacementStep::CreateTemp | ReplacementStep::DeleteTemp)
    }
}

impl fmt::Display for ReplacementStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ReplacementStep::CreateTemp => "create temporary node pool",
            ReplacementStep::DeleteOriginal => "delete original node pool",
            ReplacementStep::CreateOriginal => "create original node pool",
            ReplacementStep::DeleteTemp => "delete temporary node pool",
        };
        f.write_str(text)
    }
}

/// The remaining work of one replacement.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplacementPlan {
    original: String,
    desired: NodePool,
    completed: Vec<ReplacementStep>,
}

impl ReplacementPlan {
    /// Replace the pool named `original` with `desired`; the name in `desired` is ignored.
    pub fn new(original: impl Into<String>, desired: NodePool) -> Self {
        Self {
            original: original.into(),
            desired,
            completed: Vec::new(),
        }
    }

    /// Pick up a replacement after `completed` steps already ran, e.g. from
    /// [`NodePoolError::ReplacementInterrupted`].
    pub fn resume(mut self, completed: Vec<ReplacementStep>) -> Result<Self, NodePoolError> {
        if !ReplacementStep::ALL.starts_with(&completed) {
            return Err(NodePoolError::Configuration(format!(
                "cannot resume replacement of {} after steps {:?}",
                self.original, completed
            )));
        }
        self.completed = completed;
        Ok(self)
    }

    /// Name of the pool being replaced.
    pub fn original(&self) -> &str {
        &self.original
    }

    /// Steps already done.
    pub fn completed(&self) -> &[ReplacementStep] {
        &self.completed
    }

    /// Steps still to run, in order.
    pub fn remaining(&self) -> Vec<ReplacementStep> {
        ReplacementStep::ALL[self.completed.len()..].to_vec()
    }

    /// Record `step` as done.
    pub fn complete(&mut self, step: ReplacementStep) {
        self.completed.push(step);
    }

    /// Name of the pool `step` acts on.
    pub fn target(&self, step: ReplacementStep) -> &str {
        if step.is_temp() {
            TEMP_NODE_POOL_NAME
        } else {
            &self.original
        }
    }

    /// The pool to submit for a create step.
    pub fn pool_for(&self, step: ReplacementStep) -> NodePool {
        NodePool {
            name: self.target(step).to_string(),
            ..self.desired.clone()
        }
    }
}
