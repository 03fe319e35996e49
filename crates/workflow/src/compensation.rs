//! Per-execution compensation stack.
//!
//! Entries are pushed as compensating steps complete and popped in reverse
//! during unwind. The stack lives in memory only and is lost if the process
//! dies mid-execution.

use std::sync::Arc;

use async_trait::async_trait;

use crate::context::WorkflowContext;
use crate::step::{Step, StepError};

/// A deferred undo operation.
#[async_trait]
pub(crate) trait CompensationAction: Send + Sync {
    async fn compensate(&self, ctx: &WorkflowContext) -> Result<(), StepError>;
}

/// Compensation for one completed step, capturing what it consumed and
/// produced.
pub(crate) struct StepCompensation<S: Step> {
    step: Arc<S>,
    input: S::Input,
    output: S::Output,
    data: Option<serde_json::Value>,
}

impl<S: Step> StepCompensation<S> {
    pub(crate) fn new(
        step: Arc<S>,
        input: S::Input,
        output: S::Output,
        data: Option<serde_json::Value>,
    ) -> Self {
        Self {
            step,
            input,
            output,
            data,
        }
    }
}

#[async_trait]
impl<S: Step> CompensationAction for StepCompensation<S> {
    async fn compensate(&self, ctx: &WorkflowContext) -> Result<(), StepError> {
        self.step
            .compensate(&self.input, &self.output, self.data.as_ref(), ctx)
            .await
    }
}

/// One registered compensation.
pub struct CompensationEntry {
    pub step_name: String,
    pub step_index: u32,
    pub(crate) action: Box<dyn CompensationAction>,
}

impl std::fmt::Debug for CompensationEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompensationEntry")
            .field("step_name", &self.step_name)
            .field("step_index", &self.step_index)
            .finish_non_exhaustive()
    }
}

/// LIFO stack of compensations for one execution attempt.
#[derive(Debug, Default)]
pub struct CompensationStack {
    entries: Vec<CompensationEntry>,
}

impl CompensationStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, entry: CompensationEntry) {
        self.entries.push(entry);
    }

    /// Removes the most recently registered entry.
    pub fn pop(&mut self) -> Option<CompensationEntry> {
        self.entries.pop()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Step names from most to least recently registered, i.e. unwind order.
    pub fn unwind_order(&self) -> Vec<&str> {
        self.entries
            .iter()
            .rev()
            .map(|entry| entry.step_name.as_str())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;

    #[async_trait]
    impl CompensationAction for Noop {
        async fn compensate(&self, _ctx: &WorkflowContext) -> Result<(), StepError> {
            Ok(())
        }
    }

    fn entry(name: &str, index: u32) -> CompensationEntry {
        CompensationEntry {
            step_name: name.to_string(),
            step_index: index,
            action: Box::new(Noop),
        }
    }

    #[test]
    fn pops_in_reverse_registration_order() {
        let mut stack = CompensationStack::new();
        stack.push(entry("reserve-inventory", 0));
        stack.push(entry("authorize-payment", 1));

        assert_eq!(stack.len(), 2);
        assert_eq!(
            stack.unwind_order(),
            vec!["authorize-payment", "reserve-inventory"]
        );
        assert_eq!(stack.pop().unwrap().step_index, 1);
        assert_eq!(stack.pop().unwrap().step_index, 0);
        assert!(stack.pop().is_none());
        assert!(stack.is_empty());
    }
}
