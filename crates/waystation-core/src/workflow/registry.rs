//! Workflow trait and name -> workflow registry.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;

use super::context::WorkflowContext;
use super::error::StepError;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// User workflow code.
///
/// `run` is re-executed from the top on every invocation of a run. All side
/// effects must go through the context so they are recorded once and
/// replayed afterwards.
pub trait Workflow: Send + Sync {
    fn run<'a>(&'a self, ctx: &'a WorkflowContext) -> BoxFuture<'a, Result<Value, StepError>>;
}

/// Registered workflows keyed by the name used in the trigger path.
#[derive(Default)]
pub struct WorkflowRegistry {
    workflows: DashMap<String, Arc<dyn Workflow>>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a workflow, replacing any previous one with the same name.
    pub fn register(&self, name: impl Into<String>, workflow: impl Workflow + 'static) {
        let name = name.into();
        tracing::debug!(workflow = %name, "registered workflow");
        self.workflows.insert(name, Arc::new(workflow));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Workflow>> {
        self.workflows.get(name).map(|entry| Arc::clone(entry.value()))
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.workflows.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.workflows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workflows.is_empty()
    }
}
