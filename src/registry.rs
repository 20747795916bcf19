//! `TaskRegistry`: an in-memory `taskId -> workflow function` map with
//! an optional external resolver for sharded applications. See §4.1.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;

use crate::context::{DurableContext, ExecOutcome};
use crate::model::TaskId;

/// A registered workflow function: JSON in, JSON out, driven by an
/// explicit `DurableContext` (see §9's redesign note — no thread-local
/// accessor).
pub type TaskFn = Arc<dyn Fn(DurableContext, Value) -> BoxFuture<'static, Result<Value, ExecOutcome>> + Send + Sync>;

/// An optional external resolver, consulted when a task id is not found
/// locally (for sharded deployments where not every worker registers
/// every task).
pub type ExternalResolver = Arc<dyn Fn(&str) -> Option<TaskFn> + Send + Sync>;

#[derive(Clone)]
pub struct TaskRegistry {
    tasks: HashMap<TaskId, TaskFn>,
    external_resolver: Option<ExternalResolver>,
}

impl fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("task_ids", &self.tasks.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self { tasks: HashMap::new(), external_resolver: None }
    }

    pub fn with_external_resolver(mut self, resolver: ExternalResolver) -> Self {
        self.external_resolver = Some(resolver);
        self
    }

    /// Idempotent: registering the same `task_id` twice replaces the
    /// prior function without error.
    pub fn register(&mut self, task_id: impl Into<TaskId>, task: TaskFn) {
        self.tasks.insert(task_id.into(), task);
    }

    pub fn find(&self, task_id: &str) -> Option<TaskFn> {
        self.tasks
            .get(task_id)
            .cloned()
            .or_else(|| self.external_resolver.as_ref().and_then(|resolve| resolve(task_id)))
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.tasks.contains_key(task_id) || self.external_resolver.as_ref().is_some_and(|r| r(task_id).is_some())
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn double_task() -> TaskFn {
        Arc::new(|_ctx, input| {
            Box::pin(async move {
                let v = input.get("v").and_then(Value::as_i64).unwrap_or(0);
                Ok(json!({ "v": v * 2 }))
            })
        })
    }

    #[test]
    fn register_is_idempotent_and_replaces() {
        let mut registry = TaskRegistry::new();
        registry.register("double", double_task());
        assert!(registry.contains("double"));
        registry.register("double", double_task());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn find_falls_back_to_external_resolver() {
        let resolver: ExternalResolver = Arc::new(|id| if id == "remote" { Some(double_task()) } else { None });
        let registry = TaskRegistry::new().with_external_resolver(resolver);
        assert!(!registry.contains("unknown"));
        assert!(registry.contains("remote"));
        assert!(registry.find("remote").is_some());
    }

    #[test]
    fn missing_task_is_none_not_a_panic() {
        let registry = TaskRegistry::new();
        assert!(registry.find("missing").is_none());
    }
}
