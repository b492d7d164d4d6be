//! Task registry for type-erased handler dispatch
//!
//! The registry maps task ids to registered handler instances so the
//! execution manager can run them from stored JSON input without knowing the
//! concrete type at runtime.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::context::TaskContext;
use crate::error::TaskError;
use crate::persistence::ErrorInfo;
use crate::task::Task;

/// Type-erased task interface
///
/// All inputs and outputs are JSON; typed codecs live in the wrapper.
#[async_trait]
pub trait AnyTask: Send + Sync {
    /// The task id this handler serves
    fn id(&self) -> &'static str;

    /// Run one attempt with a JSON input
    async fn run(&self, ctx: &TaskContext, input: Value) -> Result<Value, TaskError>;
}

/// Wrapper implementing [`AnyTask`] for any [`Task`]
struct TaskAdapter<T: Task> {
    inner: T,
}

#[async_trait]
impl<T: Task> AnyTask for TaskAdapter<T> {
    fn id(&self) -> &'static str {
        T::ID
    }

    async fn run(&self, ctx: &TaskContext, input: Value) -> Result<Value, TaskError> {
        let typed: T::Input = serde_json::from_value(input).map_err(|e| {
            TaskError::Failed(ErrorInfo::new(format!(
                "failed to decode input for task {}: {e}",
                T::ID
            )))
        })?;

        let output = self.inner.run(ctx, typed).await?;

        serde_json::to_value(output).map_err(|e| {
            TaskError::Failed(ErrorInfo::new(format!(
                "failed to encode result for task {}: {e}",
                T::ID
            )))
        })
    }
}

/// Registry of task handler instances
pub struct TaskRegistry {
    tasks: HashMap<String, Arc<dyn AnyTask>>,
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self {
            tasks: HashMap::new(),
        }
    }

    /// Register a task handler instance
    ///
    /// Registering the same id twice replaces the previous handler.
    pub fn register<T: Task>(&mut self, task: T) {
        self.tasks
            .insert(T::ID.to_string(), Arc::new(TaskAdapter { inner: task }));
    }

    /// Check whether a task id is registered
    pub fn contains(&self, task_id: &str) -> bool {
        self.tasks.contains_key(task_id)
    }

    /// Look up a handler by id
    pub fn get(&self, task_id: &str) -> Option<Arc<dyn AnyTask>> {
        self.tasks.get(task_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// All registered task ids
    pub fn task_ids(&self) -> impl Iterator<Item = &str> {
        self.tasks.keys().map(|s| s.as_str())
    }
}

impl fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("task_ids", &self.tasks.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct DoubleInput {
        value: i64,
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct DoubleOutput {
        result: i64,
    }

    struct DoubleTask;

    #[async_trait]
    impl Task for DoubleTask {
        const ID: &'static str = "double";
        type Input = DoubleInput;
        type Output = DoubleOutput;

        async fn run(
            &self,
            _ctx: &TaskContext,
            input: Self::Input,
        ) -> Result<Self::Output, TaskError> {
            Ok(DoubleOutput {
                result: input.value * 2,
            })
        }
    }

    #[test]
    fn test_register_and_lookup() {
        let mut registry = TaskRegistry::new();
        registry.register(DoubleTask);

        assert!(registry.contains("double"));
        assert!(!registry.contains("unknown"));
        assert_eq!(registry.len(), 1);

        let ids: Vec<_> = registry.task_ids().collect();
        assert_eq!(ids, vec!["double"]);
    }

    #[test]
    fn test_registry_debug() {
        let mut registry = TaskRegistry::new();
        registry.register(DoubleTask);

        let rendered = format!("{registry:?}");
        assert!(rendered.contains("double"));
    }

    #[tokio::test]
    async fn test_adapter_decodes_input() {
        let mut registry = TaskRegistry::new();
        registry.register(DoubleTask);

        let handler = registry.get("double").unwrap();
        let ctx = TaskContext::for_tests();

        let output = handler
            .run(&ctx, serde_json::json!({"value": 21}))
            .await
            .unwrap();
        assert_eq!(output, serde_json::json!({"result": 42}));

        let bad_input = handler.run(&ctx, serde_json::json!({"nope": true})).await;
        assert!(matches!(bad_input, Err(TaskError::Failed(_))));
    }
}
