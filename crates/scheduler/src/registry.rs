//! Task registry: task name to executor and retry policies.
//!
//! Built once at startup and read-only afterwards. Construction fails fast on
//! duplicate names and on escalation targets that are not registered.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::warn;

use crate::error::ConfigurationError;
use crate::policy::RetryPolicies;
use crate::task::ErasedTask;

/// A registered task: executor plus its two retry policy slots.
#[derive(Clone)]
pub(crate) struct TaskDefinition {
    pub task: Arc<dyn ErasedTask>,
    pub policies: RetryPolicies,
}

impl core::fmt::Debug for TaskDefinition {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TaskDefinition")
            .field("name", &self.task.name())
            .field("policies", &self.policies)
            .finish()
    }
}

#[derive(Debug, Default)]
pub(crate) struct TaskRegistry {
    definitions: HashMap<String, TaskDefinition>,
}

impl TaskRegistry {
    /// Build the registry from task implementations and a per-name policy map.
    ///
    /// Tasks absent from `policies` get no retry policy on either channel.
    pub fn build(
        tasks: Vec<Arc<dyn ErasedTask>>,
        mut policies: HashMap<String, RetryPolicies>,
    ) -> Result<Self, ConfigurationError> {
        let mut definitions = HashMap::with_capacity(tasks.len());

        for task in tasks {
            let name = task.name().to_string();
            if definitions.contains_key(&name) {
                return Err(ConfigurationError::DuplicateTask(name));
            }
            let task_policies = policies.remove(&name).unwrap_or_default();
            definitions.insert(
                name,
                TaskDefinition {
                    task,
                    policies: task_policies,
                },
            );
        }

        for name in policies.keys() {
            warn!(task = %name, "retry policies configured for unregistered task; ignoring");
        }

        for (name, definition) in &definitions {
            for fallback in definition.policies.fallbacks() {
                if !definitions.contains_key(fallback) {
                    return Err(ConfigurationError::UnknownFallback {
                        task: name.clone(),
                        fallback: fallback.to_string(),
                    });
                }
            }
        }

        Ok(Self { definitions })
    }

    pub fn get(&self, name: &str) -> Option<&TaskDefinition> {
        self.definitions.get(name)
    }

    pub fn names(&self) -> HashSet<String> {
        self.definitions.keys().cloned().collect()
    }

    pub fn definitions(&self) -> impl Iterator<Item = &TaskDefinition> {
        self.definitions.values()
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }
}
