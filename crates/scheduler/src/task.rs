//! Task implementation contract.
//!
//! A task is a named executor over a typed payload. Collaborators implement
//! [`Task`]; the registry stores it type-erased (name, executor, payload codec)
//! so one scheduler can run tasks with unrelated payload types. The payload
//! type is resolved when an instance is claimed, by decoding its bytes.

use std::panic::{AssertUnwindSafe, catch_unwind};

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::payload::Payload;
use crate::policy::{Attempts, Outcome};
use crate::scheduler::SchedulerHandle;

/// Value returned by an executor that did not raise an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskConclusion {
    /// The work is done; the instance is removed.
    Complete,
    /// Not done yet; the `on_incomplete` policy decides whether to run again.
    Incomplete,
}

/// Result of one executor invocation. `Err` is a failure.
pub type TaskResult = Result<TaskConclusion, anyhow::Error>;

/// Read-only view handed to an executor for one invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskContext<T> {
    payload: T,
    failure_count: u32,
    repeat_count: u32,
}

impl<T> TaskContext<T> {
    pub fn new(payload: T, failure_count: u32, repeat_count: u32) -> Self {
        Self {
            payload,
            failure_count,
            repeat_count,
        }
    }

    pub fn payload(&self) -> &T {
        &self.payload
    }

    pub fn into_payload(self) -> T {
        self.payload
    }

    /// Consecutive failed attempts before this one.
    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    /// Attempts made before this one.
    pub fn repeat_count(&self) -> u32 {
        self.repeat_count
    }
}

/// A named executor registered with the scheduler.
///
/// Executors run on worker threads and may block (HTTP calls, database
/// writes). Returning `Err` or panicking counts as a failure.
pub trait Task: Send + Sync + 'static {
    type Payload: Serialize + DeserializeOwned + Send + 'static;

    /// Unique name the task is registered and enqueued under.
    fn name(&self) -> &str;

    /// Run one attempt.
    fn apply(&self, context: TaskContext<Self::Payload>) -> TaskResult;

    /// Called once after the registry is built.
    ///
    /// Tasks that enqueue follow-up work (including themselves) keep the
    /// handle; the default ignores it.
    fn task_initialised(&self, _scheduler: &SchedulerHandle) {}
}

/// Type-erased task as stored in the registry.
pub(crate) trait ErasedTask: Send + Sync {
    fn name(&self) -> &str;

    /// Decode the payload, run the executor, and classify the result.
    fn run(&self, payload: &Payload, attempts: Attempts) -> Classified;

    fn initialise(&self, scheduler: &SchedulerHandle);
}

/// Outcome of an attempt plus the error that caused a failure, for logging.
#[derive(Debug)]
pub(crate) struct Classified {
    pub outcome: Outcome,
    pub error: Option<String>,
}

impl Classified {
    fn from_result(result: TaskResult) -> Self {
        match result {
            Ok(TaskConclusion::Complete) => Self {
                outcome: Outcome::Complete,
                error: None,
            },
            Ok(TaskConclusion::Incomplete) => Self {
                outcome: Outcome::Incomplete,
                error: None,
            },
            Err(err) => Self::failure(format!("{err:#}")),
        }
    }

    fn failure(error: String) -> Self {
        Self {
            outcome: Outcome::Failure,
            error: Some(error),
        }
    }
}

/// Adapter pairing a typed task with its payload codec.
pub(crate) struct TypedTask<T>(pub T);

impl<T: Task> ErasedTask for TypedTask<T> {
    fn name(&self) -> &str {
        self.0.name()
    }

    fn run(&self, payload: &Payload, attempts: Attempts) -> Classified {
        let decoded: T::Payload = match payload.decode() {
            Ok(p) => p,
            Err(e) => return Classified::failure(format!("payload decode failed: {e}")),
        };
        let context = TaskContext::new(decoded, attempts.failure_count, attempts.repeat_count);

        match catch_unwind(AssertUnwindSafe(|| self.0.apply(context))) {
            Ok(result) => Classified::from_result(result),
            Err(panic) => Classified::failure(format!("executor panicked: {}", panic_message(&*panic))),
        }
    }

    fn initialise(&self, scheduler: &SchedulerHandle) {
        self.0.task_initialised(scheduler);
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize)]
    struct Poll {
        connection: String,
    }

    struct PollConnection;

    impl Task for PollConnection {
        type Payload = Poll;

        fn name(&self) -> &str {
            "poll-connection"
        }

        fn apply(&self, context: TaskContext<Poll>) -> TaskResult {
            match context.payload().connection.as_str() {
                "ready" => Ok(TaskConclusion::Complete),
                "pending" => Ok(TaskConclusion::Incomplete),
                "panic" => panic!("bank rail exploded"),
                other => anyhow::bail!("unknown connection {other}"),
            }
        }
    }

    fn run(connection: &str) -> Classified {
        let payload = Payload::encode(&Poll {
            connection: connection.to_string(),
        })
        .unwrap();
        TypedTask(PollConnection).run(&payload, Attempts::default())
    }

    #[test]
    fn conclusions_map_to_outcomes() {
        assert_eq!(run("ready").outcome, Outcome::Complete);
        assert_eq!(run("pending").outcome, Outcome::Incomplete);
    }

    #[test]
    fn returned_error_is_a_failure() {
        let classified = run("closed");
        assert_eq!(classified.outcome, Outcome::Failure);
        assert_eq!(classified.error.as_deref(), Some("unknown connection closed"));
    }

    #[test]
    fn panic_is_caught_and_classified_as_failure() {
        let classified = run("panic");
        assert_eq!(classified.outcome, Outcome::Failure);
        assert!(classified.error.unwrap().contains("bank rail exploded"));
    }

    #[test]
    fn undecodable_payload_is_a_failure_without_running() {
        let payload = Payload::encode(&42).unwrap();
        let classified = TypedTask(PollConnection).run(&payload, Attempts::default());
        assert_eq!(classified.outcome, Outcome::Failure);
        assert!(classified.error.unwrap().starts_with("payload decode failed"));
    }

    #[test]
    fn context_exposes_counters() {
        let ctx = TaskContext::new("one".to_string(), 2, 5);
        assert_eq!(ctx.failure_count(), 2);
        assert_eq!(ctx.repeat_count(), 5);
        assert_eq!(ctx.into_payload(), "one");
    }
}
