use crate::future::Continuation;
use crate::sched::{current_scheduling_group, SchedulingGroup};

/// A unit of work owned by exactly one task queue and consumed
/// destructively by `run_and_dispose`.
///
/// Known kinds are enum variants so the hot paths dispatch without
/// indirection; anything else goes through the boxed [`OneshotTask`]
/// fallback.
pub struct Task {
    group: SchedulingGroup,
    kind: TaskKind,
}

pub(crate) enum TaskKind {
    /// Plain closure; locally spawned work and cross-shard invocations.
    Lambda(Box<dyn FnOnce()>),
    /// Continuation of a resolved future.
    Continuation(Continuation),
    /// Fallback trait-object case.
    Dyn(Box<dyn OneshotTask>),
}

/// Implemented by task types the runtime doesn't know about.
pub trait OneshotTask {
    fn run(self: Box<Self>);

    /// Back-pointer to the task this one is waiting on, for debug tracing.
    fn waiting_task(&self) -> Option<&Task> {
        None
    }
}

impl Task {
    /// Creates a task inheriting the current scheduling group.
    pub fn new(f: impl FnOnce() + 'static) -> Task {
        Task::with_group(current_scheduling_group(), f)
    }

    pub fn with_group(group: SchedulingGroup, f: impl FnOnce() + 'static) -> Task {
        Task {
            group,
            kind: TaskKind::Lambda(Box::new(f)),
        }
    }

    pub(crate) fn from_continuation(group: SchedulingGroup, c: Continuation) -> Task {
        Task {
            group,
            kind: TaskKind::Continuation(c),
        }
    }

    pub fn from_dyn(group: SchedulingGroup, t: Box<dyn OneshotTask>) -> Task {
        Task {
            group,
            kind: TaskKind::Dyn(t),
        }
    }

    pub fn scheduling_group(&self) -> SchedulingGroup {
        self.group
    }

    /// Executes the work and releases the task's storage.
    pub fn run_and_dispose(self) {
        match self.kind {
            TaskKind::Lambda(f) => f(),
            TaskKind::Continuation(c) => c.run(),
            TaskKind::Dyn(t) => t.run(),
        }
    }

    pub fn waiting_task(&self) -> Option<&Task> {
        match &self.kind {
            TaskKind::Dyn(t) => t.waiting_task(),
            _ => None,
        }
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.kind {
            TaskKind::Lambda(_) => "lambda",
            TaskKind::Continuation(_) => "continuation",
            TaskKind::Dyn(_) => "dyn",
        };
        f.debug_struct("Task")
            .field("group", &self.group.0)
            .field("kind", &kind)
            .finish()
    }
}
