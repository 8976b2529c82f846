use std::sync::Arc;

use dinvoke_model::QueuedTask;

use crate::Machine;

/// Checked on enqueue. A queue with several admission rules accepts a task if any rule does.
pub trait AdmissionRule: Send + Sync + 'static {
    fn check(&self, task: &QueuedTask) -> bool;
}

impl<F> AdmissionRule for F
where
    F: Fn(&QueuedTask) -> bool + Send + Sync + 'static,
{
    fn check(&self, task: &QueuedTask) -> bool {
        self(task)
    }
}

/// Checked per (machine, task) pair when dispatching.
pub trait DispatchRule: Send + Sync + 'static {
    fn check(&self, task: &QueuedTask, machine: &dyn Machine) -> bool;
}

impl<F> DispatchRule for F
where
    F: Fn(&QueuedTask, &dyn Machine) -> bool + Send + Sync + 'static,
{
    fn check(&self, task: &QueuedTask, machine: &dyn Machine) -> bool {
        self(task, machine)
    }
}

/// Machine is alive and has room for the task's weight right now.
#[derive(Debug, Default, Clone, Copy)]
pub struct CapacityRule;

impl DispatchRule for CapacityRule {
    fn check(&self, task: &QueuedTask, machine: &dyn Machine) -> bool {
        machine.is_alive() && machine.available_executors() >= task.weight()
    }
}

/// Task label, if any, satisfies the machine's label expression.
#[derive(Debug, Default, Clone, Copy)]
pub struct LabelRule;

impl DispatchRule for LabelRule {
    fn check(&self, task: &QueuedTask, machine: &dyn Machine) -> bool {
        task.label
            .as_deref()
            .is_none_or(|label| machine.labels().matches(label))
    }
}

/// Conjunction of dispatch rules. Empty accepts everything.
#[derive(Default, Clone)]
pub struct AllOf(Vec<Arc<dyn DispatchRule>>);

impl AllOf {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, rule: impl DispatchRule) -> Self {
        self.0.push(Arc::new(rule));
        self
    }
}

impl DispatchRule for AllOf {
    fn check(&self, task: &QueuedTask, machine: &dyn Machine) -> bool {
        self.0.iter().all(|rule| rule.check(task, machine))
    }
}
