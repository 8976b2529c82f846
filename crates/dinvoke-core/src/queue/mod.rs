//! Controller-side task queue.
//!
//! Tasks are kept in FIFO order. Each walk of the queue asks [`TaskQueue::select_machine`] for a
//! target and hands the task over with [`Machine::invoke_async`]; the returned handle is watched
//! only for logging.
//!
//! ## Rules
//! - Admission: no rules accepts every task, otherwise at least one rule must accept.
//! - Dispatch: no rules picks the first machine, otherwise the first `(machine, rule)` pair
//!   (machines outer, rules inner) whose rule accepts wins.
//!
//! ## Rejections
//! A machine answering [`InvokeError::NotEnoughExecutors`] is handled per
//! [`crate::RejectionPolicy`]: dropped (default) or left in place for the next walk.

mod rules;
pub use rules::{AdmissionRule, AllOf, CapacityRule, DispatchRule, LabelRule};

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use dinvoke_model::{Outcome, QueuedTask};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{InvokeError, Machine, MetricsHandle, QueueConfig, RejectionPolicy, metrics};

/// Counters for a single walk of the queue.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchReport {
    /// Tasks handed to a machine.
    pub dispatched: usize,
    /// Tasks refused with `NotEnoughExecutors`.
    pub rejected: usize,
    /// Tasks dropped after any other invoke error.
    pub failed: usize,
    /// Tasks left in the queue afterwards.
    pub pending: usize,
}

pub struct TaskQueue {
    tasks: Mutex<VecDeque<QueuedTask>>,
    machines: RwLock<Vec<Arc<dyn Machine>>>,
    admission: Vec<Arc<dyn AdmissionRule>>,
    dispatch: Vec<Arc<dyn DispatchRule>>,
    config: QueueConfig,
    metrics: MetricsHandle,
    wake: Notify,
    walk: tokio::sync::Mutex<()>,
}

impl TaskQueue {
    pub fn builder() -> TaskQueueBuilder {
        TaskQueueBuilder::default()
    }

    /// Append `task` if the admission rules accept it. Returns whether it was queued.
    pub fn enqueue(&self, task: QueuedTask) -> bool {
        if !self.admission.is_empty() && !self.admission.iter().any(|rule| rule.check(&task)) {
            debug!(task = %task.id, kind = %task.call.kind, "task refused by admission rules");
            return false;
        }

        let depth = {
            let mut tasks = self.lock();
            tasks.push_back(task);
            tasks.len()
        };
        self.metrics.queue_depth(depth);
        self.wake.notify_one();
        true
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Copy of the queued tasks, front first.
    pub fn snapshot(&self) -> Vec<QueuedTask> {
        self.lock().iter().cloned().collect()
    }

    pub fn add_machine(&self, machine: Arc<dyn Machine>) {
        info!(machine = %machine.name(), "machine added to queue");
        self.machines
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(machine);
    }

    /// Remove every machine called `name`. Returns whether one was found.
    pub fn remove_machine(&self, name: &str) -> bool {
        let mut machines = self.machines.write().unwrap_or_else(PoisonError::into_inner);
        let before = machines.len();
        machines.retain(|m| m.name() != name);
        before != machines.len()
    }

    pub fn machines(&self) -> Vec<Arc<dyn Machine>> {
        self.machines
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Pick the machine `task` should go to, if any.
    pub fn select_machine(&self, task: &QueuedTask) -> Option<Arc<dyn Machine>> {
        let machines = self.machines.read().unwrap_or_else(PoisonError::into_inner);
        if self.dispatch.is_empty() {
            return machines.first().cloned();
        }

        for machine in machines.iter() {
            if self.dispatch.iter().any(|rule| rule.check(task, machine.as_ref())) {
                return Some(Arc::clone(machine));
            }
        }
        None
    }

    /// Walk the queue once, dispatching whatever can be dispatched.
    ///
    /// Tasks stay queued until they are handed over or dropped, so [`TaskQueue::len`] and
    /// [`TaskQueue::snapshot`] include the task currently being dispatched. Undispatched tasks keep
    /// their place. Walks are serialized. Cancellation leaves every remaining task queued and
    /// returns [`InvokeError::Interrupted`].
    pub async fn tick(&self, cancel: &CancellationToken) -> Result<DispatchReport, InvokeError> {
        let _walk = self.walk.lock().await;
        let mut report = DispatchReport::default();

        for task in self.snapshot() {
            let Some(machine) = self.select_machine(&task) else {
                continue;
            };

            let weight = i32::try_from(task.weight()).unwrap_or(i32::MAX);
            match machine.invoke_async(task.call.clone(), weight, cancel).await {
                Ok(handle) => {
                    self.remove(&task);
                    report.dispatched += 1;
                    self.metrics.task_dispatched(machine.name());
                    debug!(task = %task.id, kind = %task.call.kind, machine = %machine.name(), "task dispatched");

                    let (id, name) = (task.id, machine.name().to_string());
                    handle.register_callback(move |outcome: &Outcome| match outcome {
                        Outcome::Ok(_) => debug!(task = %id, machine = %name, "queued task completed"),
                        Outcome::Err(e) => warn!(task = %id, machine = %name, error = %e, "queued task failed"),
                    });
                }
                Err(InvokeError::NotEnoughExecutors { available, .. }) => {
                    report.rejected += 1;
                    warn!(
                        task = %task.id,
                        machine = %machine.name(),
                        weight = task.weight(),
                        available,
                        policy = ?self.config.on_rejected,
                        "not enough executors"
                    );
                    if self.config.on_rejected == RejectionPolicy::Drop {
                        self.remove(&task);
                    }
                }
                Err(InvokeError::Interrupted) => {
                    self.metrics.queue_depth(self.len());
                    return Err(InvokeError::Interrupted);
                }
                Err(e) => {
                    self.remove(&task);
                    report.failed += 1;
                    error!(task = %task.id, machine = %machine.name(), error = %e, "dispatch failed, task dropped");
                }
            }
        }

        report.pending = self.len();
        self.metrics.queue_depth(report.pending);
        Ok(report)
    }

    /// Dispatch loop. Returns when `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            machines = self.machines().len(),
            idle_ms = self.config.idle_interval_ms,
            "task queue started"
        );

        while !cancel.is_cancelled() {
            if self.is_empty() {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = self.wake.notified() => {}
                    _ = tokio::time::sleep(self.config.idle_interval()) => {}
                }
                continue;
            }

            match self.tick(&cancel).await {
                Ok(report) if report.dispatched == 0 && report.pending > 0 => {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.config.busy_pause()) => {}
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    debug!(error = %e, "dispatch interrupted");
                    break;
                }
            }
        }

        info!(pending = self.len(), "task queue stopped");
    }

    fn remove(&self, task: &QueuedTask) {
        let mut tasks = self.lock();
        if let Some(pos) = tasks.iter().position(|t| t.id == task.id) {
            tasks.remove(pos);
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<QueuedTask>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Default)]
pub struct TaskQueueBuilder {
    machines: Vec<Arc<dyn Machine>>,
    admission: Vec<Arc<dyn AdmissionRule>>,
    dispatch: Vec<Arc<dyn DispatchRule>>,
    config: QueueConfig,
    metrics: Option<MetricsHandle>,
}

impl TaskQueueBuilder {
    pub fn machine(mut self, machine: Arc<dyn Machine>) -> Self {
        self.machines.push(machine);
        self
    }

    pub fn machines(mut self, machines: impl IntoIterator<Item = Arc<dyn Machine>>) -> Self {
        self.machines.extend(machines);
        self
    }

    pub fn admission_rule(mut self, rule: impl AdmissionRule) -> Self {
        self.admission.push(Arc::new(rule));
        self
    }

    /// Closure form of [`TaskQueueBuilder::admission_rule`].
    pub fn admit_if<F>(self, rule: F) -> Self
    where
        F: Fn(&QueuedTask) -> bool + Send + Sync + 'static,
    {
        self.admission_rule(rule)
    }

    pub fn dispatch_rule(mut self, rule: impl DispatchRule) -> Self {
        self.dispatch.push(Arc::new(rule));
        self
    }

    /// Closure form of [`TaskQueueBuilder::dispatch_rule`].
    pub fn dispatch_if<F>(self, rule: F) -> Self
    where
        F: Fn(&QueuedTask, &dyn Machine) -> bool + Send + Sync + 'static,
    {
        self.dispatch_rule(rule)
    }

    pub fn config(mut self, config: QueueConfig) -> Self {
        self.config = config;
        self
    }

    pub fn metrics(mut self, metrics: MetricsHandle) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn build(self) -> Result<TaskQueue, InvokeError> {
        self.config.validate()?;
        Ok(TaskQueue {
            tasks: Mutex::new(VecDeque::new()),
            machines: RwLock::new(self.machines),
            admission: self.admission,
            dispatch: self.dispatch,
            config: self.config,
            metrics: self.metrics.unwrap_or_else(metrics::noop),
            wake: Notify::new(),
            walk: tokio::sync::Mutex::new(()),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use dinvoke_model::{LabelExpr, TaskCall};
    use serde_json::json;

    use super::*;
    use crate::ResultHandle;

    /// In-process machine that records calls and never answers unless told to.
    struct FakeMachine {
        name: String,
        labels: LabelExpr,
        total: u32,
        busy: AtomicU32,
        calls: Mutex<Vec<TaskCall>>,
        interrupt: bool,
        gate: Option<Arc<Notify>>,
    }

    impl FakeMachine {
        fn new(name: &str, total: u32, labels: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.into(),
                labels: LabelExpr::parse(labels),
                total,
                busy: AtomicU32::new(0),
                calls: Mutex::new(Vec::new()),
                interrupt: false,
                gate: None,
            })
        }

        /// Each invocation waits for one `notify_one` on `gate`.
        fn gated(name: &str, gate: Arc<Notify>) -> Arc<Self> {
            Arc::new(Self {
                name: name.into(),
                labels: LabelExpr::default(),
                total: 10,
                busy: AtomicU32::new(0),
                calls: Mutex::new(Vec::new()),
                interrupt: false,
                gate: Some(gate),
            })
        }

        fn interrupting(name: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.into(),
                labels: LabelExpr::default(),
                total: 10,
                busy: AtomicU32::new(0),
                calls: Mutex::new(Vec::new()),
                interrupt: true,
                gate: None,
            })
        }

        fn kinds(&self) -> Vec<String> {
            self.calls.lock().unwrap().iter().map(|c| c.kind.clone()).collect()
        }
    }

    #[async_trait]
    impl Machine for FakeMachine {
        fn name(&self) -> &str {
            &self.name
        }
        fn address(&self) -> &str {
            "fake"
        }
        fn port(&self) -> u16 {
            1
        }
        fn labels(&self) -> &LabelExpr {
            &self.labels
        }
        fn total_executors(&self) -> u32 {
            self.total
        }
        fn busy_executors(&self) -> u32 {
            self.busy.load(Ordering::SeqCst)
        }

        async fn invoke_async(
            &self,
            call: TaskCall,
            weight: i32,
            _cancel: &CancellationToken,
        ) -> Result<ResultHandle<Outcome>, InvokeError> {
            if self.interrupt {
                return Err(InvokeError::Interrupted);
            }
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            let weight = dinvoke_model::normalize_weight(weight);
            let available = self.available_executors();
            if weight > available {
                return Err(InvokeError::NotEnoughExecutors {
                    machine: self.name.clone(),
                    requested: weight,
                    available,
                });
            }
            self.busy.fetch_add(weight, Ordering::SeqCst);
            self.calls.lock().unwrap().push(call);
            Ok(ResultHandle::new())
        }
    }

    fn task(kind: &str) -> QueuedTask {
        QueuedTask::new(TaskCall::new(kind, json!(null)))
    }

    fn kinds(queue: &TaskQueue) -> Vec<String> {
        queue.snapshot().into_iter().map(|t| t.call.kind).collect()
    }

    #[test]
    fn admission_is_any_of() {
        let open = TaskQueue::builder().build().unwrap();
        assert!(open.enqueue(task("a")));

        let guarded = TaskQueue::builder()
            .admit_if(|t: &QueuedTask| t.call.kind == "a")
            .admit_if(|t: &QueuedTask| t.weight() > 2)
            .build()
            .unwrap();
        assert!(guarded.enqueue(task("a")));
        assert!(guarded.enqueue(task("b").with_weight(3)));
        assert!(!guarded.enqueue(task("b")));
        assert_eq!(guarded.len(), 2);
    }

    #[test]
    fn select_first_machine_without_rules() {
        let empty = TaskQueue::builder().build().unwrap();
        assert!(empty.select_machine(&task("a")).is_none());

        let q = TaskQueue::builder()
            .machine(FakeMachine::new("m1", 0, ""))
            .machine(FakeMachine::new("m2", 4, ""))
            .build()
            .unwrap();
        assert_eq!(q.select_machine(&task("a")).unwrap().name(), "m1");
    }

    #[test]
    fn select_scans_machines_then_rules() {
        let q = TaskQueue::builder()
            .machine(FakeMachine::new("small", 1, "linux"))
            .machine(FakeMachine::new("gpu", 8, "gpu !arm"))
            .dispatch_rule(AllOf::new().with(CapacityRule).with(LabelRule))
            .build()
            .unwrap();

        assert_eq!(q.select_machine(&task("a")).unwrap().name(), "small");
        assert_eq!(q.select_machine(&task("a").with_weight(4)).unwrap().name(), "gpu");
        assert_eq!(q.select_machine(&task("a").with_label("gpu")).unwrap().name(), "gpu");
        assert!(q.select_machine(&task("a").with_label("arm")).is_none());
        assert!(q.select_machine(&task("a").with_weight(9)).is_none());
    }

    #[tokio::test]
    async fn tick_dispatches_in_order() {
        let m = FakeMachine::new("m", 3, "");
        let q = TaskQueue::builder()
            .machine(m.clone())
            .dispatch_rule(CapacityRule)
            .build()
            .unwrap();

        for kind in ["a", "b", "c", "d"] {
            q.enqueue(task(kind));
        }

        let report = q.tick(&CancellationToken::new()).await.unwrap();
        assert_eq!(
            report,
            DispatchReport { dispatched: 3, rejected: 0, failed: 0, pending: 1 }
        );
        assert_eq!(m.kinds(), vec!["a", "b", "c"]);
        assert_eq!(kinds(&q), vec!["d"]);
    }

    #[tokio::test]
    async fn rejected_tasks_follow_policy() {
        let drop_q = TaskQueue::builder()
            .machine(FakeMachine::new("m", 1, ""))
            .build()
            .unwrap();
        drop_q.enqueue(task("heavy").with_weight(5));
        drop_q.enqueue(task("light"));

        let report = drop_q.tick(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.rejected, 1);
        assert_eq!(report.dispatched, 1);
        assert!(drop_q.is_empty());

        let requeue_q = TaskQueue::builder()
            .machine(FakeMachine::new("m", 1, ""))
            .config(QueueConfig {
                on_rejected: RejectionPolicy::Requeue,
                ..Default::default()
            })
            .build()
            .unwrap();
        requeue_q.enqueue(task("heavy").with_weight(5));
        requeue_q.enqueue(task("light"));

        let report = requeue_q.tick(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.rejected, 1);
        assert_eq!(report.pending, 1);
        assert_eq!(kinds(&requeue_q), vec!["heavy"]);
    }

    #[tokio::test]
    async fn interrupted_tick_keeps_tasks() {
        let q = TaskQueue::builder()
            .machine(FakeMachine::interrupting("m"))
            .build()
            .unwrap();
        q.enqueue(task("a"));
        q.enqueue(task("b"));

        let err = q.tick(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, InvokeError::Interrupted));
        assert_eq!(kinds(&q), vec!["a", "b"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn tasks_stay_visible_while_dispatching() {
        let gate = Arc::new(Notify::new());
        let m = FakeMachine::gated("m", Arc::clone(&gate));
        let q = Arc::new(TaskQueue::builder().machine(m.clone()).build().unwrap());
        q.enqueue(task("a"));
        q.enqueue(task("b"));

        let ticking = {
            let q = Arc::clone(&q);
            tokio::spawn(async move { q.tick(&CancellationToken::new()).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(q.len(), 2);
        assert_eq!(kinds(&q), vec!["a", "b"]);

        gate.notify_one();
        tokio::time::timeout(Duration::from_secs(2), async {
            while q.len() != 1 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(kinds(&q), vec!["b"]);
        assert_eq!(m.kinds(), vec!["a"]);

        gate.notify_one();
        let report = tokio::time::timeout(Duration::from_secs(2), ticking)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(report.dispatched, 2);
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn run_wakes_on_enqueue_and_stops_on_cancel() {
        let m = FakeMachine::new("m", 4, "");
        let q = Arc::new(
            TaskQueue::builder()
                .machine(m.clone())
                .config(QueueConfig {
                    idle_interval_ms: 60_000,
                    ..Default::default()
                })
                .build()
                .unwrap(),
        );

        let cancel = CancellationToken::new();
        let runner = {
            let q = Arc::clone(&q);
            let cancel = cancel.clone();
            tokio::spawn(async move { q.run(cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        q.enqueue(task("a"));

        tokio::time::timeout(Duration::from_secs(2), async {
            while m.kinds().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), runner)
            .await
            .unwrap()
            .unwrap();
        assert!(q.is_empty());
    }

    #[test]
    fn machines_can_be_added_and_removed() {
        let q = TaskQueue::builder().build().unwrap();
        q.add_machine(FakeMachine::new("m1", 1, ""));
        q.add_machine(FakeMachine::new("m2", 1, ""));
        assert!(q.remove_machine("m1"));
        assert!(!q.remove_machine("m1"));
        assert_eq!(q.machines().len(), 1);
    }
}
