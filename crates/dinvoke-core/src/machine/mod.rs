//! Controller-side view of worker machines.

mod capacity;

mod remote;
pub use remote::{RemoteMachine, connect_to_machine};

mod spec;
pub use spec::MachineSpec;

use async_trait::async_trait;
use dinvoke_model::{LabelExpr, Outcome, TaskCall};
use tokio_util::sync::CancellationToken;

use crate::{InvokeError, ResultHandle};

/// A worker the controller can hand tasks to.
///
/// Executor counts obey `busy <= total` at all times; [`Machine::available_executors`] is
/// advisory, the authoritative admission decision happens inside [`Machine::invoke_async`].
#[async_trait]
pub trait Machine: Send + Sync + 'static {
    fn name(&self) -> &str;
    fn address(&self) -> &str;
    fn port(&self) -> u16;
    fn labels(&self) -> &LabelExpr;

    fn total_executors(&self) -> u32;
    fn busy_executors(&self) -> u32;

    fn available_executors(&self) -> u32 {
        self.total_executors().saturating_sub(self.busy_executors())
    }

    /// Returns `false` once the machine can no longer accept work.
    fn is_alive(&self) -> bool {
        true
    }

    /// Reserve `weight` executors and send `call`; the reservation is released when the returned
    /// handle completes. Weights `<= 0` count as 1.
    ///
    /// Fails with [`InvokeError::NotEnoughExecutors`] without reserving anything when the weight
    /// does not fit.
    async fn invoke_async(
        &self,
        call: TaskCall,
        weight: i32,
        cancel: &CancellationToken,
    ) -> Result<ResultHandle<Outcome>, InvokeError>;

    /// [`Machine::invoke_async`] followed by waiting for the result.
    async fn invoke(
        &self,
        call: TaskCall,
        weight: i32,
        cancel: &CancellationToken,
    ) -> Result<Outcome, InvokeError> {
        let handle = self.invoke_async(call, weight, cancel).await?;
        handle.wait_for_result(cancel).await
    }
}
