use std::collections::HashMap;
use std::io;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use dinvoke_model::{CorrelationId, Frame, ModelError, Outcome, Payload, TaskCall};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::{AutoReconnectingChannel, InvokeError, Reconnect, ResultHandle, RuntimeContext};

/// Outbound connector: opens a fresh TCP connection to a fixed address.
pub struct Dial {
    host: String,
    port: u16,
}

impl Dial {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

#[async_trait]
impl Reconnect for Dial {
    async fn reconnect(&self) -> io::Result<TcpStream> {
        TcpStream::connect((self.host.as_str(), self.port)).await
    }

    fn peer(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

type Pending = HashMap<CorrelationId, ResultHandle<Outcome>>;

/// Controller end of the fabric: sends task calls and routes replies to their result handles.
pub struct ControllerChannel {
    channel: AutoReconnectingChannel<Dial>,
    pending: Mutex<Pending>,
}

impl ControllerChannel {
    /// Open the channel. The first connection attempt is not retried so a bad address fails here.
    pub async fn connect(
        name: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        ctx: &RuntimeContext,
    ) -> Result<Self, InvokeError> {
        let channel = AutoReconnectingChannel::new(name, Dial::new(host, port), ctx.channel.clone())
            .with_metrics(ctx.metrics.clone());
        channel.establish().await?;

        Ok(Self {
            channel,
            pending: Mutex::new(HashMap::new()),
        })
    }

    #[inline]
    pub fn name(&self) -> &str {
        self.channel.name()
    }

    pub fn peer(&self) -> String {
        self.channel.connector().peer()
    }

    /// Send `call` in a fresh frame and return the handle its reply will complete.
    ///
    /// The handle is registered before the frame hits the wire, so even an immediate reply finds it.
    /// If the write fails or is cancelled the registration is rolled back.
    pub async fn write_request(
        &self,
        call: TaskCall,
        cancel: &CancellationToken,
    ) -> Result<ResultHandle<Outcome>, InvokeError> {
        let frame = Frame::wrap(Payload::Call(call));
        let handle = ResultHandle::for_request(frame.id().clone());

        let registration = Registration::insert(self, frame.id().clone(), handle.clone());
        self.channel.write_object(&frame, cancel).await?;
        registration.keep();

        debug!(channel = %self.name(), id = %frame.id(), "request sent");
        Ok(handle)
    }

    /// Read one reply and complete the matching handle.
    ///
    /// Replies for unknown ids are logged and dropped. A frame the controller cannot use yields
    /// [`InvokeError::UnexpectedResult`] or [`InvokeError::ClasspathOutOfSync`]; both are recoverable.
    pub async fn read_response(&self, cancel: &CancellationToken) -> Result<(), InvokeError> {
        let value = self.channel.read_object(cancel).await?;

        let frame = match Frame::decode(value) {
            Ok(frame) => frame,
            Err(ModelError::UnknownPayload { id, reason }) => {
                if let Some(handle) = self.take(&id) {
                    let _ = handle.set_result(Outcome::Err(format!("undecodable reply: {reason}")));
                }
                return Err(InvokeError::ClasspathOutOfSync(format!("frame {id}: {reason}")));
            }
            Err(e) => return Err(e.into()),
        };

        let (id, payload) = frame.into_parts();
        let outcome = match payload {
            Payload::Result(outcome) => outcome,
            Payload::Error(e) => Outcome::Err(e.message),
            Payload::Call(call) => {
                return Err(InvokeError::UnexpectedResult(format!(
                    "frame {id} carries a `{}` call, controllers only accept replies",
                    call.kind
                )));
            }
        };

        match self.take(&id) {
            Some(handle) => {
                trace!(channel = %self.name(), id = %id, ok = outcome.is_ok(), "reply routed");
                handle.set_result(outcome)?;
            }
            None => warn!(channel = %self.name(), id = %id, "reply for unknown request dropped"),
        }
        Ok(())
    }

    /// Complete every outstanding handle with `Outcome::Err(reason)`. Returns how many were drained.
    pub fn drain_pending(&self, reason: &str) -> usize {
        let drained: Vec<_> = self.lock().drain().collect();
        let count = drained.len();
        for (_, handle) in drained {
            let _ = handle.set_result(Outcome::Err(reason.to_string()));
        }
        count
    }

    pub fn pending_len(&self) -> usize {
        self.lock().len()
    }

    pub async fn close(&self) {
        self.channel.close().await;
    }

    pub fn is_closed(&self) -> bool {
        self.channel.is_closed()
    }

    fn take(&self, id: &CorrelationId) -> Option<ResultHandle<Outcome>> {
        self.lock().remove(id)
    }

    fn lock(&self) -> MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Pending-table entry that removes itself unless [`Registration::keep`] is called.
struct Registration<'a> {
    owner: &'a ControllerChannel,
    id: Option<CorrelationId>,
}

impl<'a> Registration<'a> {
    fn insert(owner: &'a ControllerChannel, id: CorrelationId, handle: ResultHandle<Outcome>) -> Self {
        owner.lock().insert(id.clone(), handle);
        Self { owner, id: Some(id) }
    }

    fn keep(mut self) {
        self.id = None;
    }
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        if let Some(id) = self.id.take() {
            self.owner.take(&id);
        }
    }
}
