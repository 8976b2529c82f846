use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use dinvoke_core::{AutoReconnectingChannel, ChannelConfig, InvokeError, MetricsHandle, Reconnect};
use dinvoke_model::{Frame, Payload};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Inbound connector: waits on an accept socket for the next controller.
pub struct Accept {
    listener: Mutex<Option<TcpListener>>,
    local_addr: SocketAddr,
}

impl Accept {
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener: Mutex::new(Some(listener)),
            local_addr,
        })
    }

    #[inline]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

#[async_trait]
impl Reconnect for Accept {
    async fn reconnect(&self) -> io::Result<TcpStream> {
        let listener = self.listener.lock().await;
        let Some(listener) = listener.as_ref() else {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "accept socket closed"));
        };

        let (stream, peer) = listener.accept().await?;
        info!(addr = %self.local_addr, peer = %peer, "controller connected");
        Ok(stream)
    }

    fn peer(&self) -> String {
        format!("accept:{}", self.local_addr)
    }

    async fn shutdown(&self) {
        self.listener.lock().await.take();
    }
}

/// Worker end of the fabric. Serves one controller connection at a time.
///
/// Until a controller connects every read and write waits inside the accept.
pub struct WorkerChannel {
    channel: AutoReconnectingChannel<Accept>,
    closed: AtomicBool,
}

impl WorkerChannel {
    pub async fn bind(
        addr: SocketAddr,
        config: ChannelConfig,
        metrics: MetricsHandle,
    ) -> Result<Self, InvokeError> {
        let accept = Accept::bind(addr).await?;
        let name = format!("worker@{}", accept.local_addr());
        Ok(Self {
            channel: AutoReconnectingChannel::new(name, accept, config).with_metrics(metrics),
            closed: AtomicBool::new(false),
        })
    }

    #[inline]
    pub fn local_addr(&self) -> SocketAddr {
        self.channel.connector().local_addr()
    }

    #[inline]
    pub fn name(&self) -> &str {
        self.channel.name()
    }

    pub async fn read_value(&self, cancel: &CancellationToken) -> Result<Value, InvokeError> {
        self.channel.read_object(cancel).await
    }

    pub async fn write_frame(
        &self,
        frame: &Frame<Payload>,
        cancel: &CancellationToken,
    ) -> Result<(), InvokeError> {
        self.channel.write_object(frame, cancel).await
    }

    /// Close the client and accept sockets. Closing twice is a bug and fails.
    pub async fn close(&self) -> Result<(), InvokeError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(InvokeError::IllegalState(format!(
                "{} closed twice",
                self.channel.name()
            )));
        }
        self.channel.close().await;
        Ok(())
    }
}
