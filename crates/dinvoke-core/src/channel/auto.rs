//! Message channel over a TCP stream that reopens itself when the stream breaks.
//!
//! Records are single-line compact JSON documents terminated by `\n`.
//! Reads and writes are serialized by two independent per-channel locks, so one reader and one
//! writer may be active at the same time. The current socket lives in a slot guarded by its own
//! lock; every operation re-reads it, and a generation number keeps a stale failure from tearing
//! down a socket that was already replaced.

use std::future::Future;
use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::{ChannelConfig, InvokeError, MetricsHandle, metrics};

/// Strategy for obtaining a fresh connected socket.
///
/// Controllers dial a known address; workers wait on an accept socket.
#[async_trait]
pub trait Reconnect: Send + Sync + 'static {
    /// Produce a new connected stream. Called only while the channel holds no socket.
    async fn reconnect(&self) -> io::Result<TcpStream>;

    /// Human-readable description of the remote end, for logs and metrics.
    fn peer(&self) -> String;

    /// Release connector resources (e.g. an accept socket). Called once by [`AutoReconnectingChannel::close`].
    async fn shutdown(&self) {}
}

struct Socket {
    generation: u64,
    reader: Mutex<BufReader<OwnedReadHalf>>,
    writer: Mutex<OwnedWriteHalf>,
}

impl Socket {
    fn new(stream: TcpStream, generation: u64) -> Self {
        let _ = stream.set_nodelay(true);
        let (r, w) = stream.into_split();
        Self {
            generation,
            reader: Mutex::new(BufReader::new(r)),
            writer: Mutex::new(w),
        }
    }
}

#[derive(Default)]
struct Slot {
    current: Option<Arc<Socket>>,
    generation: u64,
}

pub struct AutoReconnectingChannel<R> {
    name: String,
    connector: R,
    slot: Mutex<Slot>,
    write_lock: Mutex<()>,
    read_lock: Mutex<()>,
    closed: CancellationToken,
    config: ChannelConfig,
    metrics: MetricsHandle,
}

impl<R: Reconnect> AutoReconnectingChannel<R> {
    pub fn new(name: impl Into<String>, connector: R, config: ChannelConfig) -> Self {
        Self {
            name: name.into(),
            connector,
            slot: Mutex::new(Slot::default()),
            write_lock: Mutex::new(()),
            read_lock: Mutex::new(()),
            closed: CancellationToken::new(),
            config,
            metrics: metrics::noop(),
        }
    }

    pub fn with_metrics(mut self, metrics: MetricsHandle) -> Self {
        self.metrics = metrics;
        self
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn connector(&self) -> &R {
        &self.connector
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Try to open the first socket once, without retrying.
    ///
    /// Lets constructors fail fast when the peer is unreachable.
    pub async fn establish(&self) -> Result<(), InvokeError> {
        let mut slot = self.slot.lock().await;
        if slot.current.is_some() {
            return Ok(());
        }
        let stream = self.connector.reconnect().await?;
        self.install(&mut slot, stream);
        Ok(())
    }

    /// Serialize `value` as one line and flush it.
    ///
    /// Broken streams are replaced and the write retried until it succeeds, the channel is closed
    /// ([`InvokeError::Closed`]) or `cancel` fires ([`InvokeError::Interrupted`]).
    pub async fn write_object<T: Serialize + ?Sized>(
        &self,
        value: &T,
        cancel: &CancellationToken,
    ) -> Result<(), InvokeError> {
        let mut line = serde_json::to_vec(value)?;
        line.push(b'\n');

        let _serial = self.guarded(self.write_lock.lock(), cancel).await?;
        loop {
            let sock = self.acquire(cancel).await?;
            let written = self
                .guarded(
                    async {
                        let mut w = sock.writer.lock().await;
                        w.write_all(&line).await?;
                        w.flush().await
                    },
                    cancel,
                )
                .await;

            match written {
                Ok(Ok(())) => {
                    trace!(channel = %self.name, bytes = line.len(), "record written");
                    return Ok(());
                }
                Ok(Err(e)) => {
                    warn!(channel = %self.name, peer = %self.connector.peer(), error = %e, "write failed, reconnecting");
                    self.invalidate(&sock).await;
                    self.pause(cancel).await?;
                }
                Err(e) => {
                    // A write may have been cut short mid-record.
                    self.invalidate(&sock).await;
                    return Err(e);
                }
            }
        }
    }

    /// Read the next record as a JSON value.
    ///
    /// A line that is not JSON is [`InvokeError::ClasspathOutOfSync`]; the stream stays usable.
    /// A line longer than [`ChannelConfig::max_frame_bytes`] is also out of sync, and the stream
    /// is replaced since the rest of it cannot be trusted.
    /// End of stream and I/O errors replace the socket and keep reading.
    pub async fn read_object(&self, cancel: &CancellationToken) -> Result<Value, InvokeError> {
        let limit = self.config.max_frame_bytes;
        let _serial = self.guarded(self.read_lock.lock(), cancel).await?;
        loop {
            let sock = self.acquire(cancel).await?;
            let mut line = Vec::new();
            let read = self
                .guarded(
                    async {
                        let mut r = sock.reader.lock().await;
                        let mut capped = (&mut *r).take((limit as u64).saturating_add(1));
                        capped.read_until(b'\n', &mut line).await
                    },
                    cancel,
                )
                .await;

            match read {
                Ok(Ok(0)) => {
                    debug!(channel = %self.name, peer = %self.connector.peer(), "peer closed the stream");
                    self.invalidate(&sock).await;
                    self.pause(cancel).await?;
                }
                Ok(Ok(n)) if n > limit && line.last() != Some(&b'\n') => {
                    warn!(channel = %self.name, peer = %self.connector.peer(), limit, "oversized record, dropping stream");
                    self.invalidate(&sock).await;
                    return Err(InvokeError::ClasspathOutOfSync(format!(
                        "record exceeds {limit} bytes"
                    )));
                }
                Ok(Ok(_)) => {
                    let record = line.trim_ascii();
                    if record.is_empty() {
                        continue;
                    }
                    return serde_json::from_slice(record)
                        .map_err(|e| InvokeError::ClasspathOutOfSync(e.to_string()));
                }
                Ok(Err(e)) => {
                    warn!(channel = %self.name, peer = %self.connector.peer(), error = %e, "read failed, reconnecting");
                    self.invalidate(&sock).await;
                    self.pause(cancel).await?;
                }
                Err(e) => {
                    // A partially consumed line cannot be resumed.
                    self.invalidate(&sock).await;
                    return Err(e);
                }
            }
        }
    }

    /// Close the channel: abort blocked operations, release the connector and drop the socket.
    pub async fn close(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        self.closed.cancel();
        self.connector.shutdown().await;

        let current = self.slot.lock().await.current.take();
        if let Some(sock) = current {
            let mut w = sock.writer.lock().await;
            let _ = w.shutdown().await;
        }
        info!(channel = %self.name, "channel closed");
    }

    /// Return the current socket, reconnecting (with pauses) until one is available.
    async fn acquire(&self, cancel: &CancellationToken) -> Result<Arc<Socket>, InvokeError> {
        loop {
            let mut slot = self.guarded(self.slot.lock(), cancel).await?;
            if let Some(sock) = &slot.current {
                return Ok(Arc::clone(sock));
            }

            match self.guarded(self.connector.reconnect(), cancel).await? {
                Ok(stream) => return Ok(self.install(&mut slot, stream)),
                Err(e) => {
                    drop(slot);
                    warn!(channel = %self.name, peer = %self.connector.peer(), error = %e, "reconnect failed");
                    self.pause(cancel).await?;
                }
            }
        }
    }

    fn install(&self, slot: &mut Slot, stream: TcpStream) -> Arc<Socket> {
        slot.generation += 1;
        let sock = Arc::new(Socket::new(stream, slot.generation));
        slot.current = Some(Arc::clone(&sock));

        let peer = self.connector.peer();
        self.metrics.reconnected(&peer);
        info!(channel = %self.name, peer = %peer, generation = slot.generation, "connected");
        sock
    }

    /// Forget `failed` if it is still the current socket.
    async fn invalidate(&self, failed: &Socket) {
        let mut slot = tokio::select! {
            biased;
            _ = self.closed.cancelled() => return,
            slot = self.slot.lock() => slot,
        };
        if slot
            .current
            .as_ref()
            .is_some_and(|s| s.generation == failed.generation)
        {
            slot.current = None;
            debug!(channel = %self.name, generation = failed.generation, "socket invalidated");
        }
        drop(slot);

        if let Ok(mut w) = failed.writer.try_lock() {
            let _ = w.shutdown().await;
        }
    }

    async fn pause(&self, cancel: &CancellationToken) -> Result<(), InvokeError> {
        self.guarded(tokio::time::sleep(self.config.retry_delay()), cancel)
            .await
    }

    async fn guarded<F: Future>(
        &self,
        fut: F,
        cancel: &CancellationToken,
    ) -> Result<F::Output, InvokeError> {
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(InvokeError::Closed),
            _ = cancel.cancelled() => Err(InvokeError::Interrupted),
            out = fut => Ok(out),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::time::Duration;

    use serde_json::json;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    use super::*;

    struct Loopback(SocketAddr);

    #[async_trait]
    impl Reconnect for Loopback {
        async fn reconnect(&self) -> io::Result<TcpStream> {
            TcpStream::connect(self.0).await
        }

        fn peer(&self) -> String {
            self.0.to_string()
        }
    }

    fn fast() -> ChannelConfig {
        ChannelConfig {
            retry_delay_ms: 10,
            ..Default::default()
        }
    }

    async fn read_line(stream: &mut BufReader<TcpStream>) -> String {
        let mut line = String::new();
        stream.read_line(&mut line).await.unwrap();
        line
    }

    #[tokio::test]
    async fn writes_one_line_per_record() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let ch = AutoReconnectingChannel::new("t", Loopback(listener.local_addr().unwrap()), fast());
        let cancel = CancellationToken::new();

        ch.write_object(&json!({ "a": "x\ny" }), &cancel).await.unwrap();
        ch.write_object(&json!(2), &cancel).await.unwrap();

        let (stream, _) = listener.accept().await.unwrap();
        let mut stream = BufReader::new(stream);
        assert_eq!(read_line(&mut stream).await, "{\"a\":\"x\\ny\"}\n");
        assert_eq!(read_line(&mut stream).await, "2\n");
    }

    #[tokio::test]
    async fn reads_skip_blank_lines_and_report_garbage() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let ch = AutoReconnectingChannel::new("t", Loopback(listener.local_addr().unwrap()), fast());
        ch.establish().await.unwrap();

        let (mut peer, _) = listener.accept().await.unwrap();
        peer.write_all(b"\n\nnot json\n{\"ok\":1}\n").await.unwrap();

        let cancel = CancellationToken::new();
        let err = ch.read_object(&cancel).await.unwrap_err();
        assert!(matches!(err, InvokeError::ClasspathOutOfSync(_)));
        assert_eq!(ch.read_object(&cancel).await.unwrap(), json!({ "ok": 1 }));
    }

    #[tokio::test]
    async fn oversized_record_replaces_the_stream() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = ChannelConfig {
            max_frame_bytes: 16,
            ..fast()
        };
        let ch = AutoReconnectingChannel::new("t", Loopback(listener.local_addr().unwrap()), config);
        ch.establish().await.unwrap();

        let (mut first, _) = listener.accept().await.unwrap();
        first.write_all(b"[1,2,3]\n").await.unwrap();
        first.write_all(&[b'x'; 64]).await.unwrap();

        let cancel = CancellationToken::new();
        assert_eq!(ch.read_object(&cancel).await.unwrap(), json!([1, 2, 3]));
        let err = ch.read_object(&cancel).await.unwrap_err();
        assert!(matches!(err, InvokeError::ClasspathOutOfSync(_)));

        let reader = tokio::spawn(async move { ch.read_object(&cancel).await });
        let (mut second, _) = listener.accept().await.unwrap();
        second.write_all(b"\"fresh\"\n").await.unwrap();

        let value = tokio::time::timeout(Duration::from_secs(5), reader)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(value, json!("fresh"));
    }

    #[tokio::test]
    async fn reconnects_after_peer_drops() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let ch = AutoReconnectingChannel::new("t", Loopback(listener.local_addr().unwrap()), fast());
        ch.establish().await.unwrap();

        // First connection: peer hangs up immediately.
        let (first, _) = listener.accept().await.unwrap();
        drop(first);

        let cancel = CancellationToken::new();
        let reader = tokio::spawn(async move { ch.read_object(&cancel).await });

        // Two back-to-back reconnects; the second connection carries the record.
        let (second, _) = listener.accept().await.unwrap();
        drop(second);
        let (mut third, _) = listener.accept().await.unwrap();
        third.write_all(b"\"hello\"\n").await.unwrap();

        let value = tokio::time::timeout(Duration::from_secs(5), reader)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(value, json!("hello"));
    }

    #[tokio::test]
    async fn cancelled_read_is_interrupted() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let ch = AutoReconnectingChannel::new("t", Loopback(listener.local_addr().unwrap()), fast());
        ch.establish().await.unwrap();
        let _peer = listener.accept().await.unwrap();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let err = ch.read_object(&cancel).await.unwrap_err();
        assert!(matches!(err, InvokeError::Interrupted));
    }

    #[tokio::test]
    async fn close_aborts_blocked_operations() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let ch = Arc::new(AutoReconnectingChannel::new(
            "t",
            Loopback(listener.local_addr().unwrap()),
            fast(),
        ));
        ch.establish().await.unwrap();
        let _peer = listener.accept().await.unwrap();

        let reader = {
            let ch = Arc::clone(&ch);
            tokio::spawn(async move { ch.read_object(&CancellationToken::new()).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        ch.close().await;

        assert!(matches!(reader.await.unwrap(), Err(InvokeError::Closed)));
        assert!(ch.is_closed());
        let err = ch
            .write_object(&json!(1), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, InvokeError::Closed));
    }
}
