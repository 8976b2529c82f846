use crate::{ChannelConfig, MetricsHandle, metrics};

/// Shared runtime dependencies injected into machines, queues and listeners.
#[derive(Clone)]
pub struct RuntimeContext {
    pub channel: ChannelConfig,
    pub metrics: MetricsHandle,
}

impl RuntimeContext {
    pub fn new(channel: ChannelConfig, metrics: MetricsHandle) -> Self {
        Self { channel, metrics }
    }

    #[inline]
    pub fn with_channel(mut self, channel: ChannelConfig) -> Self {
        self.channel = channel;
        self
    }

    #[inline]
    pub fn with_metrics(mut self, metrics: MetricsHandle) -> Self {
        self.metrics = metrics;
        self
    }
}

impl Default for RuntimeContext {
    fn default() -> Self {
        Self {
            channel: ChannelConfig::default(),
            metrics: metrics::noop(),
        }
    }
}

impl std::fmt::Debug for RuntimeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeContext")
            .field("channel", &self.channel)
            .finish_non_exhaustive()
    }
}
