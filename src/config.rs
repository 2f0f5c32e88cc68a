use crate::command_map::{ChannelIndex, CommandMap};
use crate::poll_cycle::ServerControl;
use crate::transport::Transport;
use crate::value_store::ValueStore;
use crate::waveform::ByteOrder;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_RESOURCE: &str = "TCPIP::192.168.1.100::5025::SOCKET";
pub const DEFAULT_PREFIX: &str = "tektronix0:";

/// Startup parameters, fixed for the lifetime of the process.
#[derive(Debug, Clone, PartialEq)]
pub struct ScopeConfig {
    /// Where the instrument is, e.g. `TCPIP::10.0.0.5::5025::SOCKET`.
    pub resource: String,
    pub channels: ChannelIndex,
    /// Prepended to value names by the console.
    pub prefix: String,
    /// Pacing sleep between poll ticks.
    pub poll_interval: Duration,
    /// Cadence of the slow settings refresh.
    pub refresh_interval: Duration,
    pub io_timeout: Duration,
    pub byte_order: ByteOrder,
    /// Divide waveforms by the channel's volts/div.
    pub normalize: bool,
    /// Consecutive identical transport failures tolerated before giving up.
    pub escalation_threshold: u32,
}

impl Default for ScopeConfig {
    fn default() -> Self {
        Self {
            resource: DEFAULT_RESOURCE.to_string(),
            channels: 4,
            prefix: DEFAULT_PREFIX.to_string(),
            poll_interval: Duration::from_millis(100),
            refresh_interval: Duration::from_millis(1000),
            io_timeout: Duration::from_millis(5000),
            byte_order: ByteOrder::Lsb,
            normalize: true,
            escalation_threshold: 2,
        }
    }
}

impl ScopeConfig {
    pub fn with_resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = resource.into();
        self
    }

    pub fn with_channels(mut self, channels: ChannelIndex) -> Self {
        self.channels = channels;
        self
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    pub fn with_io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = timeout;
        self
    }

    pub fn with_byte_order(mut self, order: ByteOrder) -> Self {
        self.byte_order = order;
        self
    }

    pub fn with_normalize(mut self, normalize: bool) -> Self {
        self.normalize = normalize;
        self
    }

    pub fn with_escalation_threshold(mut self, threshold: u32) -> Self {
        self.escalation_threshold = threshold.max(1);
        self
    }
}

/// Everything the components share: one instrument session, the value store,
/// the command table and the run-state switch.
#[derive(Clone)]
pub struct ScopeContext {
    pub transport: Arc<Transport>,
    pub store: Arc<dyn ValueStore>,
    pub commands: Arc<CommandMap>,
    pub control: Arc<ServerControl>,
    pub config: Arc<ScopeConfig>,
}

impl std::fmt::Debug for ScopeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopeContext")
            .field("resource", &self.config.resource)
            .field("channels", &self.commands.channels())
            .field("state", &self.control.state())
            .finish_non_exhaustive()
    }
}
