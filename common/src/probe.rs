//! Types shared between a probe transport and its consumers.

use std::{
    net::IpAddr,
    time::{Duration, Instant},
};

use chrono::{DateTime, Local};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Whether a reply was the first one for its sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeKind {
    Received,
    Duplicate,
}

/// One echo reply as observed by the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeEvent {
    pub kind: ProbeKind,
    pub seq: u16,
    /// Size of the ICMP message (header and payload)
    pub bytes: usize,
    pub source: IpAddr,
    pub rtt: Duration,
    pub ttl: u8,
    /// Local wall-clock time at which the reply was read, for display only
    pub observed_at: DateTime<Local>,
    /// Monotonic time at which the reply was read
    pub received_at: Instant,
}

/// Aggregate view of a run, maintained by the transport.
///
/// All RTT fields are zero until the first reply. Duplicates are counted but
/// never folded into the RTT figures.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunningStatistics {
    pub min_rtt: Duration,
    pub avg_rtt: Duration,
    pub max_rtt: Duration,
    pub stddev_rtt: Duration,
    pub sent: u64,
    pub received: u64,
    pub duplicates: u64,
    /// Loss in percent of sent probes
    pub packet_loss: f64,
    pub addr: String,
}

/// Settings fixed for the whole run.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    /// Number of probes to send, `None` for no limit
    pub count: Option<u64>,
    /// Wall-clock limit of the run
    pub timeout: Duration,
    pub interval: Duration,
    /// Payload bytes carried by each echo request
    pub size: usize,
    pub ttl: u32,
    /// DSCP and ECN bits
    pub traffic_class: u8,
    pub interface: Option<String>,
    /// Use a raw socket instead of an unprivileged datagram socket
    pub privileged: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            count: None,
            timeout: Duration::from_secs(100_000),
            interval: Duration::from_secs(1),
            size: 24,
            ttl: 64,
            traffic_class: 192,
            interface: None,
            privileged: false,
        }
    }
}

/// Reasons a transport refuses to start.
#[derive(Debug, Error)]
pub enum InitError {
    #[error("cannot resolve `{host}`: {reason}")]
    Resolve { host: String, reason: String },

    #[error("insufficient privilege for {mode} socket: {source}")]
    Permission {
        mode: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("interface `{name}`: {reason}")]
    Interface { name: String, reason: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// The host as given by the user and the address actually probed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub host: String,
    pub ip: IpAddr,
}

/// Finite stream of probe events. Ends when the transport stops, for
/// whatever reason; it cannot be restarted.
#[derive(Debug)]
pub struct EventStream {
    pub destination: Destination,
    events: mpsc::Receiver<ProbeEvent>,
}

impl EventStream {
    pub fn new(
        destination: Destination,
        events: mpsc::Receiver<ProbeEvent>,
    ) -> Self {
        Self {
            destination,
            events,
        }
    }

    pub async fn next(&mut self) -> Option<ProbeEvent> {
        self.events.recv().await
    }
}

/// Something that sends probes and reports replies.
pub trait Transport {
    /// Begins probing. Cancelling `stop` asks the transport to end the
    /// stream; cancelling twice is the same as cancelling once.
    fn start(
        &mut self,
        config: &SessionConfig,
        stop: CancellationToken,
    ) -> Result<EventStream, InitError>;

    /// Latest aggregate statistics. Valid during and after the run.
    fn statistics(&self) -> RunningStatistics;
}
