use common::Logging;

use crate::classify::{GapVerdict, RttVerdict};

/// One CSV row per reply.
#[derive(Debug, Logging, Clone)]
pub struct ProbeRecord {
    pub timestamp: String,
    /// Seconds since the previous reply, 0 for the first one
    pub gap_s: f64,
    pub gap: GapVerdict,
    pub size: usize,
    pub src_addr: String,
    pub seq: u16,
    pub rtt_ms: f64,
    pub rtt: RttVerdict,
    pub ttl: u8,
    pub duplicate: bool,
}

/// Final statistics as a single CSV row.
#[derive(Debug, Logging, Clone, Default)]
pub struct SummaryRecord {
    pub dst_addr: String,
    pub sent: u64,
    pub received: u64,
    pub duplicates: u64,
    pub packet_loss: f64,
    pub min_ms: f64,
    pub avg_ms: f64,
    pub max_ms: f64,
    pub stddev_ms: f64,
}
