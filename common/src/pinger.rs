//! ICMPv4 echo transport.

use std::{
    collections::{HashMap, HashSet},
    io,
    net::{IpAddr, ToSocketAddrs},
    sync::Arc,
    time::{Duration, Instant},
};

use chrono::Local;
use etherparse::{IcmpEchoHeader, Icmpv4Header, Icmpv4Type, Ipv4HeaderSlice};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::{
    probe::{
        Destination, EventStream, InitError, ProbeEvent, ProbeKind,
        RunningStatistics, SessionConfig, Transport,
    },
    socket::{interface_to_ipaddr, AsyncICMPSocket, ICMPSocket},
    Statistics,
};

const ICMP_HEADER_SIZE: usize = 8;
/// Largest ICMP payload that fits in one IPv4 datagram
pub const MAX_PAYLOAD_SIZE: usize = 65_507;
const RECV_BUFFER_SIZE: usize = 65_536;
const EVENT_BACKLOG: usize = 64;
/// Receive errors in a row after which the socket is considered dead
const MAX_CONSECUTIVE_ERRORS: u32 = 16;

/// Sends ICMP echo requests to one host and reports the replies.
pub struct Pinger {
    host: String,
    tracker: Arc<RwLock<Tracker>>,
}

impl Pinger {
    pub fn new(host: impl Into<String>) -> Self {
        let host = host.into();
        Self {
            tracker: Arc::new(RwLock::new(Tracker::new(host.clone()))),
            host,
        }
    }
}

impl Transport for Pinger {
    fn start(
        &mut self,
        config: &SessionConfig,
        stop: CancellationToken,
    ) -> Result<EventStream, InitError> {
        validate(config)?;
        let ip = resolve(&self.host)?;
        let socket = open_socket(config, ip)?;
        *self.tracker.write() = Tracker::new(self.host.clone());

        let (events, rx) = mpsc::channel(EVENT_BACKLOG);
        let probe_loop = ProbeLoop {
            socket,
            config: config.clone(),
            identifier: rand::random::<u16>(),
            destination: ip,
            tracker: Arc::clone(&self.tracker),
            events,
            stop,
        };
        debug!(host = %self.host, %ip, "starting probe loop");
        tokio::spawn(probe_loop.run());

        Ok(EventStream::new(
            Destination {
                host: self.host.clone(),
                ip,
            },
            rx,
        ))
    }

    fn statistics(&self) -> RunningStatistics {
        self.tracker.read().snapshot()
    }
}

fn validate(config: &SessionConfig) -> Result<(), InitError> {
    if config.interval.is_zero() {
        return Err(InitError::InvalidConfig(
            "interval must be greater than zero".to_string(),
        ));
    }
    if config.size > MAX_PAYLOAD_SIZE {
        return Err(InitError::InvalidConfig(format!(
            "payload size {} exceeds {} bytes",
            config.size, MAX_PAYLOAD_SIZE
        )));
    }
    if config.ttl == 0 || config.ttl > 255 {
        return Err(InitError::InvalidConfig(format!(
            "ttl {} is outside 1..=255",
            config.ttl
        )));
    }
    Ok(())
}

/// Picks the first IPv4 address of `host`.
fn resolve(host: &str) -> Result<IpAddr, InitError> {
    let unresolved = |reason: String| InitError::Resolve {
        host: host.to_string(),
        reason,
    };
    if host.is_empty() {
        return Err(unresolved("no destination given".to_string()));
    }
    if let Ok(IpAddr::V6(_)) = host.parse::<IpAddr>() {
        return Err(unresolved("IPv6 is not supported yet".to_string()));
    }
    (host, 0)
        .to_socket_addrs()
        .map_err(|err| unresolved(err.to_string()))?
        .map(|addr| addr.ip())
        .find(IpAddr::is_ipv4)
        .ok_or_else(|| unresolved("no IPv4 address found".to_string()))
}

fn open_socket(
    config: &SessionConfig,
    ip: IpAddr,
) -> Result<AsyncICMPSocket, InitError> {
    let mode = if config.privileged { "raw" } else { "datagram" };
    let mut socket =
        ICMPSocket::new(config.privileged).map_err(|source| {
            if source.kind() == io::ErrorKind::PermissionDenied {
                InitError::Permission { mode, source }
            } else {
                InitError::Io(source)
            }
        })?;

    if let Some(name) = &config.interface {
        let bad_interface = |reason: String| InitError::Interface {
            name: name.clone(),
            reason,
        };
        interface_to_ipaddr(name).map_err(|err| bad_interface(err.to_string()))?;
        socket = socket
            .bind_device(name)
            .map_err(|err| bad_interface(err.to_string()))?;
    }

    socket.configure(config.ttl, config.traffic_class, ip)?;
    Ok(AsyncICMPSocket::new(socket)?)
}

/// Per-run bookkeeping: send instants, answered sequence numbers and the
/// aggregate counters.
#[derive(Debug)]
struct Tracker {
    addr: String,
    rtt: Statistics,
    sent: u64,
    received: u64,
    duplicates: u64,
    in_flight: HashMap<u16, Instant>,
    answered: HashSet<u16>,
}

impl Tracker {
    fn new(addr: String) -> Self {
        Self {
            addr,
            rtt: Statistics::new(),
            sent: 0,
            received: 0,
            duplicates: 0,
            in_flight: HashMap::new(),
            answered: HashSet::new(),
        }
    }

    fn on_sent(&mut self, seq: u16, at: Instant) {
        // sequence numbers wrap, so a reused one starts unanswered
        self.answered.remove(&seq);
        self.in_flight.insert(seq, at);
        self.sent += 1;
    }

    /// Returns `None` for replies to probes this run never sent.
    fn on_reply(&mut self, seq: u16, at: Instant) -> Option<(ProbeKind, Duration)> {
        let sent_at = *self.in_flight.get(&seq)?;
        let rtt = at.saturating_duration_since(sent_at);
        if !self.answered.insert(seq) {
            self.duplicates += 1;
            return Some((ProbeKind::Duplicate, rtt));
        }
        self.received += 1;
        self.rtt.update(rtt.as_secs_f64());
        Some((ProbeKind::Received, rtt))
    }

    fn snapshot(&self) -> RunningStatistics {
        let packet_loss = if self.sent == 0 {
            0.0
        } else {
            self.sent.saturating_sub(self.received) as f64 / self.sent as f64
                * 100.0
        };
        let mut snapshot = RunningStatistics {
            sent: self.sent,
            received: self.received,
            duplicates: self.duplicates,
            packet_loss,
            addr: self.addr.clone(),
            ..Default::default()
        };
        if self.rtt.samples() > 0 {
            snapshot.min_rtt = secs(self.rtt.min());
            snapshot.avg_rtt = secs(self.rtt.mean());
            snapshot.max_rtt = secs(self.rtt.max());
            snapshot.stddev_rtt = secs(self.rtt.standard_deviation());
        }
        snapshot
    }
}

fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or_default()
}

struct ProbeLoop {
    socket: AsyncICMPSocket,
    config: SessionConfig,
    identifier: u16,
    destination: IpAddr,
    tracker: Arc<RwLock<Tracker>>,
    events: mpsc::Sender<ProbeEvent>,
    stop: CancellationToken,
}

impl ProbeLoop {
    async fn run(self) {
        let deadline = tokio::time::sleep(self.config.timeout);
        tokio::pin!(deadline);
        let mut pacing = tokio::time::interval(self.config.interval);
        pacing.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // wait for late replies once the last probe is out
        let linger = self
            .config
            .interval
            .saturating_mul(2)
            .max(Duration::from_secs(1));
        let mut linger_until: Option<tokio::time::Instant> = None;

        let mut buf = vec![0u8; RECV_BUFFER_SIZE];
        let mut seq: u16 = 0;
        let mut attempts: u64 = 0;
        let mut errors: u32 = 0;

        loop {
            let linger_at = linger_until.unwrap_or_else(tokio::time::Instant::now);
            tokio::select! {
                biased;
                _ = self.stop.cancelled() => {
                    debug!("stop requested");
                    break;
                }
                _ = &mut deadline => {
                    debug!(timeout = ?self.config.timeout, "run time exhausted");
                    break;
                }
                _ = tokio::time::sleep_until(linger_at), if linger_until.is_some() => {
                    debug!("gave up waiting for outstanding replies");
                    break;
                }
                _ = pacing.tick(), if linger_until.is_none() => {
                    self.send_probe(seq).await;
                    seq = seq.wrapping_add(1);
                    attempts += 1;
                    if self.config.count.is_some_and(|count| attempts >= count) {
                        linger_until = Some(tokio::time::Instant::now() + linger);
                    }
                }
                received = self.socket.recv(&mut buf) => match received {
                    Ok((len, ttl)) => {
                        errors = 0;
                        let Some(event) = self.on_datagram(&buf[..len], ttl) else {
                            continue;
                        };
                        if self.events.send(event).await.is_err() {
                            debug!("event consumer went away");
                            break;
                        }
                        let received = self.tracker.read().received;
                        if self.config.count.is_some_and(|count| received >= count) {
                            break;
                        }
                    }
                    Err(err) => {
                        errors += 1;
                        warn!(%err, "receive failed");
                        if errors >= MAX_CONSECUTIVE_ERRORS {
                            warn!("too many receive errors, stopping");
                            break;
                        }
                    }
                },
            }
        }
    }

    async fn send_probe(&self, seq: u16) {
        let packet = echo_request(self.identifier, seq, self.config.size);
        let sent_at = Instant::now();
        match self.socket.send(&packet).await {
            Ok(_) => self.tracker.write().on_sent(seq, sent_at),
            Err(err) => warn!(seq, %err, "failed to send probe"),
        }
    }

    fn on_datagram(&self, datagram: &[u8], cmsg_ttl: Option<u8>) -> Option<ProbeEvent> {
        let now = Instant::now();
        let observed_at = Local::now();
        let raw = self.socket.is_raw();
        let Some(reply) = parse_reply(datagram, raw) else {
            trace!(len = datagram.len(), "ignoring non echo reply");
            return None;
        };
        // the kernel rewrites and filters the identifier on datagram sockets
        if raw && reply.id != self.identifier {
            trace!(id = reply.id, "ignoring reply for another process");
            return None;
        }
        let (kind, rtt) = self.tracker.write().on_reply(reply.seq, now)?;
        Some(ProbeEvent {
            kind,
            seq: reply.seq,
            bytes: reply.bytes,
            source: self.destination,
            rtt,
            ttl: reply.ttl.or(cmsg_ttl).unwrap_or_default(),
            observed_at,
            received_at: now,
        })
    }
}

/// Builds an ICMPv4 echo request carrying `size` bytes of payload.
fn echo_request(identifier: u16, seq: u16, size: usize) -> Vec<u8> {
    let payload: Vec<u8> = (0..size).map(|i| (i & 0xff) as u8).collect();
    let header = Icmpv4Header::with_checksum(
        Icmpv4Type::EchoRequest(IcmpEchoHeader {
            id: identifier,
            seq,
        }),
        &payload,
    );
    [header.to_bytes().as_slice(), payload.as_slice()].concat()
}

#[derive(Debug, PartialEq, Eq)]
struct Reply {
    id: u16,
    seq: u16,
    /// ICMP message length
    bytes: usize,
    /// Only known when the IP header was part of the datagram
    ttl: Option<u8>,
}

fn parse_reply(datagram: &[u8], with_ip_header: bool) -> Option<Reply> {
    let (icmp, ttl) = if with_ip_header {
        let ip = Ipv4HeaderSlice::from_slice(datagram).ok()?;
        (datagram.get(ip.slice().len()..)?, Some(ip.ttl()))
    } else {
        (datagram, None)
    };
    if icmp.len() < ICMP_HEADER_SIZE {
        return None;
    }
    let (header, _payload) = Icmpv4Header::from_slice(icmp).ok()?;
    match header.icmp_type {
        Icmpv4Type::EchoReply(echo) => Some(Reply {
            id: echo.id,
            seq: echo.seq,
            bytes: icmp.len(),
            ttl,
        }),
        _ => None,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn echo_reply(identifier: u16, seq: u16, size: usize) -> Vec<u8> {
        let payload = vec![0xab; size];
        let header = Icmpv4Header::with_checksum(
            Icmpv4Type::EchoReply(IcmpEchoHeader {
                id: identifier,
                seq,
            }),
            &payload,
        );
        [header.to_bytes().as_slice(), payload.as_slice()].concat()
    }

    fn with_ipv4_header(icmp: &[u8], ttl: u8) -> Vec<u8> {
        let total = (20 + icmp.len()) as u16;
        let mut packet = vec![
            0x45, 0, 0, 0, 0, 0, 0, 0, ttl, 1, 0, 0, 10, 0, 0, 1, 10, 0, 0, 2,
        ];
        packet[2..4].copy_from_slice(&total.to_be_bytes());
        packet.extend_from_slice(icmp);
        packet
    }

    #[test]
    fn echo_request_layout() {
        let packet = echo_request(0x1234, 7, 24);
        assert_eq!(packet.len(), ICMP_HEADER_SIZE + 24);
        assert_eq!(packet[0], 8); // Echo Request type
        assert_eq!(packet[1], 0); // Code
        assert_eq!(&packet[4..6], &0x1234u16.to_be_bytes());
        assert_eq!(&packet[6..8], &7u16.to_be_bytes());
    }

    #[test]
    fn parses_datagram_reply() {
        let reply = parse_reply(&echo_reply(1, 42, 24), false).unwrap();
        assert_eq!(
            reply,
            Reply {
                id: 1,
                seq: 42,
                bytes: 32,
                ttl: None
            }
        );
    }

    #[test]
    fn parses_raw_reply_with_ttl() {
        let packet = with_ipv4_header(&echo_reply(9, 3, 56), 57);
        let reply = parse_reply(&packet, true).unwrap();
        assert_eq!(reply.seq, 3);
        assert_eq!(reply.bytes, 64);
        assert_eq!(reply.ttl, Some(57));
    }

    #[test]
    fn ignores_echo_requests_and_garbage() {
        assert_eq!(parse_reply(&echo_request(1, 1, 8), false), None);
        assert_eq!(parse_reply(&[0u8; 4], false), None);
        assert_eq!(parse_reply(&[0u8; 4], true), None);
    }

    #[test]
    fn snapshot_is_zero_before_first_reply() {
        let mut tracker = Tracker::new("example.com".to_string());
        tracker.on_sent(0, Instant::now());
        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.avg_rtt, Duration::ZERO);
        assert_eq!(snapshot.stddev_rtt, Duration::ZERO);
        assert_eq!(snapshot.sent, 1);
        assert_eq!(snapshot.received, 0);
        assert_eq!(snapshot.packet_loss, 100.0);
        assert_eq!(snapshot.addr, "example.com");
    }

    #[test]
    fn duplicates_do_not_touch_rtt() {
        let start = Instant::now();
        let mut tracker = Tracker::new("host".to_string());
        tracker.on_sent(0, start);
        tracker.on_sent(1, start);

        let (kind, rtt) = tracker
            .on_reply(0, start + Duration::from_millis(10))
            .unwrap();
        assert_eq!(kind, ProbeKind::Received);
        assert_eq!(rtt, Duration::from_millis(10));

        let (kind, _) = tracker
            .on_reply(0, start + Duration::from_millis(30))
            .unwrap();
        assert_eq!(kind, ProbeKind::Duplicate);

        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.received, 1);
        assert_eq!(snapshot.duplicates, 1);
        assert_eq!(snapshot.packet_loss, 50.0);
        assert_eq!(snapshot.min_rtt, snapshot.max_rtt);
        assert_eq!(snapshot.stddev_rtt, Duration::ZERO);
    }

    #[test]
    fn unknown_sequence_is_ignored() {
        let mut tracker = Tracker::new("host".to_string());
        assert_eq!(tracker.on_reply(5, Instant::now()), None);
        assert_eq!(tracker.snapshot().received, 0);
    }

    #[test]
    fn reused_sequence_counts_again() {
        let start = Instant::now();
        let mut tracker = Tracker::new("host".to_string());
        tracker.on_sent(0, start);
        tracker.on_reply(0, start).unwrap();
        tracker.on_sent(0, start);
        let (kind, _) = tracker.on_reply(0, start).unwrap();
        assert_eq!(kind, ProbeKind::Received);
        assert_eq!(tracker.snapshot().received, 2);
    }

    #[test]
    fn rejects_unusable_config() {
        let config = SessionConfig {
            interval: Duration::ZERO,
            ..Default::default()
        };
        assert!(matches!(validate(&config), Err(InitError::InvalidConfig(_))));

        let config = SessionConfig {
            size: MAX_PAYLOAD_SIZE + 1,
            ..Default::default()
        };
        assert!(matches!(validate(&config), Err(InitError::InvalidConfig(_))));
        assert!(validate(&SessionConfig::default()).is_ok());
    }

    #[test]
    fn resolves_literal_ipv4_only() {
        assert_eq!(
            resolve("127.0.0.1").unwrap(),
            "127.0.0.1".parse::<IpAddr>().unwrap()
        );
        assert!(matches!(resolve(""), Err(InitError::Resolve { .. })));
        assert!(matches!(resolve("::1"), Err(InitError::Resolve { .. })));
    }
}
