use std::time::Duration;

use clap::Parser;
use common::SessionConfig;
use tracing::level_filters::LevelFilter;

use crate::render::OutputFormat;

const EXAMPLES: &str = "\
Examples:
  pbing example.com                    # ping continuously
  pbing -c 5 example.com               # ping 5 times
  pbing -c 5 -i 500ms example.com      # ping 5 times at 500ms intervals
  pbing -T 10s example.com             # ping for 10 seconds
  pbing -I eth0 example.com            # ping from a specific interface
  sudo pbing --privileged example.com  # ping using raw ICMP sockets
  pbing -s 100 example.com             # ping with 100-byte payloads
  pbing -Q 128 example.com             # ping with DSCP CS4 and ECN 0
  pbing --format csv example.com       # machine readable output";

#[derive(Parser, Debug)]
#[command(author, version, about, after_help = EXAMPLES)]
pub struct Opts {
    /// DNS name or IP address to ping
    pub destination: Option<String>,
    /// Payload size in bytes
    #[arg(short, long, default_value = "24")]
    pub size: usize,
    /// Maximum count of pings before exiting (negative for no limit)
    #[arg(short, long, default_value = "-1", allow_negative_numbers = true)]
    pub count: i64,
    /// Time interval between pings
    #[arg(short, long, default_value = "1s", value_parser = duration_parser)]
    pub interval: Duration,
    /// Maximum time to ping before exiting
    #[arg(short = 'T', long, default_value = "100000s", value_parser = duration_parser)]
    pub timeout: Duration,
    /// Time to live (TTL) value
    #[arg(short, long, default_value = "64")]
    pub ttl: u32,
    /// Interface name to source pings from
    #[arg(short = 'I', long = "interface")]
    pub iface: Option<String>,
    /// QoS traffic class (DSCP + ECN bits) as a decimal number
    #[arg(short = 'Q', long, default_value = "192")]
    pub tclass: u8,
    /// Send raw ICMP instead of using unprivileged datagram sockets
    #[arg(long)]
    pub privileged: bool,
    /// Transcript format
    #[arg(long, value_enum, default_value = "auto")]
    pub format: OutputFormat,
    /// Diagnostics level on stderr, RUST_LOG overrides it
    #[arg(long, default_value = "warn")]
    pub log_level: LevelFilter,
}

fn duration_parser(s: &str) -> Result<Duration, humantime::DurationError> {
    humantime::parse_duration(s)
}

impl Opts {
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            count: u64::try_from(self.count).ok().filter(|count| *count > 0),
            timeout: self.timeout,
            interval: self.interval,
            size: self.size,
            ttl: self.ttl,
            traffic_class: self.tclass,
            interface: self.iface.clone(),
            privileged: self.privileged,
        }
    }
}
