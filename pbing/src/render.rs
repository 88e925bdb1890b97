//! Transcript output: one header, one line per reply, one summary.

use std::{
    io::{self, Write},
    time::Duration,
};

use clap::ValueEnum;
use colored::Colorize;
use common::{Destination, Logging, ProbeEvent, ProbeKind, RunningStatistics};

use crate::{
    classify::{GapVerdict, RttVerdict},
    logger::{ProbeRecord, SummaryRecord},
};

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Colour on a terminal, plain text otherwise
    Auto,
    Color,
    Plain,
    /// Machine readable rows
    Csv,
}

impl OutputFormat {
    /// Turns `Auto` into `Color` or `Plain`.
    pub fn resolve(self, is_terminal: bool, no_color: bool) -> Self {
        match self {
            OutputFormat::Auto if is_terminal && !no_color => OutputFormat::Color,
            OutputFormat::Auto => OutputFormat::Plain,
            other => other,
        }
    }
}

/// Maps verdicts to styling. Implementations must not change the text
/// itself.
pub trait Palette {
    fn rtt(&self, text: String, verdict: RttVerdict) -> String;
    fn gap(&self, text: String, verdict: GapVerdict) -> String;
}

pub struct Plain;

impl Palette for Plain {
    fn rtt(&self, text: String, _verdict: RttVerdict) -> String {
        text
    }
    fn gap(&self, text: String, _verdict: GapVerdict) -> String {
        text
    }
}

/// ANSI colours: green for fast, yellow for late, red for slow or very late.
pub struct Ansi;

impl Palette for Ansi {
    fn rtt(&self, text: String, verdict: RttVerdict) -> String {
        match verdict {
            RttVerdict::Low => text.green().to_string(),
            RttVerdict::High => text.red().to_string(),
            RttVerdict::Normal => text,
        }
    }
    fn gap(&self, text: String, verdict: GapVerdict) -> String {
        match verdict {
            GapVerdict::Delayed => text.yellow().to_string(),
            GapVerdict::SeverelyDelayed => text.red().to_string(),
            GapVerdict::Normal => text,
        }
    }
}

/// A reply together with everything the controller worked out about it.
#[derive(Debug, Clone, Copy)]
pub struct Annotated<'a> {
    pub event: &'a ProbeEvent,
    pub gap: Duration,
    pub gap_verdict: GapVerdict,
    pub rtt_verdict: RttVerdict,
}

pub fn format_gap(gap: Duration) -> String {
    format!("{:.1}s", gap.as_secs_f64())
}

pub fn format_rtt(rtt: Duration) -> String {
    format!("{:?}", rtt)
}

pub fn probe_line(probe: &Annotated<'_>, palette: &dyn Palette) -> String {
    let event = probe.event;
    let mut line = format!(
        "{} (\u{0394}{}): {} bytes from {}: icmp_seq={} time={} ttl={}",
        event.observed_at.format(TIMESTAMP_FORMAT),
        palette.gap(format_gap(probe.gap), probe.gap_verdict),
        event.bytes,
        event.source,
        event.seq,
        palette.rtt(format_rtt(event.rtt), probe.rtt_verdict),
        event.ttl,
    );
    if event.kind == ProbeKind::Duplicate {
        line.push_str(" (DUP!)");
    }
    line
}

pub fn summary_block(stats: &RunningStatistics) -> String {
    format!(
        "\n--- {} ping statistics ---\n\
         {} packets transmitted, {} packets received, {} duplicates, {}% packet loss\n\
         round-trip min/avg/max/stddev = {}/{}/{}/{}\n",
        stats.addr,
        stats.sent,
        stats.received,
        stats.duplicates,
        stats.packet_loss,
        format_rtt(stats.min_rtt),
        format_rtt(stats.avg_rtt),
        format_rtt(stats.max_rtt),
        format_rtt(stats.stddev_rtt),
    )
}

fn millis(value: Duration) -> f64 {
    value.as_nanos() as f64 / 1e6
}

/// Writes the transcript of one session to `out`.
pub struct Renderer<W> {
    out: W,
    format: OutputFormat,
    csv_header_written: bool,
}

impl<W: Write> Renderer<W> {
    /// `Auto` is rendered as plain text; resolve it first to get colours.
    pub fn new(out: W, format: OutputFormat) -> Self {
        Self {
            out,
            format,
            csv_header_written: false,
        }
    }

    fn palette(&self) -> &'static dyn Palette {
        match self.format {
            OutputFormat::Color => &Ansi,
            _ => &Plain,
        }
    }

    pub fn start(&mut self, destination: &Destination) -> io::Result<()> {
        if self.format == OutputFormat::Csv {
            return Ok(());
        }
        writeln!(self.out, "PING {} ({}):", destination.host, destination.ip)?;
        self.out.flush()
    }

    pub fn probe(&mut self, probe: &Annotated<'_>) -> io::Result<()> {
        if self.format == OutputFormat::Csv {
            let event = probe.event;
            let record = ProbeRecord {
                timestamp: event.observed_at.format(TIMESTAMP_FORMAT).to_string(),
                gap_s: probe.gap.as_secs_f64(),
                gap: probe.gap_verdict,
                size: event.bytes,
                src_addr: event.source.to_string(),
                seq: event.seq,
                rtt_ms: millis(event.rtt),
                rtt: probe.rtt_verdict,
                ttl: event.ttl,
                duplicate: event.kind == ProbeKind::Duplicate,
            };
            if !self.csv_header_written {
                self.out.write_all(record.header().as_bytes())?;
                self.csv_header_written = true;
            }
            write!(self.out, "{}", record)?;
        } else {
            let line = probe_line(probe, self.palette());
            writeln!(self.out, "{}", line)?;
        }
        self.out.flush()
    }

    pub fn summary(&mut self, stats: &RunningStatistics) -> io::Result<()> {
        if self.format == OutputFormat::Csv {
            let record = SummaryRecord {
                dst_addr: stats.addr.clone(),
                sent: stats.sent,
                received: stats.received,
                duplicates: stats.duplicates,
                packet_loss: stats.packet_loss,
                min_ms: millis(stats.min_rtt),
                avg_ms: millis(stats.avg_rtt),
                max_ms: millis(stats.max_rtt),
                stddev_ms: millis(stats.stddev_rtt),
            };
            write!(self.out, "\n{}{}", record.header(), record)?;
        } else {
            self.out.write_all(summary_block(stats).as_bytes())?;
        }
        self.out.flush()
    }

    #[cfg(test)]
    pub fn into_inner(self) -> W {
        self.out
    }
}
