//! Lifecycle of one probe run: start the transport, annotate and render every
//! reply, render the summary once the stream ends.

use std::{
    io::Write,
    time::{Duration, Instant},
};

use common::{InitError, ProbeEvent, SessionConfig, Transport};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    classify::{GapVerdict, RttVerdict},
    render::{Annotated, Renderer},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Running,
    Completed,
    Cancelled,
}

/// Memory carried from one reply to the next. Only the session writes it.
#[derive(Debug, Default)]
pub struct SessionState {
    last_success: Option<Instant>,
}

impl SessionState {
    /// Zero before the first reply.
    pub fn gap_since_last_success(&self, at: Instant) -> Duration {
        self.last_success
            .map(|last| at.saturating_duration_since(last))
            .unwrap_or_default()
    }

    pub fn record_success(&mut self, at: Instant) {
        self.last_success = Some(at);
    }
}

/// Handle for asking a running session to stop. Cheap to clone and safe to
/// call from any task, any number of times.
#[derive(Debug, Clone)]
pub struct Canceller {
    token: CancellationToken,
}

impl Canceller {
    pub fn request_stop(&self) {
        if !self.token.is_cancelled() {
            info!("stop requested");
        }
        self.token.cancel();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Outcome {
    pub phase: Phase,
    /// Replies rendered, duplicates included
    pub probes: u64,
}

pub struct Session<T, W> {
    transport: T,
    config: SessionConfig,
    renderer: Renderer<W>,
    state: SessionState,
    phase: Phase,
    stop: CancellationToken,
    probes: u64,
}

impl<T: Transport, W: Write> Session<T, W> {
    pub fn new(transport: T, config: SessionConfig, renderer: Renderer<W>) -> Self {
        Self {
            transport,
            config,
            renderer,
            state: SessionState::default(),
            phase: Phase::Idle,
            stop: CancellationToken::new(),
            probes: 0,
        }
    }

    pub fn canceller(&self) -> Canceller {
        Canceller {
            token: self.stop.clone(),
        }
    }

    fn outcome(&self) -> Outcome {
        Outcome {
            phase: self.phase,
            probes: self.probes,
        }
    }

    /// Runs the session to completion. A transport that fails to start
    /// leaves the session idle and nothing is written. Calling this again
    /// after the first run only reports the outcome.
    ///
    /// The run counts as cancelled only when a stop request is seen while the
    /// stream is still open. The transport is stopped through its own token,
    /// cancelled after the session has seen the request.
    pub async fn run(&mut self) -> Result<Outcome, InitError> {
        if self.phase != Phase::Idle {
            return Ok(self.outcome());
        }
        let transport_stop = CancellationToken::new();
        let mut stream = self.transport.start(&self.config, transport_stop.clone())?;
        self.phase = Phase::Running;
        info!(
            host = %stream.destination.host,
            ip = %stream.destination.ip,
            "session running"
        );
        if let Err(err) = self.renderer.start(&stream.destination) {
            warn!(%err, "failed to write transcript header");
        }

        let stop = self.stop.clone();
        let mut interrupted = false;
        loop {
            tokio::select! {
                biased;
                event = stream.next() => match event {
                    Some(event) => self.handle(&event),
                    None => break,
                },
                _ = stop.cancelled(), if !interrupted => {
                    interrupted = true;
                    transport_stop.cancel();
                }
            }
        }

        self.phase = if interrupted {
            Phase::Cancelled
        } else {
            Phase::Completed
        };
        debug!(phase = ?self.phase, probes = self.probes, "event stream ended");

        let stats = self.transport.statistics();
        if let Err(err) = self.renderer.summary(&stats) {
            warn!(%err, "failed to write summary");
        }
        Ok(self.outcome())
    }

    fn handle(&mut self, event: &ProbeEvent) {
        let gap = self.state.gap_since_last_success(event.received_at);
        let stats = self.transport.statistics();
        let probe = Annotated {
            event,
            gap,
            gap_verdict: GapVerdict::classify(self.config.interval, gap),
            rtt_verdict: RttVerdict::classify(&stats, event.rtt),
        };
        if let Err(err) = self.renderer.probe(&probe) {
            warn!(seq = event.seq, %err, "failed to write probe line");
        }
        self.state.record_success(event.received_at);
        self.probes += 1;
    }
}
