//! Per-connection liveness probing.
//!
//! Each connection runs `ALIVE -> PING_SENT -> (PONG -> ALIVE) | (TIMEOUT -> DEAD)`.
//! Timers are plain tasks that post [`HubEvent`]s back to the hub, so every
//! transition happens on the hub's single control flow. Probes carry a
//! sequence number; an expiry for a probe that was already answered is
//! ignored even if it was queued before the pong.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::hub::HubEvent;
use crate::registry::ConnectionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatConfig {
    /// Time between probes.
    pub interval: Duration,
    /// How long a probe may go unanswered.
    pub timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Alive,
    PingSent { probe: u64 },
    Dead,
}

#[derive(Debug)]
pub struct Heartbeat {
    liveness: Liveness,
    next_probe: u64,
    last_pong: Option<Instant>,
    ticker: Option<JoinHandle<()>>,
    deadline: Option<JoinHandle<()>>,
}

impl Default for Heartbeat {
    fn default() -> Self {
        Self {
            liveness: Liveness::Alive,
            next_probe: 0,
            last_pong: None,
            ticker: None,
            deadline: None,
        }
    }
}

impl Heartbeat {
    /// Start the probe ticker for `id`. The first probe is due one interval
    /// from now.
    pub fn start(
        &mut self,
        id: ConnectionId,
        config: HeartbeatConfig,
        events: mpsc::UnboundedSender<HubEvent>,
    ) {
        let period = config.interval;
        self.ticker = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if events.send(HubEvent::ProbeDue(id)).is_err() {
                    break;
                }
            }
        }));
    }

    #[cfg(test)]
    pub fn liveness(&self) -> Liveness {
        self.liveness
    }

    pub fn last_pong(&self) -> Option<Instant> {
        self.last_pong
    }

    /// `Alive -> PingSent`. Returns the probe number to send, or `None` if a
    /// probe is already outstanding or the connection is dead.
    pub fn begin_probe(&mut self) -> Option<u64> {
        if self.liveness != Liveness::Alive {
            return None;
        }
        self.next_probe += 1;
        let probe = self.next_probe;
        self.liveness = Liveness::PingSent { probe };
        Some(probe)
    }

    /// Arm the expiry timer for `probe`.
    pub fn arm_timeout(
        &mut self,
        id: ConnectionId,
        probe: u64,
        config: HeartbeatConfig,
        events: mpsc::UnboundedSender<HubEvent>,
    ) {
        if let Some(prev) = self.deadline.take() {
            prev.abort();
        }
        let timeout = config.timeout;
        self.deadline = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = events.send(HubEvent::ProbeExpired { id, probe });
        }));
    }

    /// `PingSent -> Alive`. Cancels the pending expiry. Pongs in any other
    /// state only refresh `last_pong`.
    pub fn on_pong(&mut self) -> bool {
        self.last_pong = Some(Instant::now());
        match self.liveness {
            Liveness::PingSent { .. } => {
                if let Some(deadline) = self.deadline.take() {
                    deadline.abort();
                }
                self.liveness = Liveness::Alive;
                true
            }
            _ => false,
        }
    }

    /// `PingSent { probe } -> Dead`. Returns `true` only if `probe` is the
    /// outstanding probe, i.e. the connection must be evicted.
    pub fn on_expired(&mut self, probe: u64) -> bool {
        if self.liveness != (Liveness::PingSent { probe }) {
            return false;
        }
        self.deadline = None;
        self.stop();
        true
    }

    /// Mark dead and cancel all timers.
    pub fn stop(&mut self) {
        self.liveness = Liveness::Dead;
        if let Some(ticker) = self.ticker.take() {
            ticker.abort();
        }
        if let Some(deadline) = self.deadline.take() {
            deadline.abort();
        }
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.stop();
    }
}
