//! Per-data-connection throughput and RTT model.
//!
//! Each data connection keeps a [`SendRate`]: independently updated RTT,
//! throughput, and outstanding-send observations. The output scheduler asks
//! it where a new payload would land via [`SendRate::delivery_data`], which
//! predicts when the connection could start transmitting and at what rate.
//! Observations older than a second are flagged stale so policies can
//! discount them.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::time::Instant;

/// Rate assumed for a connection with no throughput observation yet.
///
/// Small enough to deprioritize unknown connections, but nonzero so they
/// still receive work and can produce an estimate.
pub const UNKNOWN_BYTES_PER_SECOND: f64 = 1.0;

/// Observations become stale after this long without an update.
const STALE_AFTER: Duration = Duration::from_secs(1);

/// What the scheduler needs to know about one connection's near future.
#[derive(Clone, Copy, Debug)]
pub struct DeliveryData {
    /// Predicted delay before a newly assigned payload starts moving.
    pub start_offset: Duration,
    /// Predicted sustained throughput in bytes per second.
    pub bytes_per_second: f64,
}

/// An in-progress send: when it started and how many bytes it covers.
#[derive(Clone, Copy, Debug)]
struct OutstandingSend {
    started_at: Instant,
    bytes: u64,
}

/// Throughput/RTT estimate for one data connection.
#[derive(Clone, Copy, Debug, Default)]
pub struct SendRate {
    bytes_per_second: Option<f64>,
    rtt: Option<Duration>,
    outstanding: Option<OutstandingSend>,
    last_update: Option<Instant>,
}

impl SendRate {
    /// Record a round-trip-time observation.
    pub fn set_rtt(&mut self, rtt: Duration, now: Instant) {
        self.rtt = Some(rtt);
        self.last_update = Some(now);
    }

    /// Record a throughput observation.
    pub fn set_bytes_per_second(&mut self, bytes_per_second: f64, now: Instant) {
        if bytes_per_second.is_finite() && bytes_per_second > 0.0 {
            self.bytes_per_second = Some(bytes_per_second);
        }
        self.last_update = Some(now);
    }

    /// Record that `bytes` just started moving on the wire.
    pub fn start_send(&mut self, bytes: u64, now: Instant) {
        self.outstanding = Some(OutstandingSend {
            started_at: now,
            bytes,
        });
        self.last_update = Some(now);
    }

    /// Whether no observation has landed within the staleness window.
    #[must_use]
    pub fn is_stale(&self, now: Instant) -> bool {
        self.last_update
            .is_none_or(|at| now.saturating_duration_since(at) > STALE_AFTER)
    }

    /// Predict when this connection could begin a new payload and how fast
    /// it would move.
    ///
    /// The start offset is the remaining drain time of the outstanding send,
    /// adjusted for time already elapsed, plus half an RTT as the latency
    /// floor for the first byte to matter at the receiver.
    #[must_use]
    pub fn delivery_data(&self, now: Instant) -> DeliveryData {
        let bytes_per_second = self
            .bytes_per_second
            .unwrap_or(UNKNOWN_BYTES_PER_SECOND)
            .max(UNKNOWN_BYTES_PER_SECOND);

        let drain = self.outstanding.map_or(Duration::ZERO, |send| {
            #[expect(
                clippy::cast_precision_loss,
                reason = "outstanding byte counts fit comfortably in f64"
            )]
            let in_flight = Duration::from_secs_f64(send.bytes as f64 / bytes_per_second);
            let elapsed = now.saturating_duration_since(send.started_at);
            in_flight.saturating_sub(elapsed)
        });

        let half_rtt = self.rtt.unwrap_or(Duration::ZERO) / 2;
        DeliveryData {
            start_offset: drain + half_rtt,
            bytes_per_second,
        }
    }

    /// Raw observations for diagnostics.
    #[must_use]
    pub fn snapshot(&self, now: Instant) -> RateSnapshot {
        RateSnapshot {
            bytes_per_second: self.bytes_per_second,
            rtt: self.rtt,
            outstanding_bytes: self.outstanding.map_or(0, |send| send.bytes),
            stale: self.is_stale(now),
        }
    }
}

/// Read-only view of one connection's rate state.
#[derive(Clone, Copy, Debug)]
pub struct RateSnapshot {
    pub bytes_per_second: Option<f64>,
    pub rtt: Option<Duration>,
    pub outstanding_bytes: u64,
    pub stale: bool,
}

/// Cheaply cloneable handle to one connection's [`SendRate`], written by the
/// data endpoint's loops and read by the scheduler.
#[derive(Clone, Debug, Default)]
pub struct SharedSendRate(Arc<Mutex<SendRate>>);

impl SharedSendRate {
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Run `f` against the estimate under its lock.
    pub(crate) fn with<R>(&self, f: impl FnOnce(&mut SendRate) -> R) -> R {
        let mut guard = self.0.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        f(&mut guard)
    }

    /// Predict delivery for the scheduler.
    #[must_use]
    pub fn delivery_data(&self, now: Instant) -> DeliveryData {
        self.with(|rate| rate.delivery_data(now))
    }

    /// Snapshot for diagnostics.
    #[must_use]
    pub fn snapshot(&self, now: Instant) -> RateSnapshot {
        self.with(|rate| rate.snapshot(now))
    }
}
