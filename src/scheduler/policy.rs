//! Pluggable scheduling policy for fanning queued frames across readers.
//!
//! Each scheduling pass is one "step": the scheduler announces the queue's
//! token total, describes every registered channel, asks the policy to plan,
//! then offers frames one at a time until the policy declines. The policy
//! never touches the queue itself; it only picks channel indices.

use std::time::Duration;

/// One data connection as the policy sees it during a step.
#[derive(Clone, Copy, Debug)]
pub struct ChannelInfo {
    /// Dense index assigned for this step; also the value
    /// [`SchedulingPolicy::allocate_message`] returns.
    pub index: usize,
    /// Whether the channel's reader is currently waiting for a batch.
    pub ready: bool,
    /// Predicted delay before newly assigned bytes start moving.
    pub start_offset: Duration,
    /// Predicted sustained throughput in bytes per second.
    pub bytes_per_second: f64,
}

/// Decides which reader receives each queued frame.
pub trait SchedulingPolicy: Send + 'static {
    /// Begin a scheduling step over a queue holding `queued_tokens` tokens.
    fn new_step(&mut self, queued_tokens: u64);

    /// Describe one channel. Called once per registered reader, ready or not.
    fn add_channel(&mut self, channel: ChannelInfo);

    /// All channels described; finalize whatever plan the policy keeps.
    fn make_plan(&mut self);

    /// Pick a channel for a frame costing `tokens`, or decline.
    ///
    /// Returning `None` ends the step; remaining frames stay queued for the
    /// next one.
    fn allocate_message(&mut self, tokens: u64) -> Option<usize>;
}

#[derive(Clone, Copy, Debug)]
struct PlannedChannel {
    info: ChannelInfo,
    assigned_bytes: f64,
}

impl PlannedChannel {
    /// Predicted moment this channel would finish everything assigned so
    /// far, in seconds from now.
    fn finish_time(&self) -> f64 {
        self.info.start_offset.as_secs_f64() + self.assigned_bytes / self.info.bytes_per_second
    }
}

/// Earliest-predicted-completion assignment weighted by per-channel rate.
///
/// Each frame goes to the ready channel that would finish its backlog
/// soonest, so fast idle connections absorb most of the queue while slow or
/// busy ones still receive work in proportion to what they can move.
#[derive(Debug, Default)]
pub struct WeightedFairPolicy {
    channels: Vec<PlannedChannel>,
}

impl WeightedFairPolicy {
    #[must_use]
    pub fn new() -> Self { Self::default() }
}

impl SchedulingPolicy for WeightedFairPolicy {
    fn new_step(&mut self, _queued_tokens: u64) { self.channels.clear(); }

    fn add_channel(&mut self, channel: ChannelInfo) {
        debug_assert_eq!(channel.index, self.channels.len());
        self.channels.push(PlannedChannel {
            info: channel,
            assigned_bytes: 0.0,
        });
    }

    fn make_plan(&mut self) {}

    fn allocate_message(&mut self, tokens: u64) -> Option<usize> {
        let chosen = self
            .channels
            .iter_mut()
            .filter(|channel| channel.info.ready && channel.info.bytes_per_second > 0.0)
            .min_by(|a, b| {
                a.finish_time()
                    .partial_cmp(&b.finish_time())
                    .unwrap_or(std::cmp::Ordering::Equal)
            })?;
        #[expect(
            clippy::cast_precision_loss,
            reason = "token counts fit comfortably in f64"
        )]
        {
            chosen.assigned_bytes += tokens as f64;
        }
        Some(chosen.info.index)
    }
}
