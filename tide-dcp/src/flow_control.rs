//! Flow control: the consumer's buffered-byte window and the producer's buffer log.

use tide_common::config::{EngineConfig, FlowControlPolicyKind};

/// Smallest window any sizing policy will advertise.
const MIN_BUFFER_BYTES: usize = 10 * 1024 * 1024;
/// Largest window any sizing policy will advertise.
const MAX_BUFFER_BYTES: usize = 50 * 1024 * 1024;
/// Fraction of the window that triggers a buffer ack once unacked.
const ACK_RATIO: f64 = 0.5;

/// Consumer-side flow control window.
///
/// The consumer advertises its window to the producer at negotiation time, counts every
/// received byte as unacked, and emits a buffer ack once enough of the window is consumed.
#[derive(Debug)]
pub struct FlowControl {
    enabled: bool,
    buffer_size: usize,
    unacked_bytes: usize,
}

impl FlowControl {
    /// Sizes the window from the configured policy.
    #[must_use]
    pub fn from_config(config: &EngineConfig) -> Self {
        let (enabled, buffer_size) = match config.dcp_flow_control_policy {
            FlowControlPolicyKind::None => (false, 0),
            FlowControlPolicyKind::Static => (true, config.dcp_conn_buffer_size),
            FlowControlPolicyKind::Dynamic => {
                let share = config.max_size / 20;
                (true, share.clamp(MIN_BUFFER_BYTES, MAX_BUFFER_BYTES))
            }
            FlowControlPolicyKind::Aggressive => {
                let share = config.max_size / 10;
                (true, share.clamp(MIN_BUFFER_BYTES, MAX_BUFFER_BYTES))
            }
        };
        Self {
            enabled,
            buffer_size,
            unacked_bytes: 0,
        }
    }

    /// Returns whether the window is active.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Advertised window size in bytes.
    #[must_use]
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Counts received bytes toward the unacked total.
    pub fn record_received(&mut self, bytes: usize) {
        if self.enabled {
            self.unacked_bytes += bytes;
        }
    }

    /// Bytes received but not yet acknowledged.
    #[must_use]
    pub fn unacked_bytes(&self) -> usize {
        self.unacked_bytes
    }

    /// Takes the pending ack once the unacked total warrants one.
    ///
    /// Returns the byte count to acknowledge, or `None` when below the ack ratio.
    pub fn take_pending_ack(&mut self) -> Option<u32> {
        if !self.enabled || self.unacked_bytes == 0 {
            return None;
        }
        let threshold = (self.buffer_size as f64 * ACK_RATIO) as usize;
        if self.unacked_bytes < threshold.max(1) {
            return None;
        }
        let bytes = u32::try_from(self.unacked_bytes).unwrap_or(u32::MAX);
        self.unacked_bytes = 0;
        Some(bytes)
    }

    /// Immediately takes whatever is unacked (used when freed bytes should unblock a producer).
    pub fn take_any_ack(&mut self) -> Option<u32> {
        if !self.enabled || self.unacked_bytes == 0 {
            return None;
        }
        let bytes = u32::try_from(self.unacked_bytes).unwrap_or(u32::MAX);
        self.unacked_bytes = 0;
        Some(bytes)
    }
}

/// Producer-side record of bytes in flight against the consumer's advertised window.
#[derive(Debug, Default)]
pub struct BufferLog {
    /// `None` until the consumer advertises a window; unlimited meanwhile.
    max_bytes: Option<usize>,
    bytes_outstanding: usize,
}

impl BufferLog {
    /// Creates an unlimited log; the consumer's control message bounds it later.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies the consumer's advertised window.
    pub fn set_buffer_size(&mut self, bytes: usize) {
        self.max_bytes = if bytes == 0 { None } else { Some(bytes) };
    }

    /// Returns whether sending `next_len` more bytes would overrun the window.
    #[must_use]
    pub fn would_overrun(&self, next_len: usize) -> bool {
        self.max_bytes
            .is_some_and(|max| self.bytes_outstanding + next_len > max)
    }

    /// Records bytes put on the wire.
    pub fn record_sent(&mut self, bytes: usize) {
        if self.max_bytes.is_some() {
            self.bytes_outstanding += bytes;
        }
    }

    /// Applies a buffer ack from the consumer.
    pub fn ack(&mut self, bytes: usize) {
        self.bytes_outstanding = self.bytes_outstanding.saturating_sub(bytes);
    }

    /// Bytes currently unacknowledged.
    #[must_use]
    pub fn bytes_outstanding(&self) -> usize {
        self.bytes_outstanding
    }
}

#[cfg(test)]
mod tests {
    use super::{BufferLog, FlowControl, MAX_BUFFER_BYTES, MIN_BUFFER_BYTES};
    use googletest::prelude::*;
    use rstest::rstest;
    use tide_common::config::{EngineConfig, FlowControlPolicyKind};

    fn config_with(policy: FlowControlPolicyKind, max_size: usize) -> EngineConfig {
        EngineConfig {
            dcp_flow_control_policy: policy,
            max_size,
            ..EngineConfig::default()
        }
    }

    #[rstest]
    fn none_policy_disables_the_window() {
        let flow = FlowControl::from_config(&config_with(FlowControlPolicyKind::None, 1 << 30));
        assert_that!(flow.is_enabled(), eq(false));
        assert_that!(flow.buffer_size(), eq(0_usize));
    }

    #[rstest]
    fn static_policy_uses_the_configured_size() {
        let mut config = config_with(FlowControlPolicyKind::Static, 1 << 30);
        config.dcp_conn_buffer_size = 4096;
        let flow = FlowControl::from_config(&config);
        assert_that!(flow.buffer_size(), eq(4096_usize));
    }

    #[rstest]
    fn dynamic_policy_clamps_its_quota_share() {
        let small = FlowControl::from_config(&config_with(
            FlowControlPolicyKind::Dynamic,
            16 * 1024 * 1024,
        ));
        assert_that!(small.buffer_size(), eq(MIN_BUFFER_BYTES));

        let large = FlowControl::from_config(&config_with(FlowControlPolicyKind::Dynamic, 1 << 34));
        assert_that!(large.buffer_size(), eq(MAX_BUFFER_BYTES));
    }

    #[rstest]
    fn acks_fire_once_half_the_window_is_unacked() {
        let mut config = config_with(FlowControlPolicyKind::Static, 1 << 30);
        config.dcp_conn_buffer_size = 1000;
        let mut flow = FlowControl::from_config(&config);

        flow.record_received(300);
        assert_that!(flow.take_pending_ack(), eq(None));

        flow.record_received(250);
        assert_that!(flow.take_pending_ack(), eq(Some(550_u32)));
        assert_that!(flow.unacked_bytes(), eq(0_usize));
    }

    #[rstest]
    fn buffer_log_blocks_at_the_advertised_window() {
        let mut log = BufferLog::new();
        // Unlimited until the consumer advertises.
        assert_that!(log.would_overrun(usize::MAX / 2), eq(false));

        log.set_buffer_size(100);
        log.record_sent(80);
        assert_that!(log.would_overrun(30), eq(true));
        assert_that!(log.would_overrun(20), eq(false));

        log.ack(50);
        assert_that!(log.bytes_outstanding(), eq(30_usize));
        assert_that!(log.would_overrun(60), eq(false));
    }
}
