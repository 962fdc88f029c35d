//! Engine configuration consumed by the DCP layer at bootstrap.

use crate::ids::VbucketCount;

/// Flow-control policy applied to consumer connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlowControlPolicyKind {
    /// No buffered-byte window; the consumer never emits buffer acks.
    None,
    /// Fixed window per consumer connection.
    Static,
    /// Window sized from the bucket quota, shrinking as consumers join.
    #[default]
    Dynamic,
    /// Larger fraction of the quota split evenly across consumers.
    Aggressive,
}

impl FlowControlPolicyKind {
    /// Parses the configuration string form.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "none" => Some(Self::None),
            "static" => Some(Self::Static),
            "dynamic" => Some(Self::Dynamic),
            "aggressive" => Some(Self::Aggressive),
            _ => None,
        }
    }
}

/// Full-bucket behavior for ephemeral buckets once memory is exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EphemeralFullPolicy {
    /// Evict old data to make room for new.
    #[default]
    AutoDelete,
    /// Refuse new data; replication escalates to disconnect past the throttle threshold.
    FailNewData,
}

/// Bucket-wide configuration inputs read by the DCP subsystem.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Number of vBuckets owned by the bucket.
    pub vbucket_count: VbucketCount,
    /// Bucket memory quota in bytes.
    pub max_size: usize,
    /// Fraction of `max_size` above which replication ingest is throttled.
    pub replication_throttle_threshold: f64,
    /// Seconds of producer silence after an unanswered noop before disconnecting.
    pub dcp_idle_timeout_secs: u64,
    /// Interval between connection-manager passes, in seconds.
    pub connection_manager_interval_secs: u64,
    /// Default producer noop transmit interval, in seconds.
    pub dcp_noop_tx_interval_secs: u64,
    /// Whether consumers negotiate noop with their producer.
    pub dcp_enable_noop: bool,
    /// Flow-control policy for consumer connections.
    pub dcp_flow_control_policy: FlowControlPolicyKind,
    /// Static/dynamic flow-control buffer size floor in bytes.
    pub dcp_conn_buffer_size: usize,
    /// Whether replicas route initial disk snapshots through the backfill queue.
    pub disk_backfill_queue: bool,
    /// Ephemeral bucket full-policy.
    pub ephemeral_full_policy: EphemeralFullPolicy,
    /// Whether this bucket is ephemeral (no persistence layer).
    pub ephemeral: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            vbucket_count: VbucketCount::new(4).expect("literal vbucket count must be non-zero"),
            max_size: 256 * 1024 * 1024,
            replication_throttle_threshold: 0.9,
            dcp_idle_timeout_secs: 360,
            connection_manager_interval_secs: 1,
            dcp_noop_tx_interval_secs: 20,
            dcp_enable_noop: true,
            dcp_flow_control_policy: FlowControlPolicyKind::Dynamic,
            dcp_conn_buffer_size: 10 * 1024 * 1024,
            disk_backfill_queue: true,
            ephemeral_full_policy: EphemeralFullPolicy::AutoDelete,
            ephemeral: false,
        }
    }
}

impl EngineConfig {
    /// Returns the byte level at which replication ingest starts to throttle.
    #[must_use]
    pub fn replication_throttle_bytes(&self) -> usize {
        let threshold = self.replication_throttle_threshold.clamp(0.0, 1.0);
        // Quotas are far below 2^52, so the f64 round-trip is exact.
        let scaled = (self.max_size as f64) * threshold;
        scaled as usize
    }
}

#[cfg(test)]
mod tests {
    use super::{EngineConfig, FlowControlPolicyKind};
    use googletest::prelude::*;
    use rstest::rstest;

    #[rstest]
    #[case("none", Some(FlowControlPolicyKind::None))]
    #[case("static", Some(FlowControlPolicyKind::Static))]
    #[case("dynamic", Some(FlowControlPolicyKind::Dynamic))]
    #[case("aggressive", Some(FlowControlPolicyKind::Aggressive))]
    #[case("bursty", None)]
    fn flow_control_policy_parses_configuration_strings(
        #[case] raw: &str,
        #[case] expected: Option<FlowControlPolicyKind>,
    ) {
        assert_that!(FlowControlPolicyKind::parse(raw), eq(expected));
    }

    #[rstest]
    fn throttle_bytes_scale_with_quota_and_threshold() {
        let config = EngineConfig {
            max_size: 1000,
            replication_throttle_threshold: 0.9,
            ..EngineConfig::default()
        };
        assert_that!(config.replication_throttle_bytes(), eq(900_usize));
    }

    #[rstest]
    fn throttle_threshold_is_clamped_to_unit_interval() {
        let config = EngineConfig {
            max_size: 1000,
            replication_throttle_threshold: 1.7,
            ..EngineConfig::default()
        };
        assert_that!(config.replication_throttle_bytes(), eq(1000_usize));
    }
}
