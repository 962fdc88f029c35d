//! Canonical identifier types used across storage, protocol, and DCP crates.

/// Numeric vBucket identifier inside a single bucket.
pub type Vbid = u16;

/// Monotonic per-vBucket sequence number of a mutation.
pub type Seqno = u64;

/// vBucket instance id recorded in the failover table.
pub type VbUuid = u64;

/// Client-chosen correlation value echoed on every response for a stream.
pub type Opaque = u32;

/// Compare-and-swap value carried by documents.
pub type Cas = u64;

/// Handle identifying the transport endpoint that owns a connection.
///
/// The front-end allocates one cookie per socket; the engine never interprets the value beyond
/// equality.
pub type Cookie = u64;

/// Strongly typed vBucket-count wrapper to avoid passing raw integers around bucket APIs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VbucketCount(u16);

impl VbucketCount {
    /// Creates a validated vBucket-count value.
    ///
    /// Returns `None` for zero because a bucket always owns at least one vBucket.
    #[must_use]
    pub fn new(value: u16) -> Option<Self> {
        if value == 0 { None } else { Some(Self(value)) }
    }

    /// Returns the inner count.
    #[must_use]
    pub const fn get(self) -> u16 {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::VbucketCount;
    use googletest::prelude::*;
    use rstest::rstest;

    #[rstest]
    fn vbucket_count_rejects_zero() {
        assert_that!(VbucketCount::new(0), eq(None));
    }

    #[rstest]
    #[case(1)]
    #[case(64)]
    #[case(1024)]
    fn vbucket_count_accepts_positive_values(#[case] input: u16) {
        let count = VbucketCount::new(input).expect("positive count must be valid");
        assert_that!(count.get(), eq(input));
    }
}
