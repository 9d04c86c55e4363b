use std::time::Duration;

// Election timeouts to use in a single-peer cluster, to speed up boot when
// there is nobody to out-vote.
const SINGLE_PEER_ELECTION_TIMEOUT: Duration = Duration::from_millis(500);

/// Operator-tunable knobs. Every field defaults sensibly when `None`; use
/// `JournalOptions::default()` unless a test or deployment needs otherwise.
#[derive(Clone, Default)]
pub struct JournalOptions {
    pub election_timeout_min: Option<Duration>,
    pub election_timeout_max: Option<Duration>,
    /// Per-request timeout for engine interactions.
    pub request_timeout: Option<Duration>,
    /// Sleep between catch-up attempts when the engine is not ready.
    pub catchup_retry_wait: Option<Duration>,
    /// How long catch-up will wait for an in-progress snapshot to finish.
    pub snapshot_wait_timeout: Option<Duration>,
    /// Largest single journal entry the writer accepts.
    pub max_entry_bytes: Option<usize>,
    /// Writer backpressure bound on un-committed bytes.
    pub max_inflight_bytes: Option<usize>,
    /// Queue depth of the async journal writer.
    pub writer_queue_depth: Option<usize>,
}

pub(crate) struct JournalOptionsValidated {
    pub election_timeout_min: Duration,
    pub election_timeout_max: Duration,
    pub request_timeout: Duration,
    pub catchup_retry_wait: Duration,
    pub snapshot_wait_timeout: Duration,
    pub max_entry_bytes: usize,
    pub max_inflight_bytes: usize,
    pub writer_queue_depth: usize,
}

impl JournalOptionsValidated {
    /// Resolves defaults (cluster-size aware) and validates. A single-peer
    /// cluster gets a shortened election timeout unless the operator set
    /// one explicitly.
    pub fn for_cluster(options: JournalOptions, cluster_size: usize) -> Result<Self, &'static str> {
        let (default_min, default_max) = if cluster_size == 1 {
            (SINGLE_PEER_ELECTION_TIMEOUT, SINGLE_PEER_ELECTION_TIMEOUT * 2)
        } else {
            (Duration::from_secs(10), Duration::from_secs(20))
        };

        let values = JournalOptionsValidated {
            election_timeout_min: options.election_timeout_min.unwrap_or(default_min),
            election_timeout_max: options.election_timeout_max.unwrap_or(default_max),
            request_timeout: options.request_timeout.unwrap_or(Duration::from_secs(5)),
            catchup_retry_wait: options.catchup_retry_wait.unwrap_or(Duration::from_secs(1)),
            snapshot_wait_timeout: options
                .snapshot_wait_timeout
                .unwrap_or(Duration::from_secs(600)),
            max_entry_bytes: options.max_entry_bytes.unwrap_or(10 * 1024 * 1024),
            max_inflight_bytes: options.max_inflight_bytes.unwrap_or(64 * 1024 * 1024),
            writer_queue_depth: options.writer_queue_depth.unwrap_or(4096),
        };

        values.validate()?;
        Ok(values)
    }

    fn validate(&self) -> Result<(), &'static str> {
        if self.election_timeout_min >= self.election_timeout_max {
            return Err("Minimum election timeout must be less than the maximum");
        }
        if self.request_timeout.is_zero() {
            return Err("Request timeout must be nonzero");
        }
        if self.max_entry_bytes > self.max_inflight_bytes {
            return Err("A single entry must fit within the in-flight byte bound");
        }
        if self.writer_queue_depth == 0 {
            return Err("Writer queue depth must be nonzero");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid_for_any_cluster_size() {
        for size in [1, 3, 5] {
            JournalOptionsValidated::for_cluster(JournalOptions::default(), size).unwrap();
        }
    }

    #[test]
    fn single_peer_cluster_shortens_election_timeout() {
        let v = JournalOptionsValidated::for_cluster(JournalOptions::default(), 1).unwrap();
        assert_eq!(v.election_timeout_min, Duration::from_millis(500));
        assert_eq!(v.election_timeout_max, Duration::from_millis(1000));

        let v = JournalOptionsValidated::for_cluster(JournalOptions::default(), 3).unwrap();
        assert!(v.election_timeout_min >= Duration::from_secs(1));
    }

    #[test]
    fn explicit_timeouts_override_single_peer_default() {
        let options = JournalOptions {
            election_timeout_min: Some(Duration::from_secs(2)),
            election_timeout_max: Some(Duration::from_secs(4)),
            ..Default::default()
        };
        let v = JournalOptionsValidated::for_cluster(options, 1).unwrap();
        assert_eq!(v.election_timeout_min, Duration::from_secs(2));
    }

    #[test]
    fn inverted_timeouts_are_rejected() {
        let options = JournalOptions {
            election_timeout_min: Some(Duration::from_secs(4)),
            election_timeout_max: Some(Duration::from_secs(2)),
            ..Default::default()
        };
        assert!(JournalOptionsValidated::for_cluster(options, 3).is_err());
    }

    #[test]
    fn entry_larger_than_inflight_bound_is_rejected() {
        let options = JournalOptions {
            max_entry_bytes: Some(1024),
            max_inflight_bytes: Some(512),
            ..Default::default()
        };
        assert!(JournalOptionsValidated::for_cluster(options, 3).is_err());
    }
}
