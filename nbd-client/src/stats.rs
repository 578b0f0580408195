//! Traffic counters for a connection.

/// Snapshot of a handle's traffic counters.
///
/// Bytes are counted on actual transport reads and writes; chunks once per
/// protocol frame (greeting, client flags, option request, option reply,
/// command request, simple reply, structured reply chunk).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    pub bytes_sent: u64,
    pub chunks_sent: u64,
    pub bytes_received: u64,
    pub chunks_received: u64,
}

impl Stats {
    pub(crate) fn record_sent_bytes(&mut self, n: usize) {
        self.bytes_sent += n as u64;
    }

    pub(crate) fn record_received_bytes(&mut self, n: usize) {
        self.bytes_received += n as u64;
    }

    pub(crate) fn record_sent_chunk(&mut self) {
        self.chunks_sent += 1;
    }

    pub(crate) fn record_received_chunk(&mut self) {
        self.chunks_received += 1;
    }

    /// Counters accumulated since `earlier`. Snapshots taken in the wrong
    /// order yield zero rather than wrapping.
    pub fn since(&self, earlier: &Stats) -> Stats {
        Stats {
            bytes_sent: self.bytes_sent.saturating_sub(earlier.bytes_sent),
            chunks_sent: self.chunks_sent.saturating_sub(earlier.chunks_sent),
            bytes_received: self.bytes_received.saturating_sub(earlier.bytes_received),
            chunks_received: self.chunks_received.saturating_sub(earlier.chunks_received),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero_and_accumulate() {
        let mut stats = Stats::default();
        assert_eq!(stats, Stats::default());

        let before = stats;
        stats.record_sent_bytes(28);
        stats.record_sent_chunk();
        stats.record_received_bytes(10);
        stats.record_received_bytes(6);
        stats.record_received_chunk();

        let delta = stats.since(&before);
        assert_eq!(delta.bytes_sent, 28);
        assert_eq!(delta.chunks_sent, 1);
        assert_eq!(delta.bytes_received, 16);
        assert_eq!(delta.chunks_received, 1);
    }

    #[test]
    fn since_with_swapped_snapshots_is_zero() {
        let earlier = Stats::default();
        let mut later = earlier;
        later.record_sent_bytes(28);
        later.record_received_chunk();

        assert_eq!(earlier.since(&later), Stats::default());
    }
}
