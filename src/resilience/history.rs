use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

use crate::error::ErrorKind;

/// One classified failure
#[derive(Debug, Clone)]
pub struct ErrorRecord {
    /// Insertion order, never reused
    pub seq: u64,
    pub kind: ErrorKind,
    pub message: String,
    pub at: Instant,
}

/// Bounded, time-ordered error log.
///
/// Entries are only evicted by the size bound; the window merely limits
/// which entries count when looking for patterns.
#[derive(Debug)]
pub struct ErrorHistory {
    entries: VecDeque<ErrorRecord>,
    capacity: usize,
    window: Duration,
    next_seq: u64,
}

impl ErrorHistory {
    pub fn new(capacity: usize, window: Duration) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
            window,
            next_seq: 0,
        }
    }

    /// Append an entry and return its sequence number
    pub fn record(&mut self, kind: ErrorKind, message: impl Into<String>, at: Instant) -> u64 {
        if self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.push_back(ErrorRecord {
            seq,
            kind,
            message: message.into(),
            at,
        });
        seq
    }

    /// Errors matching `filter` inside the window ending at `now`, limited
    /// to entries recorded after sequence number `after` when given
    pub fn count_recent(
        &self,
        now: Instant,
        after: Option<u64>,
        filter: impl Fn(ErrorKind) -> bool,
    ) -> usize {
        self.entries
            .iter()
            .filter(|e| now.saturating_duration_since(e.at) <= self.window)
            .filter(|e| after.map_or(true, |seq| e.seq > seq))
            .filter(|e| filter(e.kind))
            .count()
    }

    /// Sequence number of the newest entry
    pub fn last_seq(&self) -> Option<u64> {
        self.next_seq.checked_sub(1)
    }

    pub fn latest(&self) -> Option<&ErrorRecord> {
        self.entries.back()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ErrorRecord> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_evicts_oldest() {
        let mut history = ErrorHistory::new(10, Duration::from_secs(60));
        let t0 = Instant::now();
        for i in 0..15 {
            history.record(ErrorKind::Network, format!("e{}", i), t0);
        }
        assert_eq!(history.len(), 10);
        assert_eq!(history.iter().next().map(|e| e.message.as_str()), Some("e5"));
        assert_eq!(history.latest().map(|e| e.message.as_str()), Some("e14"));
    }

    #[test]
    fn test_window_and_watermark_filters() {
        let mut history = ErrorHistory::new(10, Duration::from_secs(60));
        let t0 = Instant::now();
        history.record(ErrorKind::Network, "old", t0);
        let mid = history.record(ErrorKind::WebSocket, "mid", t0 + Duration::from_secs(30));
        history.record(ErrorKind::AudioContext, "audio", t0 + Duration::from_secs(61));

        let now = t0 + Duration::from_secs(70);
        // "old" fell out of the window but is still retained
        assert_eq!(history.len(), 3);
        assert_eq!(history.count_recent(now, None, |k| k.is_channel()), 1);
        assert_eq!(
            history.count_recent(now, Some(mid), |k| k.is_channel()),
            0
        );
        assert_eq!(
            history.count_recent(now, None, |k| k == ErrorKind::AudioContext),
            1
        );
    }
}
