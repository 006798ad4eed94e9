//! Process-wide cluster time tracking.
use std::sync::Mutex;

use crate::bson::{Document, Timestamp};

/// The signed `$clusterTime` a server sent, with its ordering key.
#[derive(Clone, Debug)]
pub struct ClusterTime {
    pub timestamp: Timestamp,
    /// Full `$clusterTime` document, signature included, echoed back to
    /// servers verbatim.
    pub raw: Document,
}

impl ClusterTime {
    /// Extract from a reply's `$clusterTime` document.
    pub fn from_raw(raw: &Document) -> Option<ClusterTime> {
        let timestamp = raw.get_timestamp("clusterTime")?;
        Some(ClusterTime { timestamp, raw: raw.clone() })
    }
}

/// Latest observed cluster time, merged monotonically.
#[derive(Debug, Default)]
pub struct ClusterClock {
    inner: Mutex<Option<ClusterTime>>,
}

impl ClusterClock {
    pub fn new() -> ClusterClock {
        ClusterClock::default()
    }

    pub fn get(&self) -> Option<ClusterTime> {
        self.inner.lock().unwrap().clone()
    }

    /// Keep the greater of the held and observed times.
    pub fn advance(&self, next: ClusterTime) {
        let mut held = self.inner.lock().unwrap();
        match &*held {
            Some(current) if current.timestamp >= next.timestamp => {}
            _ => *held = Some(next),
        }
    }

    /// Advance from a reply's raw `$clusterTime` document.
    pub fn advance_raw(&self, raw: &Document) {
        if let Some(next) = ClusterTime::from_raw(raw) {
            self.advance(next);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::bson::doc;

    fn cluster_time(time: u32) -> Document {
        doc! { "clusterTime": (Timestamp { time, increment: 0 }) }
    }

    #[test]
    fn merge_is_monotone() {
        let clock = ClusterClock::new();
        clock.advance_raw(&cluster_time(5));
        clock.advance_raw(&cluster_time(3));
        clock.advance_raw(&cluster_time(7));
        assert_eq!(clock.get().unwrap().timestamp, Timestamp { time: 7, increment: 0 });
    }

    #[test]
    fn increment_breaks_ties() {
        let clock = ClusterClock::new();
        clock.advance(ClusterTime {
            timestamp: Timestamp { time: 5, increment: 2 },
            raw: cluster_time(5),
        });
        clock.advance(ClusterTime {
            timestamp: Timestamp { time: 5, increment: 1 },
            raw: cluster_time(5),
        });
        assert_eq!(clock.get().unwrap().timestamp.increment, 2);
    }

    #[test]
    fn empty_clock_accepts_first() {
        let clock = ClusterClock::new();
        assert!(clock.get().is_none());
        clock.advance_raw(&cluster_time(1));
        assert!(clock.get().is_some());
    }
}
