use std::{collections::HashMap, time::Duration};

/// Delivered-message ids plus the highest delivered timestamp.
///
/// The watermark never moves backwards. Ids are kept for the whole session
/// unless a retention window is configured, in which case ids older than
/// `watermark - retention` are dropped; those can no longer pass the
/// watermark test anyway.
#[derive(Debug, Default)]
pub struct DedupIndex {
    seen: HashMap<String, i64>,
    watermark_ms: i64,
    retention_ms: Option<i64>,
}

impl DedupIndex {
    pub fn new(retention: Option<Duration>) -> Self {
        Self {
            seen: HashMap::new(),
            watermark_ms: 0,
            retention_ms: retention.map(|r| i64::try_from(r.as_millis()).unwrap_or(i64::MAX)),
        }
    }

    pub fn watermark_ms(&self) -> i64 {
        self.watermark_ms
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.seen.contains_key(id)
    }

    /// Records `id` if it is newer than `floor_ms` and unseen. Returns whether
    /// the message should be delivered.
    ///
    /// The floor is never lower than the retention cutoff, so a poll window
    /// opened before a prune cannot re-admit an evicted id.
    pub fn admit(&mut self, id: &str, sent_at_ms: i64, floor_ms: i64) -> bool {
        let floor_ms = floor_ms.max(self.retention_cutoff_ms());
        if sent_at_ms <= floor_ms || self.seen.contains_key(id) {
            return false;
        }
        self.seen.insert(id.to_string(), sent_at_ms);
        true
    }

    pub fn advance(&mut self, sent_at_ms: i64) {
        if sent_at_ms <= self.watermark_ms {
            return;
        }
        self.watermark_ms = sent_at_ms;
        if self.retention_ms.is_some() {
            let cutoff = self.retention_cutoff_ms();
            self.seen.retain(|_, seen_at| *seen_at >= cutoff);
        }
    }

    fn retention_cutoff_ms(&self) -> i64 {
        match self.retention_ms {
            Some(retention_ms) => self.watermark_ms.saturating_sub(retention_ms),
            None => i64::MIN,
        }
    }

    /// Single-message form of admit-then-advance against the current watermark.
    pub fn observe(&mut self, id: &str, sent_at_ms: i64) -> bool {
        let admitted = self.admit(id, sent_at_ms, self.watermark_ms);
        if admitted {
            self.advance(sent_at_ms);
        }
        admitted
    }

    pub fn reset(&mut self) {
        self.seen.clear();
        self.watermark_ms = 0;
    }
}

/// Per-poll view: newness is judged against the watermark as it stood when the
/// poll started, and the highest admitted timestamp is applied at the end.
#[derive(Debug, Clone, Copy)]
pub struct PollWindow {
    floor_ms: i64,
    high_ms: i64,
}

impl PollWindow {
    pub fn open(index: &DedupIndex) -> Self {
        Self {
            floor_ms: index.watermark_ms(),
            high_ms: index.watermark_ms(),
        }
    }

    pub fn floor_ms(&self) -> i64 {
        self.floor_ms
    }

    pub fn admit(&mut self, index: &mut DedupIndex, id: &str, sent_at_ms: i64) -> bool {
        let admitted = index.admit(id, sent_at_ms, self.floor_ms);
        if admitted {
            self.high_ms = self.high_ms.max(sent_at_ms);
        }
        admitted
    }

    pub fn close(self, index: &mut DedupIndex) {
        index.advance(self.high_ms);
    }
}

#[cfg(test)]
#[path = "tests/watermark_tests.rs"]
mod tests;
