//! Device snapshot
//!
//! The latest raw value of every polled register, with the time it was read.
//! A snapshot is immutable once published; the controller builds the next one
//! off to the side and swaps it in, so readers never see a half-updated cycle.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::registers::{Field, SemanticValue};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterEntry {
    pub raw: u16,
    pub updated_at: Instant,
}

/// Decoded field value as seen by consumers
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldReading {
    pub field: &'static str,
    pub value: SemanticValue,
    pub unit: Option<&'static str>,
    /// Older than the freshness threshold; consumers show it as unavailable
    pub stale: bool,
    #[serde(skip)]
    pub updated_at: Instant,
}

impl FieldReading {
    /// Value, or `Unavailable` when stale
    pub fn current(&self) -> SemanticValue {
        if self.stale {
            SemanticValue::Unavailable
        } else {
            self.value.clone()
        }
    }
}

/// Registers as of one poll cycle
#[derive(Debug, Clone, Default)]
pub struct DeviceSnapshot {
    entries: BTreeMap<u16, RegisterEntry>,
    cycle: u64,
    captured_at: Option<DateTime<Utc>>,
}

impl DeviceSnapshot {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Poll cycle that produced this snapshot (0 before the first cycle)
    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    /// Wall-clock time of publication
    pub fn captured_at(&self) -> Option<DateTime<Utc>> {
        self.captured_at
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn raw(&self, address: u16) -> Option<u16> {
        self.entries.get(&address).map(|e| e.raw)
    }

    /// All words of `field` with the oldest of their timestamps
    pub fn words(&self, field: &Field) -> Option<(Vec<u16>, Instant)> {
        let mut words = Vec::with_capacity(field.words() as usize);
        let mut oldest: Option<Instant> = None;
        for address in field.address..field.address + field.words() {
            let entry = self.entries.get(&address)?;
            words.push(entry.raw);
            oldest = Some(oldest.map_or(entry.updated_at, |t| t.min(entry.updated_at)));
        }
        oldest.map(|t| (words, t))
    }

    /// Decode `field`; `None` until its registers have been read once
    pub fn reading(&self, field: &Field, now: Instant, freshness: Duration) -> Option<FieldReading> {
        let (words, updated_at) = self.words(field)?;
        Some(FieldReading {
            field: field.name,
            value: field.decode.decode(&words),
            unit: field.unit,
            stale: now.saturating_duration_since(updated_at) > freshness,
            updated_at,
        })
    }

    /// Next snapshot: keeps every entry, to be overwritten by this cycle's reads
    pub(crate) fn next_cycle(&self) -> Self {
        Self {
            entries: self.entries.clone(),
            cycle: self.cycle + 1,
            captured_at: self.captured_at,
        }
    }

    pub(crate) fn record_block(&mut self, start: u16, values: &[u16], at: Instant) {
        for (offset, raw) in values.iter().enumerate() {
            self.entries.insert(
                start + offset as u16,
                RegisterEntry {
                    raw: *raw,
                    updated_at: at,
                },
            );
        }
    }

    pub(crate) fn mark_captured(&mut self) {
        self.captured_at = Some(Utc::now());
    }
}

/// Single-writer, many-reader holder of the current snapshot
#[derive(Debug, Default)]
pub struct SnapshotStore {
    current: RwLock<Arc<DeviceSnapshot>>,
}

impl SnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cheap handle to the current snapshot
    pub fn load(&self) -> Arc<DeviceSnapshot> {
        self.current.read().clone()
    }

    /// Replace the current snapshot wholesale
    pub fn publish(&self, snapshot: DeviceSnapshot) {
        *self.current.write() = Arc::new(snapshot);
    }

    /// Drop every entry (link teardown); the cycle counter carries on
    pub fn reset(&self) {
        let mut current = self.current.write();
        let cycle = current.cycle;
        *current = Arc::new(DeviceSnapshot {
            cycle,
            ..DeviceSnapshot::default()
        });
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::registers::field;

    #[tokio::test(start_paused = true)]
    async fn test_reading_and_staleness() {
        let mut snapshot = DeviceSnapshot::empty().next_cycle();
        let t0 = Instant::now();
        snapshot.record_block(4081, &[215, 9999], t0);

        let outside = field("outside_temperature").unwrap();
        let reading = snapshot
            .reading(outside, t0, Duration::from_secs(90))
            .unwrap();
        assert_eq!(reading.value, SemanticValue::Float(21.5));
        assert!(!reading.stale);

        tokio::time::advance(Duration::from_secs(91)).await;
        let reading = snapshot
            .reading(outside, Instant::now(), Duration::from_secs(90))
            .unwrap();
        assert!(reading.stale);
        assert_eq!(reading.current(), SemanticValue::Unavailable);

        assert!(snapshot
            .reading(field("supply_temperature").unwrap(), t0, Duration::from_secs(90))
            .is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_multi_word_requires_all_words() {
        let mut snapshot = DeviceSnapshot::empty();
        snapshot.record_block(4113, &[0], Instant::now());
        assert!(snapshot.words(field("operating_hours").unwrap()).is_none());
        snapshot.record_block(4114, &[7], Instant::now());
        let (words, _) = snapshot.words(field("operating_hours").unwrap()).unwrap();
        assert_eq!(words, vec![0, 7]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_publish_is_atomic_replace() {
        let store = SnapshotStore::new();
        let before = store.load();
        assert_eq!(before.cycle(), 0);

        let mut next = before.next_cycle();
        next.record_block(8000, &[1, 2, 200, 2], Instant::now());
        store.publish(next);

        // earlier handle is untouched
        assert!(before.is_empty());
        let after = store.load();
        assert_eq!(after.cycle(), 1);
        assert_eq!(after.raw(8002), Some(200));

        store.reset();
        assert!(store.load().is_empty());
        assert_eq!(store.load().cycle(), 1);
    }
}
