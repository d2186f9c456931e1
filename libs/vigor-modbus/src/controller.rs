//! Synchronization controller
//!
//! Polls the register map on a fixed cadence, publishes each cycle as one
//! snapshot, and reconciles readbacks with the commands callers have issued.
//!
//! Per writable field:
//! - `Uninitialized` until the first successful poll
//! - `Synced` while no write is outstanding
//! - `PendingWrite` from submission until the write is acknowledged (write
//!   response or matching readback), superseded or failed
//!
//! When a readback of the volatile command range (8000-8011) diverges from the
//! last acknowledged command for `divergence_cycles` cycles, the command is
//! written again, once per divergence. Other ranges adopt the device value.

use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::error::{Result, VigorError};
use crate::pdu::Request;
use crate::registers::{self, PollBlock};
use crate::scheduler::BusHandle;
use crate::snapshot::{DeviceSnapshot, SnapshotStore};

/// Synchronization state of one writable field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum FieldState {
    Uninitialized,
    Synced,
    PendingWrite { value: u16, seq: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteOrigin {
    Caller,
    Reassert,
}

#[derive(Debug, Clone, Copy)]
struct PendingWrite {
    value: u16,
    seq: u64,
    origin: WriteOrigin,
}

#[derive(Debug, Default)]
struct AddressLedger {
    pending: Option<PendingWrite>,
    /// Last command the device acknowledged
    commanded: Option<u16>,
    /// Consecutive cycles the readback differed from `commanded`
    diverged_cycles: u32,
    /// Reassert already issued for the current divergence
    reasserted: bool,
}

/// Commands issued through the engine, keyed by register address
#[derive(Debug, Default)]
pub struct WriteLedger {
    next_seq: u64,
    addresses: BTreeMap<u16, AddressLedger>,
}

impl WriteLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a caller write; returns its sequence number
    pub fn begin(&mut self, address: u16, value: u16) -> u64 {
        self.begin_with(address, value, WriteOrigin::Caller)
    }

    /// Record a reassert of `value`, unless a caller write got there first
    fn begin_reassert(&mut self, address: u16, value: u16) -> Option<u64> {
        let entry = self.addresses.get(&address)?;
        if entry.pending.is_some() || entry.commanded != Some(value) {
            return None;
        }
        Some(self.begin_with(address, value, WriteOrigin::Reassert))
    }

    fn begin_with(&mut self, address: u16, value: u16, origin: WriteOrigin) -> u64 {
        self.next_seq += 1;
        let seq = self.next_seq;
        self.addresses.entry(address).or_default().pending = Some(PendingWrite {
            value,
            seq,
            origin,
        });
        seq
    }

    /// Device accepted write `seq`
    pub fn acknowledge(&mut self, address: u16, seq: u64) {
        let Some(entry) = self.addresses.get_mut(&address) else {
            return;
        };
        let Some(pending) = entry.pending.filter(|p| p.seq == seq) else {
            return;
        };
        entry.pending = None;
        entry.commanded = Some(pending.value);
        entry.diverged_cycles = 0;
        if pending.origin == WriteOrigin::Caller {
            entry.reasserted = false;
        }
    }

    /// Write `seq` failed or was superseded
    pub fn abandon(&mut self, address: u16, seq: u64) {
        if let Some(entry) = self.addresses.get_mut(&address) {
            if entry.pending.is_some_and(|p| p.seq == seq) {
                entry.pending = None;
            }
        }
    }

    pub fn commanded(&self, address: u16) -> Option<u16> {
        self.addresses.get(&address).and_then(|e| e.commanded)
    }

    pub fn state(&self, address: u16, snapshot: &DeviceSnapshot) -> FieldState {
        if let Some(p) = self.addresses.get(&address).and_then(|e| e.pending) {
            return FieldState::PendingWrite {
                value: p.value,
                seq: p.seq,
            };
        }
        if snapshot.raw(address).is_some() {
            FieldState::Synced
        } else {
            FieldState::Uninitialized
        }
    }

    /// Compare a fresh snapshot with acknowledged commands
    ///
    /// Returns the `(address, value)` commands to reassert.
    pub fn reconcile(&mut self, snapshot: &DeviceSnapshot, divergence_cycles: u32) -> Vec<(u16, u16)> {
        let mut reassert = Vec::new();
        for (address, entry) in self.addresses.iter_mut() {
            let Some(readback) = snapshot.raw(*address) else {
                continue;
            };

            if let Some(pending) = entry.pending {
                if readback == pending.value {
                    debug!("Readback of {} confirms pending write", address);
                    entry.pending = None;
                    entry.commanded = Some(pending.value);
                    entry.diverged_cycles = 0;
                }
                continue;
            }

            let Some(commanded) = entry.commanded else {
                continue;
            };
            if readback == commanded {
                entry.diverged_cycles = 0;
                entry.reasserted = false;
                continue;
            }

            entry.diverged_cycles += 1;
            if entry.diverged_cycles < divergence_cycles || entry.reasserted {
                continue;
            }

            let volatile = registers::RangeClass::of(*address).is_some_and(|c| c.is_volatile());
            if volatile {
                warn!(
                    "Register {} reads {} but {} was commanded; reasserting",
                    address, readback, commanded
                );
                entry.reasserted = true;
                reassert.push((*address, commanded));
            } else {
                info!(
                    "Register {} changed on the device ({} -> {}); adopting",
                    address, commanded, readback
                );
                entry.commanded = None;
                entry.diverged_cycles = 0;
            }
        }
        reassert
    }
}

/// Poll loop counters
#[derive(Debug, Default)]
pub struct SyncStats {
    pub cycles: AtomicU64,
    pub failed_cycles: AtomicU64,
    pub consecutive_failures: AtomicU32,
    pub reassertions: AtomicU64,
    pub backed_off: AtomicBool,
}

pub(crate) type RefreshRequest = oneshot::Sender<Result<()>>;

/// Owner of the poll cadence and the only writer of the snapshot
pub(crate) struct SyncController {
    bus: BusHandle,
    store: Arc<SnapshotStore>,
    ledger: Arc<Mutex<WriteLedger>>,
    stats: Arc<SyncStats>,
    config: SyncConfig,
    blocks: Vec<PollBlock>,
    refresh_rx: mpsc::Receiver<RefreshRequest>,
    cancel: CancellationToken,
}

impl SyncController {
    pub(crate) fn new(
        bus: BusHandle,
        store: Arc<SnapshotStore>,
        ledger: Arc<Mutex<WriteLedger>>,
        stats: Arc<SyncStats>,
        config: SyncConfig,
        refresh_rx: mpsc::Receiver<RefreshRequest>,
        cancel: CancellationToken,
    ) -> Self {
        let blocks = registers::poll_blocks(config.max_block_gap);
        debug!("Polling {} blocks", blocks.len());
        Self {
            bus,
            store,
            ledger,
            stats,
            config,
            blocks,
            refresh_rx,
            cancel,
        }
    }

    pub(crate) async fn run(mut self) {
        let mut period = self.config.poll_interval();
        let mut ticker = interval_at(Instant::now(), period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            let refresh = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                request = self.refresh_rx.recv() => request,
                _ = ticker.tick() => None,
            };

            let cancel = self.cancel.clone();
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(VigorError::EngineClosed),
                result = self.poll_cycle() => result,
            };
            let closed = outcome == Err(VigorError::EngineClosed);
            self.record_outcome(&outcome);
            let refreshed = refresh.is_some();
            if let Some(reply) = refresh {
                let _ = reply.send(outcome);
            }
            if closed {
                break;
            }

            let wanted = if self.stats.backed_off.load(Ordering::Relaxed) {
                self.config.backoff_interval()
            } else {
                self.config.poll_interval()
            };
            if wanted != period {
                period = wanted;
                ticker = interval_at(Instant::now() + period, period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            } else if refreshed {
                // a manual refresh counts as this period's poll
                ticker.reset();
            }
        }
        debug!("Poll loop stopped");
    }

    fn record_outcome(&self, outcome: &Result<()>) {
        match outcome {
            Ok(()) => {
                self.stats.consecutive_failures.store(0, Ordering::Relaxed);
                if self.stats.backed_off.swap(false, Ordering::Relaxed) {
                    info!("Communication restored");
                }
            },
            Err(VigorError::EngineClosed) => {},
            Err(e) => {
                if !self.bus.is_link_up() && !self.store.load().is_empty() {
                    debug!("Link down, clearing snapshot");
                    self.store.reset();
                }
                self.stats.failed_cycles.fetch_add(1, Ordering::Relaxed);
                let failures = self.stats.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                warn!("Poll cycle failed ({} in a row): {}", failures, e);
                if failures >= self.config.failures_before_backoff
                    && !self.stats.backed_off.swap(true, Ordering::Relaxed)
                {
                    warn!(
                        "{} consecutive failures, slowing polls to {}s",
                        failures,
                        self.config.backoff_interval().as_secs()
                    );
                }
            },
        }
    }

    /// Read every block, publish the snapshot, reassert diverged commands
    ///
    /// The basic block goes first; when it fails the cycle ends there.
    async fn poll_cycle(&self) -> Result<()> {
        let (basic, rest): (Vec<PollBlock>, Vec<PollBlock>) =
            self.blocks.iter().copied().partition(|block| block.is_basic());

        let mut next = self.store.load().next_cycle();
        for block in &basic {
            let values = self
                .bus
                .submit(block.request())
                .await
                .and_then(|response| response.into_registers())?;
            next.record_block(block.start, &values, Instant::now());
        }

        let reads = rest.into_iter().map(|block| {
            let bus = self.bus.clone();
            async move { (block, bus.submit(block.request()).await) }
        });
        let results = join_all(reads).await;

        let now = Instant::now();
        let mut failed = 0usize;
        for (block, result) in results {
            match result.and_then(|response| response.into_registers()) {
                Ok(values) => next.record_block(block.start, &values, now),
                Err(e) => {
                    failed += 1;
                    debug!("Block {}+{} failed: {}", block.start, block.count, e);
                },
            }
        }
        if failed > 0 {
            warn!("{} of {} blocks failed this cycle", failed, self.blocks.len());
        }

        next.mark_captured();
        let reassert = self
            .ledger
            .lock()
            .reconcile(&next, self.config.divergence_cycles);
        self.store.publish(next);
        self.stats.cycles.fetch_add(1, Ordering::Relaxed);

        for (address, value) in reassert {
            self.reassert(address, value).await;
        }
        Ok(())
    }

    async fn reassert(&self, address: u16, value: u16) {
        let Some(seq) = self.ledger.lock().begin_reassert(address, value) else {
            debug!("Reassert of {}={} dropped for a newer caller write", address, value);
            return;
        };
        self.stats.reassertions.fetch_add(1, Ordering::Relaxed);

        let result = self
            .bus
            .submit(Request::WriteSingleRegister { address, value })
            .await;
        let mut ledger = self.ledger.lock();
        match result {
            Ok(_) => {
                info!("Reasserted {}={}", address, value);
                ledger.acknowledge(address, seq);
            },
            Err(e) => {
                warn!("Reassert of {}={} failed: {}", address, value, e);
                ledger.abandon(address, seq);
            },
        }
    }
}
