// ── Request/response correlation ──
//
// Outbound requests are keyed by (device, command, transId). The transId
// is a rolling u8 per (device, command) that skips ids still in flight.
// A pending entry is settled exactly once: whoever removes it from the
// map (the response path or the deadline path) owns the outcome.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::debug;

use crate::error::CoreError;
use crate::model::{DeviceId, StatusCode};
use crate::wire::Command;

/// A device's answer to a request.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub status: StatusCode,
    pub data: Option<Value>,
}

impl Reply {
    pub fn new(status: StatusCode, data: Option<Value>) -> Self {
        Self { status, data }
    }

    pub fn is_good(&self) -> bool {
        self.status.is_good()
    }
}

type PendingKey = (DeviceId, Command, u8);

struct PendingEntry {
    seq: u64,
    tx: oneshot::Sender<Reply>,
}

#[derive(Default)]
pub(crate) struct Correlator {
    pending: DashMap<PendingKey, PendingEntry>,
    counters: DashMap<(DeviceId, Command), u8>,
    seq: AtomicU64,
}

impl Correlator {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Reserve a transaction id and register the pending entry.
    pub(crate) fn open(
        &self,
        device_id: &DeviceId,
        command: Command,
    ) -> Result<PendingTicket<'_>, CoreError> {
        let (tx, rx) = oneshot::channel();
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);

        // Every insert for this (device, command) happens under the counter's
        // entry lock, so the probe-then-insert below cannot race.
        let mut counter = self
            .counters
            .entry((device_id.clone(), command))
            .or_insert(0);
        let start = *counter;
        for offset in 0..=u8::MAX {
            let trans_id = start.wrapping_add(offset);
            let key = (device_id.clone(), command, trans_id);
            if self.pending.contains_key(&key) {
                continue;
            }
            self.pending.insert(key.clone(), PendingEntry { seq, tx });
            *counter = trans_id.wrapping_add(1);
            return Ok(PendingTicket {
                correlator: self,
                key,
                seq,
                rx,
                settled: false,
            });
        }

        Err(CoreError::TooManyPending {
            device_id: device_id.clone(),
            command,
        })
    }

    /// Route a response to its pending request. Returns `true` on a match.
    pub(crate) fn deliver(
        &self,
        device_id: &DeviceId,
        command: Command,
        trans_id: u64,
        reply: Reply,
    ) -> bool {
        let Ok(trans_id) = u8::try_from(trans_id) else {
            return false;
        };
        match self.pending.remove(&(device_id.clone(), command, trans_id)) {
            Some((_, entry)) => entry.tx.send(reply).is_ok(),
            None => false,
        }
    }

    /// Drop every pending request for a device; waiters see `Cancelled`.
    pub(crate) fn cancel_device(&self, device_id: &DeviceId) {
        let before = self.pending.len();
        self.pending.retain(|(id, _, _), _| id != device_id);
        self.counters.retain(|(id, _), _| id != device_id);
        let dropped = before.saturating_sub(self.pending.len());
        if dropped > 0 {
            debug!(device_id = %device_id, dropped, "cancelled pending requests");
        }
    }

    #[cfg(test)]
    fn pending_for(&self, device_id: &DeviceId) -> usize {
        self.pending
            .iter()
            .filter(|e| e.key().0 == *device_id)
            .count()
    }

    fn remove_own(&self, key: &PendingKey, seq: u64) -> bool {
        self.pending.remove_if(key, |_, e| e.seq == seq).is_some()
    }
}

// ── PendingTicket ────────────────────────────────────────────────────

/// A registered, not yet settled request. Dropping it clears the entry.
pub(crate) struct PendingTicket<'a> {
    correlator: &'a Correlator,
    key: PendingKey,
    seq: u64,
    rx: oneshot::Receiver<Reply>,
    settled: bool,
}

impl PendingTicket<'_> {
    pub(crate) fn trans_id(&self) -> u8 {
        self.key.2
    }

    /// Withdraw the request, e.g. after a failed publish.
    pub(crate) fn abandon(mut self) {
        self.correlator.remove_own(&self.key, self.seq);
        self.settled = true;
    }

    /// Wait for the reply until `timeout` elapses.
    pub(crate) async fn wait(mut self, timeout: Duration) -> Result<Reply, CoreError> {
        let (device_id, command, _) = self.key.clone();
        let outcome = match tokio::time::timeout(timeout, &mut self.rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(CoreError::Cancelled { device_id, command }),
            Err(_) if self.correlator.remove_own(&self.key, self.seq) => Err(CoreError::Timeout {
                device_id,
                command,
                timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            }),
            // The response path took the entry first; its send is imminent.
            Err(_) => (&mut self.rx)
                .await
                .map_err(|_| CoreError::Cancelled { device_id, command }),
        };
        self.settled = true;
        outcome
    }
}

impl Drop for PendingTicket<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.correlator.remove_own(&self.key, self.seq);
        }
    }
}
