// ── Liveness timers ──
//
// Per-node timer handles. Each timer is a spawned task watching its own
// `CancellationToken`; the tokens are children of the node's root token,
// which in turn is a child of the shepherd's. Rearming swaps in a fresh
// token and cancels the previous one.
//
// Fire paths run after the `select!`, so cancelling a timer that has
// already fired never interrupts the work it started.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::CoreError;
use crate::model::DeviceStatus;
use crate::node::DeviceNode;

/// Timing of the sleep ladder.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SleepLadder {
    pub(crate) margin: Duration,
    pub(crate) retry_interval: Duration,
    pub(crate) attempts: u32,
}

pub(crate) struct LivenessTimers {
    root: CancellationToken,
    life: ArcSwapOption<CancellationToken>,
    sleep: ArcSwapOption<CancellationToken>,
}

impl LivenessTimers {
    pub(crate) fn new(root: CancellationToken) -> Self {
        Self {
            root,
            life: ArcSwapOption::empty(),
            sleep: ArcSwapOption::empty(),
        }
    }

    // ── Life checker ─────────────────────────────────────────────────

    /// (Re)arm the single-shot lifetime timer. A zero lifetime disarms it.
    pub(crate) fn arm_life(&self, node: &Arc<DeviceNode>, lifetime: Duration) {
        if self.root.is_cancelled() {
            return;
        }
        if lifetime.is_zero() {
            self.cancel_life();
            return;
        }
        let token = self.swap_in(&self.life);
        tokio::spawn(life_check(Arc::clone(node), lifetime, token));
    }

    pub(crate) fn cancel_life(&self) {
        if let Some(old) = self.life.swap(None) {
            old.cancel();
        }
    }

    // ── Sleep checker ────────────────────────────────────────────────

    pub(crate) fn arm_sleep(
        &self,
        node: &Arc<DeviceNode>,
        duration: Duration,
        ladder: SleepLadder,
    ) {
        if self.root.is_cancelled() {
            return;
        }
        let token = self.swap_in(&self.sleep);
        tokio::spawn(sleep_check(Arc::clone(node), duration, ladder, token));
    }

    pub(crate) fn cancel_sleep(&self) {
        if let Some(old) = self.sleep.swap(None) {
            old.cancel();
        }
    }

    pub(crate) fn sleep_armed(&self) -> bool {
        self.sleep
            .load()
            .as_ref()
            .is_some_and(|token| !token.is_cancelled())
    }

    /// Disarm everything for good.
    pub(crate) fn shutdown(&self) {
        self.root.cancel();
        self.life.store(None);
        self.sleep.store(None);
    }

    fn swap_in(&self, slot: &ArcSwapOption<CancellationToken>) -> CancellationToken {
        let token = self.root.child_token();
        if let Some(old) = slot.swap(Some(Arc::new(token.clone()))) {
            old.cancel();
        }
        token
    }
}

// ── Timer tasks ──────────────────────────────────────────────────────

async fn life_check(node: Arc<DeviceNode>, lifetime: Duration, token: CancellationToken) {
    tokio::select! {
        biased;
        () = token.cancelled() => return,
        () = tokio::time::sleep(lifetime) => {}
    }

    debug!(device_id = %node.id(), lifetime_secs = lifetime.as_secs(), "lifetime expired");
    if let Err(e) = node.expire(&token).await {
        warn!(device_id = %node.id(), error = %e, "lifetime expiry failed");
    }
}

async fn sleep_check(
    node: Arc<DeviceNode>,
    duration: Duration,
    ladder: SleepLadder,
    token: CancellationToken,
) {
    tokio::select! {
        biased;
        () = token.cancelled() => return,
        () = tokio::time::sleep(duration + ladder.margin) => {}
    }

    let mut remaining = ladder.attempts.max(1);
    loop {
        let result = node.probe().await;
        if token.is_cancelled() {
            return;
        }

        match result {
            Err(CoreError::Timeout { .. } | CoreError::Transport(_)) => {
                remaining -= 1;
                debug!(device_id = %node.id(), remaining, "sleep probe unanswered");
                if remaining == 0 {
                    node.set_status(DeviceStatus::Offline);
                    return;
                }
            }
            Ok(_) => {
                node.set_status(DeviceStatus::Online);
                return;
            }
            Err(e) => {
                debug!(device_id = %node.id(), error = %e, "sleep ladder stopped");
                return;
            }
        }

        tokio::select! {
            biased;
            () = token.cancelled() => return,
            () = tokio::time::sleep(ladder.retry_interval) => {}
        }
    }
}
