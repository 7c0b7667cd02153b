//! The per-key limiter instance actor.
//!
//! One instance owns the fixed-window admission state for exactly one key.
//! All state lives inside a single cooperative loop; the only way in is the
//! instance's bounded mailbox, so no locking is needed. The instance leaves
//! the system through a handshake with its parent shard: it announces
//! `InstanceExpired` after three idle windows, keeps serving until the shard
//! answers with `Kill`, then drains its queue and reports `InstanceDied`.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::message::{
    Decision, InstanceMsg, InstanceSnapshot, LimiterConfig, PermissionRequest, ShardMsg, NO_CHANGE,
};

/// Upper bound on the mailbox, regardless of how large the window limit is.
const MAILBOX_CAP: i64 = 1_000;

/// Windows of inactivity after which an instance reports itself expired.
const IDLE_WINDOWS: i64 = 3;

/// Spawn a new instance actor for `key` and return its mailbox.
pub(super) fn spawn(
    key: String,
    config: LimiterConfig,
    parent: mpsc::Sender<ShardMsg>,
) -> mpsc::Sender<InstanceMsg> {
    let cap = config.max_requests_per_window.clamp(1, MAILBOX_CAP) as usize;
    let (tx, rx) = mpsc::channel(cap);

    let instance = Instance {
        key,
        config,
        n_approved_this_window: 0,
        n_denied_this_window: 0,
        time_last_used: Instant::now(),
        throttled: VecDeque::new(),
        mailbox: tx.clone(),
        parent,
    };
    tokio::spawn(instance.run(rx));

    tx
}

struct Instance {
    key: String,
    /// Private copy; per-request overrides and config updates mutate it.
    config: LimiterConfig,
    n_approved_this_window: i64,
    n_denied_this_window: i64,
    time_last_used: Instant,
    /// Requests that have been received but are waiting for a free window slot.
    throttled: VecDeque<PermissionRequest>,
    /// Clone of the instance's own mailbox, handed to the parent inside the
    /// expiry notification so the shard can match it against its registry.
    mailbox: mpsc::Sender<InstanceMsg>,
    parent: mpsc::Sender<ShardMsg>,
}

impl Instance {
    async fn run(mut self, mut rx: mpsc::Receiver<InstanceMsg>) {
        let mut ticker = new_ticker(self.config.window_millis);
        let mut expiry_notified = false;

        debug!(key = %self.key, "Started limiter instance");

        loop {
            tokio::select! {
                // Reset the window and flush waiters on every tick.
                _ = ticker.tick() => {
                    self.n_approved_this_window = 0;
                    self.n_denied_this_window = 0;
                    self.flush_queued(self.config.max_requests_per_window);

                    if self.time_last_used.elapsed() > self.idle_expiry() && !expiry_notified {
                        let _ = self.parent.send(ShardMsg::InstanceExpired {
                            key: self.key.clone(),
                            mailbox: self.mailbox.clone(),
                        }).await;
                        // At most one notification per lifetime: a slow shard
                        // would otherwise see duplicates racing its registry.
                        expiry_notified = true;
                    }
                }

                msg = rx.recv() => {
                    let Some(msg) = msg else { break };
                    match msg {
                        InstanceMsg::Permission(req) => self.handle_permission(req),

                        InstanceMsg::Release => {
                            self.time_last_used = Instant::now();
                            self.n_approved_this_window = (self.n_approved_this_window - 1).max(0);
                        }

                        InstanceMsg::ConfigUpdate(new_config) => {
                            if let Some(window_millis) = self.apply_config_update(new_config) {
                                ticker = new_ticker(window_millis);
                            }
                        }

                        InstanceMsg::GaveUp { req_id } => self.handle_gave_up(req_id),

                        InstanceMsg::Snapshot { resp } => {
                            let _ = resp.try_send(self.snapshot());
                        }

                        InstanceMsg::Kill => {
                            // Requests can still land here in the race between
                            // the expiry notice and the kill. Approve whatever
                            // is left rather than strand the waiters.
                            self.flush_queued(self.throttled.len() as i64);
                            let _ = self.parent.send(ShardMsg::InstanceDied {
                                key: self.key.clone(),
                            }).await;
                            break;
                        }
                    }
                }
            }
        }

        info!(key = %self.key, "Stopped limiter instance");
    }

    fn handle_permission(&mut self, req: PermissionRequest) {
        self.time_last_used = Instant::now();

        // Per-request overrides. The sentinel is the only guard here; policy
        // gating and bounds checks belong to the HTTP layer.
        if req.max_requests != NO_CHANGE {
            self.config.max_requests_per_window = req.max_requests;
        }
        if req.max_requests_in_queue != NO_CHANGE {
            self.config.max_requests_in_queue = req.max_requests_in_queue;
        }

        if self.n_approved_this_window >= self.config.max_requests_per_window {
            if req.can_wait && (self.throttled.len() as i64) < self.config.max_requests_in_queue {
                self.throttled.push_back(req);
            } else {
                self.n_denied_this_window += 1;
                let _ = req.resp.send(Decision::Denied);
            }
        } else {
            self.n_approved_this_window += 1;
            let _ = req.resp.send(Decision::Approved);
        }
    }

    /// Approve up to `n_max` waiters in FIFO order.
    fn flush_queued(&mut self, n_max: i64) {
        let n = (n_max.max(0) as usize).min(self.throttled.len());
        if n == 0 {
            return;
        }
        self.time_last_used = Instant::now();
        for req in self.throttled.drain(..n) {
            let _ = req.resp.send(Decision::Approved);
        }
        self.n_approved_this_window += n as i64;
    }

    /// Overlay a merged config onto the instance copy. Both `0` and
    /// [`NO_CHANGE`] leave a field untouched. Returns the new window length
    /// when it changed, so the caller can recreate the ticker.
    fn apply_config_update(&mut self, new_config: LimiterConfig) -> Option<i64> {
        let mut new_window = None;

        if new_config.window_millis != 0
            && new_config.window_millis != NO_CHANGE
            && new_config.window_millis != self.config.window_millis
        {
            debug!(key = %self.key, window_millis = new_config.window_millis, "Changing window length");
            self.config.window_millis = new_config.window_millis;
            new_window = Some(new_config.window_millis);
        }

        if new_config.max_requests_in_queue != 0
            && new_config.max_requests_in_queue != NO_CHANGE
            && new_config.max_requests_in_queue != self.config.max_requests_in_queue
        {
            self.config.max_requests_in_queue = new_config.max_requests_in_queue;
        }

        if new_config.max_requests_per_window != 0
            && new_config.max_requests_per_window != NO_CHANGE
            && new_config.max_requests_per_window != self.config.max_requests_per_window
        {
            self.config.max_requests_per_window = new_config.max_requests_per_window;
        }

        new_window
    }

    fn handle_gave_up(&mut self, req_id: u64) {
        match self.throttled.iter().position(|r| r.req_id == req_id) {
            Some(idx) => {
                // The caller is gone; no reply is owed.
                self.throttled.remove(idx);
            }
            None => {
                warn!(
                    key = %self.key,
                    req_id,
                    "Client gave up, but the request was not found in the queue"
                );
            }
        }
    }

    fn snapshot(&self) -> InstanceSnapshot {
        InstanceSnapshot {
            key: self.key.clone(),
            config: self.config,
            num_approved_this_window: self.n_approved_this_window,
            num_denied_this_window: self.n_denied_this_window,
            num_waiting: self.throttled.len(),
            found: true,
        }
    }

    fn idle_expiry(&self) -> Duration {
        Duration::from_millis((IDLE_WINDOWS * self.config.window_millis).max(0) as u64)
    }
}

fn new_ticker(window_millis: i64) -> time::Interval {
    let period = Duration::from_millis(window_millis.max(1) as u64);
    let mut ticker = time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker
}
