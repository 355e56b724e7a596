#![forbid(unsafe_code)]

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use mirra_core::{Backoff, MirraError, ObjectKey};
use rustc_hash::FxHashMap;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::reconciler::Action;

/// How one reconcile pass ended, as far as scheduling is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    /// The object is gone; same as success.
    NotFound,
    RequeueAfter(Duration),
    Transient,
    Fatal,
}

impl Outcome {
    pub fn from_result(result: &Result<Action, MirraError>) -> Self {
        match result {
            Ok(Action::Done) => Outcome::Success,
            Ok(Action::RequeueAfter(d)) => Outcome::RequeueAfter(*d),
            Err(MirraError::NotFound(_)) => Outcome::NotFound,
            Err(MirraError::Fatal(_)) => Outcome::Fatal,
            Err(MirraError::Transient(_) | MirraError::StaleVersion(_)) => Outcome::Transient,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Pending,
    Processing { dirty: bool },
    Waiting { at: Instant, seq: u64, requeue: bool },
}

#[derive(Debug)]
struct Entry {
    slot: Slot,
    failures: u32,
}

#[derive(Default)]
struct State {
    entries: FxHashMap<ObjectKey, Entry>,
    ready: VecDeque<ObjectKey>,
    timers: BTreeMap<(Instant, u64), ObjectKey>,
    next_seq: u64,
    shut: bool,
}

impl State {
    fn wait(&mut self, key: &ObjectKey, delay: Duration, requeue: bool) {
        let at = Instant::now() + delay;
        let seq = self.next_seq;
        self.next_seq += 1;
        if let Some(e) = self.entries.get_mut(key) {
            e.slot = Slot::Waiting { at, seq, requeue };
            self.timers.insert((at, seq), key.clone());
        }
    }

    fn promote_due(&mut self, now: Instant) {
        while let Some((&(at, seq), _)) = self.timers.first_key_value() {
            if at > now {
                break;
            }
            let Some(key) = self.timers.remove(&(at, seq)) else { break };
            if let Some(e) = self.entries.get_mut(&key) {
                e.slot = Slot::Pending;
                self.ready.push_back(key);
            }
        }
    }
}

/// Per-key scheduling state machine: at most one pass in flight per key,
/// deduplicated triggers, per-key exponential backoff and delayed requeues.
pub struct WorkQueue {
    state: Mutex<State>,
    notify: Notify,
    retry_base: Duration,
    retry_max: Duration,
}

impl WorkQueue {
    pub fn new(retry_base: Duration, retry_max: Duration) -> Self {
        Self { state: Mutex::new(State::default()), notify: Notify::new(), retry_base, retry_max: retry_max.max(retry_base) }
    }

    fn lock(&self) -> MutexGuard<'_, State> { self.state.lock().unwrap_or_else(PoisonError::into_inner) }

    /// Ask for a reconcile of `key`. Returns false once shut down.
    pub fn schedule(&self, key: ObjectKey) -> bool {
        let mut guard = self.lock();
        let st = &mut *guard;
        if st.shut {
            return false;
        }
        match st.entries.get_mut(&key) {
            None => {
                st.entries.insert(key.clone(), Entry { slot: Slot::Pending, failures: 0 });
                st.ready.push_back(key);
                self.notify.notify_one();
            }
            Some(e) => match e.slot {
                Slot::Pending | Slot::Waiting { requeue: false, .. } => {}
                Slot::Processing { .. } => e.slot = Slot::Processing { dirty: true },
                Slot::Waiting { at, seq, requeue: true } => {
                    st.timers.remove(&(at, seq));
                    e.slot = Slot::Pending;
                    st.ready.push_back(key);
                    self.notify.notify_one();
                }
            },
        }
        true
    }

    /// Next key to reconcile; `None` once shut down.
    pub async fn pull(&self) -> Option<ObjectKey> {
        loop {
            let notified = self.notify.notified();
            let next_at = {
                let mut st = self.lock();
                if st.shut {
                    return None;
                }
                st.promote_due(Instant::now());
                if let Some(key) = st.ready.pop_front() {
                    if let Some(e) = st.entries.get_mut(&key) {
                        e.slot = Slot::Processing { dirty: false };
                    }
                    if !st.ready.is_empty() {
                        self.notify.notify_one();
                    }
                    return Some(key);
                }
                st.timers.first_key_value().map(|(&(at, _), _)| at)
            };
            match next_at {
                Some(at) => tokio::select! {
                    _ = notified => {}
                    _ = tokio::time::sleep_until(at) => {}
                },
                None => notified.await,
            }
        }
    }

    /// Report the end of a pass started by [`WorkQueue::pull`].
    pub fn done(&self, key: &ObjectKey, outcome: Outcome) {
        let mut guard = self.lock();
        let st = &mut *guard;
        let Some(e) = st.entries.get_mut(key) else {
            warn!(key = %key, "done for unknown key");
            return;
        };
        let Slot::Processing { dirty } = e.slot else {
            warn!(key = %key, "done for key not in flight");
            return;
        };
        match outcome {
            Outcome::Transient => e.failures = e.failures.saturating_add(1),
            _ => e.failures = 0,
        }
        let failures = e.failures;
        if st.shut {
            st.entries.remove(key);
            return;
        }
        if dirty {
            e.slot = Slot::Pending;
            st.ready.push_back(key.clone());
            self.notify.notify_one();
            return;
        }
        match outcome {
            Outcome::Success | Outcome::NotFound => {
                st.entries.remove(key);
            }
            Outcome::Fatal => {
                warn!(key = %key, "reconcile failed permanently; dropping key");
                st.entries.remove(key);
            }
            Outcome::RequeueAfter(d) => st.wait(key, d, true),
            Outcome::Transient => {
                let delay = Backoff::delay_for(self.retry_base, self.retry_max, failures);
                debug!(key = %key, failures, delay_ms = %delay.as_millis(), "retrying with backoff");
                metrics::counter!("workqueue_retries_total", 1u64);
                st.wait(key, delay, false);
            }
        }
        // A new earliest timer must wake sleeping pullers.
        self.notify.notify_one();
    }

    /// Refuse further schedules and wake every puller.
    pub fn shutdown(&self) {
        self.lock().shut = true;
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    pub fn is_shutdown(&self) -> bool { self.lock().shut }

    /// Keys known to the queue in any state.
    pub fn len(&self) -> usize { self.lock().entries.len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Consecutive transient failures recorded for `key`.
    pub fn failures(&self, key: &ObjectKey) -> u32 { self.lock().entries.get(key).map(|e| e.failures).unwrap_or(0) }
}
