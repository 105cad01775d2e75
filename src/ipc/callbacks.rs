// src/ipc/callbacks.rs

//! Callback-based request/reply engine.
//!
//! Grounded in original `callbacks.py`: sending a command opens a
//! `Callback` record keyed by a fresh id and waits (with a timeout) for a
//! response from every recipient; `_check_disconnects` marks uids that
//! dropped off the hub's presence list as [`CallbackResult::NoResponse`]
//! instead of leaving the wait hanging forever. The record's lifetime is
//! managed with the same RAII-on-drop idiom as `connection/guard.rs`'s
//! `ConnectionGuard`, rather than the original's `@contextmanager`.

use crate::ipc::payload::{CallbackId, Uid};
use dashmap::DashMap;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Notify;

#[derive(Debug, Clone)]
pub enum CallbackResult {
    Ok(Value),
    Traceback(String),
    NotFound,
    /// The recipient disconnected from the hub before responding.
    NoResponse,
}

struct CallbackState {
    expected: HashSet<Uid>,
    received: Mutex<HashMap<Uid, CallbackResult>>,
    notify: Notify,
}

/// Tracks in-flight commands awaiting responses.
#[derive(Clone)]
pub struct CallbackHandler {
    records: Arc<DashMap<CallbackId, Arc<CallbackState>>>,
    next_id: Arc<AtomicU64>,
}

impl CallbackHandler {
    pub fn new() -> Self {
        Self {
            records: Arc::new(DashMap::new()),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Open a new callback record for the given recipients. The returned
    /// guard deregisters the record when dropped, whether or not the wait
    /// completed.
    pub fn register(&self, recipients: &[Uid]) -> (CallbackId, CallbackGuard) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let state = Arc::new(CallbackState {
            expected: recipients.iter().copied().collect(),
            received: Mutex::new(HashMap::new()),
            notify: Notify::new(),
        });
        self.records.insert(id, state);
        (
            id,
            CallbackGuard {
                records: self.records.clone(),
                id,
            },
        )
    }

    /// Record a response frame arriving from `from` for `callback`.
    pub fn handle_response(&self, callback: CallbackId, from: Uid, result: CallbackResult) {
        if let Some(state) = self.records.get(&callback) {
            state.received.lock().unwrap().insert(from, result);
            state.notify.notify_waiters();
        }
    }

    /// For every in-flight callback, mark any expected uid that is no
    /// longer in `connected` as [`CallbackResult::NoResponse`] so waiters
    /// aren't stuck waiting on a peer that vanished mid-request.
    pub fn check_disconnects(&self, connected: &[Uid]) {
        let connected: HashSet<Uid> = connected.iter().copied().collect();
        for entry in self.records.iter() {
            let state = entry.value();
            let missing: Vec<Uid> = {
                let received = state.received.lock().unwrap();
                state
                    .expected
                    .iter()
                    .filter(|uid| !received.contains_key(uid) && !connected.contains(uid))
                    .copied()
                    .collect()
            };
            if missing.is_empty() {
                continue;
            }
            let mut received = state.received.lock().unwrap();
            for uid in missing {
                received.insert(uid, CallbackResult::NoResponse);
            }
            drop(received);
            state.notify.notify_waiters();
        }
    }

    /// Wait up to `timeout` for every expected recipient to respond (or be
    /// marked [`CallbackResult::NoResponse`]), returning whatever arrived.
    pub async fn wait(&self, callback: CallbackId, timeout: Duration) -> HashMap<Uid, CallbackResult> {
        let Some(state) = self.records.get(&callback).map(|e| e.value().clone()) else {
            return HashMap::new();
        };
        let deadline = Instant::now() + timeout;
        loop {
            {
                let received = state.received.lock().unwrap();
                if received.len() >= state.expected.len() {
                    return received.clone();
                }
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let _ = tokio::time::timeout(remaining, state.notify.notified()).await;
        }
        let mut received = state.received.lock().unwrap();
        for uid in &state.expected {
            received.entry(*uid).or_insert(CallbackResult::NoResponse);
        }
        received.clone()
    }
}

impl Default for CallbackHandler {
    fn default() -> Self {
        Self::new()
    }
}

/// Deregisters its callback record on drop, so a cancelled or timed-out
/// wait can never leak an entry in the callback table.
pub struct CallbackGuard {
    records: Arc<DashMap<CallbackId, Arc<CallbackState>>>,
    id: CallbackId,
}

impl Drop for CallbackGuard {
    fn drop(&mut self) {
        self.records.remove(&self.id);
    }
}
