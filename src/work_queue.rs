//! The bounded, per-reactor-capped dispatch queue (C4).
//!
//! A `push` is a *signal*, not work itself: the semantic cap is "at
//! most `max_per_reactor` outstanding pokes for this reactor name" —
//! once a worker pops one and drains, it will reread everything new
//! for that reactor anyway, so coalescing duplicate signals is free
//! (§4.4).

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use tokio::sync::Notify;

/// `None` is the shutdown sentinel; `Some(name)` is a reactor to visit.
type Slot = Option<String>;

struct Inner {
    queue: VecDeque<Slot>,
    pending_per_reactor: HashMap<String, usize>,
    max_per_reactor: usize,
}

/// Bounded FIFO of reactor names to visit, with a per-reactor cap.
pub struct WorkQueue {
    inner: Mutex<Inner>,
    notify: Notify,
}

impl WorkQueue {
    pub fn new(max_per_reactor: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                pending_per_reactor: HashMap::new(),
                max_per_reactor: max_per_reactor.max(1),
            }),
            notify: Notify::new(),
        }
    }

    /// Push `reactor_name`. Returns `true` if it was enqueued, `false`
    /// if it was dropped because the per-reactor cap was already hit.
    pub fn push(&self, reactor_name: &str) -> bool {
        let pushed = {
            let mut inner = self.inner.lock().unwrap();
            let max_per_reactor = inner.max_per_reactor;
            let pending = inner
                .pending_per_reactor
                .entry(reactor_name.to_string())
                .or_insert(0);
            if *pending >= max_per_reactor {
                false
            } else {
                *pending += 1;
                inner.queue.push_back(Some(reactor_name.to_string()));
                true
            }
        };
        if pushed {
            self.notify.notify_one();
        }
        pushed
    }

    /// Push `n` shutdown sentinels, one per worker, so every blocked
    /// `pop` eventually observes shutdown (§4.4, §5).
    pub fn close(&self, n_workers: usize) {
        {
            let mut inner = self.inner.lock().unwrap();
            for _ in 0..n_workers {
                inner.queue.push_back(None);
            }
        }
        self.notify.notify_waiters();
    }

    /// Blocking pop. `None` is the shutdown sentinel.
    pub async fn pop(&self) -> Slot {
        loop {
            {
                let mut inner = self.inner.lock().unwrap();
                if let Some(slot) = inner.queue.pop_front() {
                    if let Some(name) = &slot {
                        if let Some(count) = inner.pending_per_reactor.get_mut(name) {
                            *count = count.saturating_sub(1);
                        }
                    }
                    return slot;
                }
            }
            self.notify.notified().await;
        }
    }
}
