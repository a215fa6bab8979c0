//! Per-job notification bus.
//!
//! Listeners subscribe to a single [`JobId`] and receive a [`Job`] snapshot on
//! every published state change for that id, in subscription order, on the
//! publisher's thread. There is no buffering: a listener only sees changes
//! published after it subscribed.
//!
//! A panicking listener is caught, logged and counted; the remaining
//! listeners still run and the publisher never observes the failure.
//!
//! Once [`Subscription::unsubscribe`] returns, the listener will not be called
//! again. An invocation already running on another thread is waited for.

use parking_lot::{Mutex, ReentrantMutex};
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;

use super::job::{Job, JobId};
use crate::error::ErrorCode;
use crate::telemetry::JobMetrics;

type Listener = dyn Fn(&Job) + Send + Sync;

struct ListenerSlot {
    id: u64,
    active: AtomicBool,
    /// Held for the duration of each invocation. Reentrant so a listener may
    /// unsubscribe itself from inside its callback.
    gate: ReentrantMutex<()>,
    callback: Box<Listener>,
}

impl ListenerSlot {
    fn deactivate(&self) {
        self.active.store(false, Ordering::SeqCst);
        // Wait out an invocation that passed the `active` check.
        drop(self.gate.lock());
    }
}

#[derive(Default)]
struct BusInner {
    listeners: Mutex<HashMap<JobId, Vec<Arc<ListenerSlot>>>>,
    next_id: AtomicU64,
}

impl BusInner {
    fn remove(&self, job_id: &JobId, listener_id: u64) -> Option<Arc<ListenerSlot>> {
        let mut listeners = self.listeners.lock();
        let slots = listeners.get_mut(job_id)?;
        let position = slots.iter().position(|slot| slot.id == listener_id)?;
        let slot = slots.remove(position);
        if slots.is_empty() {
            listeners.remove(job_id);
        }
        Some(slot)
    }
}

/// Publish/subscribe registry keyed by job id.
#[derive(Clone, Default)]
pub struct NotificationBus {
    inner: Arc<BusInner>,
}

impl std::fmt::Debug for NotificationBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationBus")
            .field("jobs", &self.inner.listeners.lock().len())
            .finish()
    }
}

impl NotificationBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `listener` for updates to `job_id`.
    pub fn subscribe<F>(&self, job_id: JobId, listener: F) -> Subscription
    where
        F: Fn(&Job) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let slot = Arc::new(ListenerSlot {
            id,
            active: AtomicBool::new(true),
            gate: ReentrantMutex::new(()),
            callback: Box::new(listener),
        });

        self.inner
            .listeners
            .lock()
            .entry(job_id)
            .or_default()
            .push(slot);

        tracing::trace!(job_id = %job_id, listener_id = id, "Listener subscribed");

        Subscription {
            bus: Arc::downgrade(&self.inner),
            job_id,
            listener_id: id,
            released: false,
        }
    }

    /// Subscribe with an unbounded channel instead of a callback.
    ///
    /// The receiver yields `None` once the subscription is dropped.
    pub fn subscribe_channel(&self, job_id: JobId) -> (Subscription, mpsc::UnboundedReceiver<Job>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = self.subscribe(job_id, move |job| {
            let _ = tx.send(job.clone());
        });
        (subscription, rx)
    }

    /// Deliver `snapshot` to every current listener of `job_id`.
    ///
    /// Returns the number of listeners that ran without panicking.
    pub fn publish(&self, job_id: &JobId, snapshot: &Job) -> usize {
        // Copy the list so listeners run without the registry lock held and
        // may subscribe or unsubscribe freely.
        let slots: Vec<Arc<ListenerSlot>> = match self.inner.listeners.lock().get(job_id) {
            Some(slots) => slots.clone(),
            None => return 0,
        };

        let mut delivered = 0;
        for slot in slots {
            let _gate = slot.gate.lock();
            if !slot.active.load(Ordering::SeqCst) {
                continue;
            }

            match panic::catch_unwind(AssertUnwindSafe(|| (slot.callback)(snapshot))) {
                Ok(()) => delivered += 1,
                Err(payload) => {
                    let reason = panic_message(payload.as_ref());
                    JobMetrics::record_listener_failure();
                    tracing::warn!(
                        job_id = %job_id,
                        listener_id = slot.id,
                        error_code = %ErrorCode::ListenerFailed,
                        error = %reason,
                        "Job listener failed"
                    );
                }
            }
        }
        delivered
    }

    /// Number of live listeners for a job.
    pub fn listener_count(&self, job_id: &JobId) -> usize {
        self.inner
            .listeners
            .lock()
            .get(job_id)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Drop every listener of a job.
    pub fn clear(&self, job_id: &JobId) {
        let removed = self.inner.listeners.lock().remove(job_id);
        for slot in removed.into_iter().flatten() {
            slot.deactivate();
        }
    }
}

/// Disposer returned by [`NotificationBus::subscribe`].
///
/// Dropping it unsubscribes, so keep it alive for as long as updates are wanted.
#[must_use = "dropping a Subscription unsubscribes the listener"]
pub struct Subscription {
    bus: Weak<BusInner>,
    job_id: JobId,
    listener_id: u64,
    released: bool,
}

impl Subscription {
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// Stop receiving notifications.
    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        if let Some(bus) = self.bus.upgrade() {
            if let Some(slot) = bus.remove(&self.job_id, self.listener_id) {
                slot.deactivate();
                tracing::trace!(
                    job_id = %self.job_id,
                    listener_id = self.listener_id,
                    "Listener unsubscribed"
                );
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("job_id", &self.job_id)
            .field("listener_id", &self.listener_id)
            .finish()
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::job::JobState;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn snapshot() -> Job {
        Job::new("t", "q", json!(null), 1)
    }

    #[test]
    fn test_publish_in_subscription_order() {
        let bus = NotificationBus::new();
        let job = snapshot();
        let order = Arc::new(Mutex::new(Vec::new()));

        let subs: Vec<_> = (0..3)
            .map(|i| {
                let order = order.clone();
                bus.subscribe(job.id, move |_| order.lock().push(i))
            })
            .collect();

        assert_eq!(bus.publish(&job.id, &job), 3);
        assert_eq!(*order.lock(), vec![0, 1, 2]);
        drop(subs);
    }

    #[test]
    fn test_listener_isolated_by_job() {
        let bus = NotificationBus::new();
        let x = snapshot();
        let y = snapshot();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let seen_clone = seen.clone();
        let _sub = bus.subscribe(x.id, move |job| seen_clone.lock().push(job.id));

        bus.publish(&y.id, &y);
        bus.publish(&x.id, &x);

        assert_eq!(*seen.lock(), vec![x.id]);
    }

    #[test]
    fn test_panicking_listener_does_not_block_others() {
        let bus = NotificationBus::new();
        let job = snapshot();
        let calls = Arc::new(AtomicUsize::new(0));

        let _bad = bus.subscribe(job.id, |_| panic!("listener exploded"));
        let calls_clone = calls.clone();
        let _good = bus.subscribe(job.id, move |_| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(bus.publish(&job.id, &job), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let bus = NotificationBus::new();
        let job = snapshot();
        let calls = Arc::new(AtomicUsize::new(0));

        let calls_clone = calls.clone();
        let sub = bus.subscribe(job.id, move |_| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        });
        bus.publish(&job.id, &job);
        sub.unsubscribe();
        bus.publish(&job.id, &job);

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(bus.listener_count(&job.id), 0);
    }

    #[test]
    fn test_drop_unsubscribes() {
        let bus = NotificationBus::new();
        let job = snapshot();
        {
            let _sub = bus.subscribe(job.id, |_| {});
            assert_eq!(bus.listener_count(&job.id), 1);
        }
        assert_eq!(bus.listener_count(&job.id), 0);
    }

    #[test]
    fn test_listener_can_unsubscribe_itself() {
        let bus = NotificationBus::new();
        let job = snapshot();
        let holder: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        let calls = Arc::new(AtomicUsize::new(0));

        let holder_clone = holder.clone();
        let calls_clone = calls.clone();
        let sub = bus.subscribe(job.id, move |_| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
            if let Some(sub) = holder_clone.lock().take() {
                sub.unsubscribe();
            }
        });
        *holder.lock() = Some(sub);

        bus.publish(&job.id, &job);
        bus.publish(&job.id, &job);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_no_delivery_after_concurrent_unsubscribe() {
        let bus = NotificationBus::new();
        let job = snapshot();
        let after_unsubscribe = Arc::new(AtomicBool::new(false));
        let violations = Arc::new(AtomicUsize::new(0));

        let flag = after_unsubscribe.clone();
        let violations_clone = violations.clone();
        let sub = bus.subscribe(job.id, move |_| {
            if flag.load(Ordering::SeqCst) {
                violations_clone.fetch_add(1, Ordering::SeqCst);
            }
            std::thread::sleep(std::time::Duration::from_micros(50));
        });

        let publisher = {
            let bus = bus.clone();
            let job = job.clone();
            std::thread::spawn(move || {
                for _ in 0..500 {
                    bus.publish(&job.id, &job);
                }
            })
        };

        std::thread::sleep(std::time::Duration::from_millis(2));
        sub.unsubscribe();
        after_unsubscribe.store(true, Ordering::SeqCst);
        publisher.join().unwrap();

        assert_eq!(violations.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_subscribe_channel() {
        let bus = NotificationBus::new();
        let mut job = snapshot();
        let (sub, mut rx) = bus.subscribe_channel(job.id);

        job.mark_active().unwrap();
        bus.publish(&job.id, &job);

        let received = rx.recv().await.unwrap();
        assert_eq!(received.state, JobState::Active);

        drop(sub);
        assert!(rx.recv().await.is_none());
    }
}
