//! Coalescing "packets are waiting" flag shared by the I/O and consumer
//! threads.
//!
//! The I/O thread calls [`Notification::notify_waiting`] after every
//! delivery. Only the first call after a [`Notification::reset`] does any
//! work: it wakes threads blocked in [`Notification::wait`] and runs the wake
//! hook once. Later calls are no-ops until the consumer resets the flag.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};

use crate::sync::lock;

/// Callback run on the I/O thread when the pending flag goes from clear to
/// set. Typically posts a wake-up to the embedding application's event loop.
pub type WakeHook = Arc<dyn Fn() + Send + Sync>;

pub(crate) struct Notification {
    pending: AtomicBool,
    hook: Mutex<Option<WakeHook>>,
    // Holds at most one token while the flag is set.
    wake_tx: Sender<()>,
    wake_rx: Receiver<()>,
}

impl Default for Notification {
    fn default() -> Self {
        let (wake_tx, wake_rx) = crossbeam_channel::bounded(1);
        Self {
            pending: AtomicBool::new(false),
            hook: Mutex::new(None),
            wake_tx,
            wake_rx,
        }
    }
}

impl Notification {
    /// Set the pending flag. Returns `true` only for the call that set it.
    pub(crate) fn notify_waiting(&self) -> bool {
        if self
            .pending
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        let _ = self.wake_tx.try_send(());

        let hook = lock(&self.hook).clone();
        if let Some(hook) = hook {
            hook();
        }
        true
    }

    pub(crate) fn reset(&self) {
        self.pending.store(false, Ordering::Release);
        while self.wake_rx.try_recv().is_ok() {}
    }

    pub(crate) fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }

    pub(crate) fn set_hook(&self, hook: Option<WakeHook>) {
        *lock(&self.hook) = hook;
    }

    /// Block until the flag is set or `timeout` elapses. Returns whether the
    /// flag is set.
    pub(crate) fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.is_pending() {
                return true;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            match self.wake_rx.recv_timeout(remaining) {
                Ok(()) => {
                    // Leave the token for any other waiter.
                    if self.is_pending() {
                        let _ = self.wake_tx.try_send(());
                        return true;
                    }
                }
                Err(_) => return self.is_pending(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    #[test]
    fn test_rapid_notifies_coalesce() {
        let notification = Notification::default();
        let hook_calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hook_calls);
        notification.set_hook(Some(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })));

        let first = notification.notify_waiting();
        let rest = (0..99).filter(|_| notification.notify_waiting()).count();

        assert!(first);
        assert_eq!(rest, 0);
        assert!(notification.is_pending());
        assert_eq!(hook_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_reset_rearms() {
        let notification = Notification::default();
        assert!(notification.notify_waiting());
        notification.reset();
        assert!(!notification.is_pending());
        assert!(notification.notify_waiting());
    }

    #[test]
    fn test_wait_times_out_when_idle() {
        let notification = Notification::default();
        let started = Instant::now();
        assert!(!notification.wait(Duration::from_millis(30)));
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_wait_wakes_on_notify() {
        let notification = Arc::new(Notification::default());
        let notifier = Arc::clone(&notification);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            notifier.notify_waiting();
        });

        assert!(notification.wait(Duration::from_secs(5)));
        handle.join().unwrap();
    }

    #[test]
    fn test_every_waiter_wakes() {
        let notification = Arc::new(Notification::default());
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let waiter = Arc::clone(&notification);
                std::thread::spawn(move || waiter.wait(Duration::from_secs(5)))
            })
            .collect();
        std::thread::sleep(Duration::from_millis(20));
        notification.notify_waiting();

        let started = Instant::now();
        for waiter in waiters {
            assert!(waiter.join().unwrap());
        }
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_reset_discards_stale_wakeup() {
        let notification = Notification::default();
        notification.notify_waiting();
        notification.reset();
        let started = Instant::now();
        assert!(!notification.wait(Duration::from_millis(30)));
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_wait_returns_immediately_when_pending() {
        let notification = Notification::default();
        notification.notify_waiting();
        let started = Instant::now();
        assert!(notification.wait(Duration::from_secs(5)));
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
