//! Single-flight FIFO command queue.
//!
//! Every bus operation is a closure over the shared context. One drain task at a time pops
//! the head, waits the inter-command delay, then runs the closure on the blocking pool
//! while holding the context lock. The drain task exits when the list is empty; the next
//! `submit` starts a new one.

use crate::error::{Result, ServoError};
use std::collections::VecDeque;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::oneshot;

type Job<C> = Box<dyn FnOnce(&mut C) + Send>;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct Pending<C> {
    jobs: VecDeque<Job<C>>,
    draining: bool,
}

struct Shared<C> {
    pending: Mutex<Pending<C>>,
    ctx: Arc<Mutex<C>>,
    delay: Duration,
    seq: AtomicU64,
}

/// Deferred result of a submitted operation.
///
/// Resolves to [`ServoError::Discarded`] if the operation was cleared before it ran.
#[must_use = "the operation runs regardless, but its result is lost"]
pub struct Ticket<T> {
    rx: oneshot::Receiver<Result<T>>,
}

impl<T> Future for Ticket<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|r| r.unwrap_or(Err(ServoError::Discarded)))
    }
}

pub struct CommandQueue<C> {
    shared: Arc<Shared<C>>,
}

impl<C> Clone for CommandQueue<C> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<C: Send + 'static> CommandQueue<C> {
    pub fn new(ctx: C, delay: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                pending: Mutex::new(Pending {
                    jobs: VecDeque::new(),
                    draining: false,
                }),
                ctx: Arc::new(Mutex::new(ctx)),
                delay,
                seq: AtomicU64::new(0),
            }),
        }
    }

    pub fn delay(&self) -> Duration {
        self.shared.delay
    }

    /// Append an operation. Must be called from within a tokio runtime.
    pub fn submit<T, F>(&self, label: &'static str, op: F) -> Ticket<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut C) -> Result<T> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let seq = self.shared.seq.fetch_add(1, Ordering::Relaxed);
        let job: Job<C> = Box::new(move |ctx: &mut C| {
            tracing::trace!(seq, op = label, "executing queued operation");
            let result = panic::catch_unwind(AssertUnwindSafe(|| op(ctx))).unwrap_or_else(|p| {
                let msg = p
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| p.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                tracing::error!(seq, op = label, "queued operation panicked: {msg}");
                Err(ServoError::Panicked(msg))
            });
            if let Err(e) = &result {
                tracing::debug!(seq, op = label, error = %e, "queued operation failed");
            }
            // Receiver may have been dropped; the side effects happened either way.
            let _ = tx.send(result);
        });

        let start = {
            let mut pending = lock(&self.shared.pending);
            pending.jobs.push_back(job);
            !std::mem::replace(&mut pending.draining, true)
        };
        if start {
            tokio::spawn(drain(Arc::clone(&self.shared)));
        }
        Ticket { rx }
    }

    /// Drop every operation that has not started yet. An operation already running is
    /// unaffected. Returns how many were discarded.
    pub fn clear(&self) -> usize {
        let dropped: Vec<Job<C>> = lock(&self.shared.pending).jobs.drain(..).collect();
        if !dropped.is_empty() {
            tracing::info!(discarded = dropped.len(), "cleared pending servo commands");
        }
        dropped.len()
    }

    /// Operations waiting to start (the running one excluded).
    pub fn len(&self) -> usize {
        lock(&self.shared.pending).jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True when nothing is queued or running.
    pub fn is_idle(&self) -> bool {
        !lock(&self.shared.pending).draining
    }
}

async fn drain<C: Send + 'static>(shared: Arc<Shared<C>>) {
    loop {
        let job = {
            let mut pending = lock(&shared.pending);
            match pending.jobs.pop_front() {
                Some(job) => job,
                None => {
                    pending.draining = false;
                    return;
                }
            }
        };
        tokio::time::sleep(shared.delay).await;
        let ctx = Arc::clone(&shared.ctx);
        let run = tokio::task::spawn_blocking(move || {
            let mut guard = lock(&ctx);
            job(&mut *guard);
        });
        if let Err(e) = run.await {
            tracing::error!(error = %e, "queued operation could not run");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    const DELAY: Duration = Duration::from_millis(5);

    #[tokio::test]
    async fn test_fifo_with_minimum_spacing() {
        let queue = CommandQueue::new(Vec::<(u32, Instant)>::new(), DELAY);
        let tickets: Vec<_> = (1..=3)
            .map(|n| {
                queue.submit("push", move |log: &mut Vec<(u32, Instant)>| {
                    log.push((n, Instant::now()));
                    Ok(n)
                })
            })
            .collect();
        for (i, t) in tickets.into_iter().enumerate() {
            assert_eq!(t.await.unwrap(), i as u32 + 1);
        }
        let log = queue
            .submit("read", |log: &mut Vec<(u32, Instant)>| Ok(log.clone()))
            .await
            .unwrap();
        assert_eq!(log.iter().map(|(n, _)| *n).collect::<Vec<_>>(), vec![1, 2, 3]);
        for pair in log.windows(2) {
            assert!(pair[1].1.duration_since(pair[0].1) >= DELAY);
        }
    }

    #[tokio::test]
    async fn test_failure_does_not_stop_the_queue() {
        let queue = CommandQueue::new(0u32, DELAY);
        let a = queue.submit("ok", |n: &mut u32| {
            *n += 1;
            Ok(())
        });
        let b = queue.submit("fail", |_: &mut u32| -> Result<()> { Err(ServoError::NotConnected) });
        let c = queue.submit("panic", |_: &mut u32| -> Result<()> { panic!("codec exploded") });
        let d = queue.submit("ok", |n: &mut u32| {
            *n += 1;
            Ok(*n)
        });
        assert!(a.await.is_ok());
        assert_eq!(b.await, Err(ServoError::NotConnected));
        assert_eq!(c.await, Err(ServoError::Panicked("codec exploded".into())));
        assert_eq!(d.await, Ok(2));
    }

    #[tokio::test]
    async fn test_clear_discards_pending_but_not_in_flight() {
        let queue = CommandQueue::new(Vec::<&'static str>::new(), DELAY);
        let slow = queue.submit("slow", |log: &mut Vec<&'static str>| {
            std::thread::sleep(Duration::from_millis(100));
            log.push("slow");
            Ok(())
        });
        tokio::time::sleep(Duration::from_millis(40)).await;
        let second = queue.submit("second", |log: &mut Vec<&'static str>| {
            log.push("second");
            Ok(())
        });
        let third = queue.submit("third", |log: &mut Vec<&'static str>| {
            log.push("third");
            Ok(())
        });
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.clear(), 2);
        assert_eq!(slow.await, Ok(()));
        assert_eq!(second.await, Err(ServoError::Discarded));
        assert_eq!(third.await, Err(ServoError::Discarded));
        let log = queue
            .submit("read", |log: &mut Vec<&'static str>| Ok(log.clone()))
            .await
            .unwrap();
        assert_eq!(log, vec!["slow"]);
    }

    #[tokio::test]
    async fn test_restarts_after_idle() {
        let queue = CommandQueue::new(0u32, DELAY);
        queue
            .submit("one", |n: &mut u32| {
                *n += 1;
                Ok(())
            })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(queue.is_idle());
        queue
            .submit("two", |n: &mut u32| {
                *n += 1;
                Ok(())
            })
            .await
            .unwrap();
        assert_eq!(queue.submit("get", |n: &mut u32| Ok(*n)).await, Ok(2));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_single_flight_under_concurrent_callers() {
        let queue = CommandQueue::new((), Duration::from_millis(1));
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut callers = Vec::new();
        for _ in 0..8 {
            let queue = queue.clone();
            let active = Arc::clone(&active);
            let peak = Arc::clone(&peak);
            callers.push(tokio::spawn(async move {
                let ticket = queue.submit("overlap", move |_: &mut ()| {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(2));
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                });
                ticket.await
            }));
        }
        for c in callers {
            c.await.unwrap().unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }
}
