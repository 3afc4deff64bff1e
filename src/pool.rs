//! Lazy connection pooling with prioritized admission
//!
//! The pool hands out exclusive leases over lazily created connections.
//! Idle connections are kept on a LIFO stack and reaped by a background
//! sweeper once they outlive the idle timeout; a lease never receives an
//! expired connection. Disposal cancels and joins the sweeper, drains the
//! idle set, and fails any in-flight lease with [`Error::PoolDisposed`].

use crate::error::{Error, Result};
use crate::semaphore::{PrioritizedSemaphore, Priority, PriorityOdds};
use async_trait::async_trait;
use std::ops::{Deref, DerefMut};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Factory for pool-managed connections
///
/// The pool calls `create` lazily, only when a lease finds no reusable idle
/// connection. Creation must honor the cancellation token so a cancelled
/// lease does not leave a half-opened connection behind.
#[async_trait]
pub trait ConnectionFactory: Send + Sync + 'static {
    /// The connection type managed by the pool
    type Connection: Send + 'static;

    /// Open (and authenticate) a fresh connection
    async fn create(&self, cancel: &CancellationToken) -> Result<Self::Connection>;
}

struct IdleConnection<C> {
    conn: C,
    last_touched: Instant,
}

impl<C> IdleConnection<C> {
    fn is_expired(&self, idle_timeout: Duration, now: Instant) -> bool {
        now.duration_since(self.last_touched) >= idle_timeout
    }
}

/// State shared between the pool, its leases and the sweeper
struct PoolCore<C> {
    gate: PrioritizedSemaphore,
    idle: Mutex<Vec<IdleConnection<C>>>,
    live: AtomicUsize,
    disposed: AtomicBool,
    idle_timeout: Duration,
    max_connections: usize,
}

impl<C> PoolCore<C> {
    fn lock_idle(&self) -> std::sync::MutexGuard<'_, Vec<IdleConnection<C>>> {
        self.idle.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    fn sweep_once(&self) {
        let now = Instant::now();
        let mut idle = self.lock_idle();
        let before = idle.len();
        // `retain` keeps relative order, preserving LIFO among survivors.
        idle.retain(|item| !item.is_expired(self.idle_timeout, now));
        let evicted = before - idle.len();
        drop(idle);
        if evicted > 0 {
            self.live.fetch_sub(evicted, Ordering::AcqRel);
            debug!("Reaped {} idle connection(s) past the idle timeout", evicted);
        }
    }
}

/// Exclusive lease over one pooled connection
///
/// Dropping the lease returns the connection to the idle set. Call
/// [`mark_broken`](Self::mark_broken) first when the connection may hold
/// unread protocol state; the drop then destroys it instead of recycling.
pub struct ConnectionLease<C: Send + 'static> {
    conn: Option<C>,
    core: Arc<PoolCore<C>>,
    broken: bool,
}

impl<C: Send + 'static> ConnectionLease<C> {
    /// Flag the connection for destruction instead of reuse
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }
}

impl<C: Send + 'static> std::fmt::Debug for ConnectionLease<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionLease")
            .field("broken", &self.broken)
            .field("has_conn", &self.conn.is_some())
            .finish()
    }
}

impl<C: Send + 'static> Deref for ConnectionLease<C> {
    type Target = C;

    // The connection is only taken out in Drop.
    #[expect(clippy::expect_used)]
    fn deref(&self) -> &C {
        self.conn.as_ref().expect("BUG: lease used after drop")
    }
}

impl<C: Send + 'static> DerefMut for ConnectionLease<C> {
    #[expect(clippy::expect_used)]
    fn deref_mut(&mut self) -> &mut C {
        self.conn.as_mut().expect("BUG: lease used after drop")
    }
}

impl<C: Send + 'static> Drop for ConnectionLease<C> {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        if self.broken || self.core.is_disposed() {
            drop(conn);
            self.core.live.fetch_sub(1, Ordering::AcqRel);
        } else {
            self.core.lock_idle().push(IdleConnection {
                conn,
                last_touched: Instant::now(),
            });
        }
        // Post-disposal releases over-credit a dead gate; harmless, and
        // they let any stragglers queued behind it observe the disposal.
        self.core.gate.release();
    }
}

/// Lazy, prioritized connection pool
///
/// # Example
///
/// ```no_run
/// use nzb_streamer::{ConnectionPool, Priority};
/// use std::time::Duration;
/// use tokio_util::sync::CancellationToken;
/// # use nzb_streamer::ConnectionFactory;
/// # async fn example<F: ConnectionFactory>(factory: F) -> nzb_streamer::Result<()> {
/// let pool = ConnectionPool::new(factory, 10, Duration::from_secs(30));
///
/// let cancel = CancellationToken::new();
/// let lease = pool.lease(Priority::High, &cancel).await?;
/// // ... use *lease ...
/// drop(lease); // back to the idle set
///
/// pool.close().await;
/// # Ok(())
/// # }
/// ```
pub struct ConnectionPool<F: ConnectionFactory> {
    core: Arc<PoolCore<F::Connection>>,
    factory: Arc<F>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    sweep_cancel: CancellationToken,
}

impl<F: ConnectionFactory> ConnectionPool<F> {
    /// Create a pool of at most `max_connections`, spawning the idle sweeper
    pub fn new(factory: F, max_connections: usize, idle_timeout: Duration) -> Self {
        assert!(max_connections > 0, "pool requires at least one connection");

        let core = Arc::new(PoolCore {
            gate: PrioritizedSemaphore::new(max_connections, PriorityOdds::default()),
            idle: Mutex::new(Vec::new()),
            live: AtomicUsize::new(0),
            disposed: AtomicBool::new(false),
            idle_timeout,
            max_connections,
        });

        let sweep_cancel = CancellationToken::new();
        let sweeper = {
            let core = core.clone();
            let cancel = sweep_cancel.clone();
            tokio::spawn(async move {
                // Reap at half the idle timeout so nothing sits expired for
                // longer than one sweep interval.
                let mut ticker = tokio::time::interval(idle_timeout / 2);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                ticker.tick().await; // first tick fires immediately
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = ticker.tick() => core.sweep_once(),
                    }
                }
                trace!("Idle sweeper stopped");
            })
        };

        Self {
            core,
            factory: Arc::new(factory),
            sweeper: Mutex::new(Some(sweeper)),
            sweep_cancel,
        }
    }

    /// Acquire an exclusive connection lease
    ///
    /// Pops the most recently returned unexpired idle connection, or creates
    /// a fresh one through the factory. Expired idles found along the way are
    /// destroyed. A factory failure releases the just-acquired permit before
    /// propagating.
    ///
    /// # Errors
    ///
    /// [`Error::Cancelled`] if `cancel` fires while waiting,
    /// [`Error::PoolDisposed`] once [`close`](Self::close) ran, or the
    /// factory's error for a failed connection attempt.
    pub async fn lease(
        &self,
        priority: Priority,
        cancel: &CancellationToken,
    ) -> Result<ConnectionLease<F::Connection>> {
        if self.core.is_disposed() {
            return Err(Error::PoolDisposed);
        }

        tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            _ = self.core.gate.acquire(priority) => {}
        }

        // The pool may have been disposed while we waited at the gate.
        if self.core.is_disposed() {
            self.core.gate.release();
            return Err(Error::PoolDisposed);
        }

        // Reuse the freshest idle connection that has not expired.
        loop {
            let popped = self.core.lock_idle().pop();
            match popped {
                Some(item) if !item.is_expired(self.core.idle_timeout, Instant::now()) => {
                    return Ok(ConnectionLease {
                        conn: Some(item.conn),
                        core: self.core.clone(),
                        broken: false,
                    });
                }
                Some(item) => {
                    drop(item.conn);
                    self.core.live.fetch_sub(1, Ordering::AcqRel);
                    trace!("Discarded expired idle connection");
                }
                None => break,
            }
        }

        match self.factory.create(cancel).await {
            Ok(conn) => {
                self.core.live.fetch_add(1, Ordering::AcqRel);
                Ok(ConnectionLease {
                    conn: Some(conn),
                    core: self.core.clone(),
                    broken: false,
                })
            }
            Err(e) => {
                self.core.gate.release();
                Err(e)
            }
        }
    }

    /// Connections currently alive (leased + idle)
    pub fn live_connections(&self) -> usize {
        self.core.live.load(Ordering::Acquire)
    }

    /// Connections sitting in the idle set
    pub fn idle_connections(&self) -> usize {
        self.core.lock_idle().len()
    }

    /// Connections currently leased out
    pub fn active_connections(&self) -> usize {
        self.live_connections()
            .saturating_sub(self.idle_connections())
    }

    /// Lease capacity still available
    pub fn available_connections(&self) -> usize {
        self.core
            .max_connections
            .saturating_sub(self.active_connections())
    }

    /// Maximum connections this pool manages
    pub fn max_connections(&self) -> usize {
        self.core.max_connections
    }

    /// Stop the sweeper without disposing; used by Drop as a backstop when
    /// `close` was never called.
    fn stop_sweeper(&self) {
        self.sweep_cancel.cancel();
    }

    /// Dispose the pool: stop the sweeper, drain and close idle connections,
    /// and fail every pending or future lease
    ///
    /// The sweeper is awaited before teardown completes so it can never
    /// observe the pool mid-drain.
    pub async fn close(&self) {
        if self.core.disposed.swap(true, Ordering::AcqRel) {
            return;
        }

        self.sweep_cancel.cancel();
        let handle = self
            .sweeper
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        let drained: Vec<_> = self.core.lock_idle().drain(..).collect();
        if !drained.is_empty() {
            self.core.live.fetch_sub(drained.len(), Ordering::AcqRel);
        }
        drop(drained);

        // Wake everything still queued at the gate so it sees the disposal.
        for _ in 0..self.core.max_connections {
            self.core.gate.release();
        }
        debug!("Connection pool disposed");
    }
}

impl<F: ConnectionFactory> Drop for ConnectionPool<F> {
    fn drop(&mut self) {
        self.stop_sweeper();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingFactory {
        created: AtomicUsize,
        fail_first: AtomicUsize,
    }

    impl CountingFactory {
        fn new() -> Self {
            Self {
                created: AtomicUsize::new(0),
                fail_first: AtomicUsize::new(0),
            }
        }

        fn failing(count: usize) -> Self {
            Self {
                created: AtomicUsize::new(0),
                fail_first: AtomicUsize::new(count),
            }
        }
    }

    #[async_trait]
    impl ConnectionFactory for Arc<CountingFactory> {
        type Connection = u64;

        async fn create(&self, _cancel: &CancellationToken) -> Result<u64> {
            if self
                .fail_first
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(Error::ConnectionClosed);
            }
            let id = self.created.fetch_add(1, Ordering::SeqCst) as u64;
            Ok(id)
        }
    }

    fn pool_with(
        factory: Arc<CountingFactory>,
        max: usize,
        idle_timeout: Duration,
    ) -> ConnectionPool<Arc<CountingFactory>> {
        ConnectionPool::new(factory, max, idle_timeout)
    }

    #[tokio::test]
    async fn test_lazy_creation_and_reuse() {
        let factory = Arc::new(CountingFactory::new());
        let pool = pool_with(factory.clone(), 4, Duration::from_secs(30));
        let cancel = CancellationToken::new();

        assert_eq!(pool.live_connections(), 0);

        let lease = pool.lease(Priority::Low, &cancel).await.unwrap();
        assert_eq!(*lease, 0);
        assert_eq!(pool.live_connections(), 1);
        assert_eq!(pool.active_connections(), 1);
        drop(lease);
        assert_eq!(pool.idle_connections(), 1);

        // Second lease reuses the idle connection, no new creation.
        let lease = pool.lease(Priority::Low, &cancel).await.unwrap();
        assert_eq!(*lease, 0);
        assert_eq!(factory.created.load(Ordering::SeqCst), 1);
        pool.close().await;
    }

    #[tokio::test]
    async fn test_accounting_invariant_under_churn() {
        let factory = Arc::new(CountingFactory::new());
        let pool = Arc::new(pool_with(factory, 3, Duration::from_secs(30)));
        let cancel = CancellationToken::new();

        let mut handles = Vec::new();
        for i in 0..12 {
            let pool = pool.clone();
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                let mut lease = pool.lease(Priority::Low, &cancel).await.unwrap();
                tokio::time::sleep(Duration::from_millis(2)).await;
                if i % 3 == 0 {
                    lease.mark_broken();
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(
            pool.active_connections() + pool.idle_connections(),
            pool.live_connections()
        );
        assert!(pool.live_connections() <= pool.max_connections());
        pool.close().await;
    }

    #[tokio::test]
    async fn test_lifo_reuse_order() {
        let factory = Arc::new(CountingFactory::new());
        let pool = pool_with(factory, 3, Duration::from_secs(30));
        let cancel = CancellationToken::new();

        let a = pool.lease(Priority::Low, &cancel).await.unwrap();
        let b = pool.lease(Priority::Low, &cancel).await.unwrap();
        let id_a = *a;
        let id_b = *b;
        drop(a); // idle: [a]
        drop(b); // idle: [a, b] — b on top

        let top = pool.lease(Priority::Low, &cancel).await.unwrap();
        assert_eq!(*top, id_b, "most recently returned connection leases first");
        let next = pool.lease(Priority::Low, &cancel).await.unwrap();
        assert_eq!(*next, id_a);
        pool.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_idle_never_leased() {
        let factory = Arc::new(CountingFactory::new());
        let pool = pool_with(factory.clone(), 2, Duration::from_secs(30));
        let cancel = CancellationToken::new();

        let lease = pool.lease(Priority::Low, &cancel).await.unwrap();
        drop(lease);
        assert_eq!(pool.idle_connections(), 1);

        // Cross the idle timeout; the next lease must create a fresh
        // connection even if the sweeper has not run yet.
        tokio::time::advance(Duration::from_secs(31)).await;
        let lease = pool.lease(Priority::Low, &cancel).await.unwrap();
        assert_eq!(*lease, 1, "expired connection must not be handed out");
        assert_eq!(factory.created.load(Ordering::SeqCst), 2);
        pool.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_reaps_expired_idles() {
        let factory = Arc::new(CountingFactory::new());
        let pool = pool_with(factory, 2, Duration::from_secs(10));
        let cancel = CancellationToken::new();

        let a = pool.lease(Priority::Low, &cancel).await.unwrap();
        let b = pool.lease(Priority::Low, &cancel).await.unwrap();
        drop(a);
        drop(b);
        assert_eq!(pool.idle_connections(), 2);

        // Two sweep intervals past the timeout: both idles reaped.
        tokio::time::advance(Duration::from_secs(16)).await;
        tokio::task::yield_now().await;
        assert_eq!(pool.idle_connections(), 0);
        assert_eq!(pool.live_connections(), 0);
        pool.close().await;
    }

    #[tokio::test]
    async fn test_factory_failure_releases_permit() {
        let factory = Arc::new(CountingFactory::failing(1));
        let pool = pool_with(factory, 1, Duration::from_secs(30));
        let cancel = CancellationToken::new();

        let err = pool.lease(Priority::Low, &cancel).await.unwrap_err();
        assert!(matches!(err, Error::ConnectionClosed));

        // The permit must have been released: the retry succeeds without
        // waiting on a single-slot gate.
        let lease = pool.lease(Priority::Low, &cancel).await.unwrap();
        assert_eq!(*lease, 0);
        pool.close().await;
    }

    #[tokio::test]
    async fn test_close_rejects_leases() {
        let factory = Arc::new(CountingFactory::new());
        let pool = pool_with(factory, 2, Duration::from_secs(30));
        let cancel = CancellationToken::new();

        let lease = pool.lease(Priority::Low, &cancel).await.unwrap();
        drop(lease);
        pool.close().await;
        assert_eq!(pool.idle_connections(), 0);
        assert_eq!(pool.live_connections(), 0);

        let err = pool.lease(Priority::Low, &cancel).await.unwrap_err();
        assert!(matches!(err, Error::PoolDisposed));
    }

    #[tokio::test]
    async fn test_cancelled_lease_does_not_leak_permit() {
        let factory = Arc::new(CountingFactory::new());
        let pool = Arc::new(pool_with(factory, 1, Duration::from_secs(30)));
        let cancel = CancellationToken::new();

        let held = pool.lease(Priority::Low, &cancel).await.unwrap();

        let waiter_cancel = CancellationToken::new();
        let waiter_pool = pool.clone();
        let waiter_token = waiter_cancel.clone();
        let waiter = tokio::spawn(async move {
            waiter_pool.lease(Priority::High, &waiter_token).await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        waiter_cancel.cancel();
        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(Error::Cancelled)));

        // Returning the held lease frees the only permit; it must be usable.
        drop(held);
        let lease = pool.lease(Priority::Low, &cancel).await.unwrap();
        drop(lease);
        pool.close().await;
    }

    #[tokio::test]
    async fn test_broken_lease_is_destroyed() {
        let factory = Arc::new(CountingFactory::new());
        let pool = pool_with(factory.clone(), 2, Duration::from_secs(30));
        let cancel = CancellationToken::new();

        let mut lease = pool.lease(Priority::Low, &cancel).await.unwrap();
        lease.mark_broken();
        drop(lease);
        assert_eq!(pool.idle_connections(), 0);
        assert_eq!(pool.live_connections(), 0);

        // Replacement is a fresh connection.
        let lease = pool.lease(Priority::Low, &cancel).await.unwrap();
        assert_eq!(*lease, 1);
        pool.close().await;
    }
}
