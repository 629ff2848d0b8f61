use dashmap::DashMap;
use futures::future::BoxFuture;
use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::pin::pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

use crate::connector::Connector;
use crate::{ErrorKind, Result};

/// Identifies one pool of interchangeable connector instances: the
/// implementation class plus its configuration, serialized in a normalized
/// form so that equal configurations hash equally.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    /// The connector implementation this pool holds instances of
    pub class_name: String,
    /// Normalized serialized configuration of those instances
    pub config: String,
}

impl PoolKey {
    /// Create a pool key from a class name and its normalized configuration
    #[must_use]
    pub fn new(class_name: impl Into<String>, config: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
            config: config.into(),
        }
    }
}

impl fmt::Display for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.class_name, self.config)
    }
}

/// Where a granted connection came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionSource {
    /// An idle instance was reused from the pool's free list
    FromPool,
    /// A new instance was constructed against the pool's slot budget
    FromCreation,
}

/// A boxed async connector factory, used where several factories of
/// different closure types travel together (see
/// [`ConnectorPool::grab_multiple`])
pub type ConnectorFactory<T> = Box<dyn FnOnce() -> BoxFuture<'static, Result<T>> + Send>;

/// One resource request inside a [`ConnectorPool::grab_multiple`] call
pub struct GrabRequest<T: Connector> {
    /// Caller-supplied key that fixes this request's position in the
    /// global acquisition order. Callers that grab overlapping pool sets
    /// must use consistent ordering keys for the same pools; the multi-grab
    /// sorts by this key so overlapping sets can never deadlock each other.
    pub ordering_key: String,
    /// The pool to grab from
    pub key: PoolKey,
    /// Slot budget to establish if this key has never been seen
    pub max_pool_size: usize,
    /// Factory for the case where a new instance must be constructed
    pub create: ConnectorFactory<T>,
}

impl<T: Connector> fmt::Debug for GrabRequest<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GrabRequest")
            .field("ordering_key", &self.ordering_key)
            .field("key", &self.key)
            .field("max_pool_size", &self.max_pool_size)
            .finish_non_exhaustive()
    }
}

/// State of one keyed pool. `num_free` is the unused slot budget: at every
/// instant `num_free` plus the number of checked-out instances equals
/// `max`, and the free list never holds more than `num_free` instances.
struct PoolState<T> {
    alive: bool,
    max: usize,
    num_free: usize,
    idle: Vec<T>,
}

struct Pool<T> {
    state: Mutex<PoolState<T>>,
    notify: Notify,
}

impl<T: Connector> Pool<T> {
    fn new(max: usize) -> Self {
        Self {
            state: Mutex::new(PoolState {
                alive: true,
                max,
                num_free: max,
                idle: Vec::new(),
            }),
            notify: Notify::new(),
        }
    }

    async fn acquire<F, Fut>(&self, key: &PoolKey, create: F) -> Result<(T, ConnectionSource)>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut notified = pin!(self.notify.notified());
        let mut logged = false;
        loop {
            notified.as_mut().enable();
            {
                let mut state = self.state.lock().unwrap();
                if !state.alive {
                    return Err(ErrorKind::Shutdown);
                }
                if state.num_free > 0 {
                    state.num_free -= 1;
                    match state.idle.pop() {
                        Some(connector) => {
                            log::trace!("pool {key}: reusing idle connector");
                            return Ok((connector, ConnectionSource::FromPool));
                        }
                        // Slot claimed; construct outside the lock.
                        None => break,
                    }
                }
                if !logged {
                    log::debug!("pool {key}: all {} slots busy, waiting", state.max);
                    logged = true;
                }
            }
            notified.as_mut().await;
            notified.set(self.notify.notified());
        }

        // The claimed slot must survive neither a factory failure nor this
        // future being dropped mid-construction.
        let mut refund = SlotRefund {
            pool: self,
            armed: true,
        };
        log::debug!("pool {key}: constructing new connector");
        let connector = create().await?;
        refund.armed = false;
        Ok((connector, ConnectionSource::FromCreation))
    }

    /// Returns the instance back to the caller if the pool is already dead
    fn put_back(&self, connector: T) -> Option<T> {
        let mut state = self.state.lock().unwrap();
        if !state.alive {
            return Some(connector);
        }
        assert!(
            state.num_free < state.max,
            "released more connectors than were grabbed"
        );
        state.num_free += 1;
        state.idle.push(connector);
        drop(state);
        self.notify.notify_waiters();
        None
    }

    fn free_slot(&self) {
        let mut state = self.state.lock().unwrap();
        if !state.alive {
            return;
        }
        assert!(
            state.num_free < state.max,
            "discarded more connectors than were grabbed"
        );
        state.num_free += 1;
        drop(state);
        self.notify.notify_waiters();
    }

    /// Takes all idle instances out for maintenance, counting them against
    /// the budget while they are touched so concurrent grabs cannot exceed
    /// the instance bound in the meantime
    fn take_idle_for_maintenance(&self) -> Vec<T> {
        let mut state = self.state.lock().unwrap();
        if !state.alive {
            return Vec::new();
        }
        let taken = std::mem::take(&mut state.idle);
        state.num_free -= taken.len();
        taken
    }

    /// Restores the maintenance budget for `count` instances;
    /// `instances` may be fewer than `count` if some were destroyed
    fn finish_maintenance(&self, mut instances: Vec<T>, count: usize) -> Vec<T> {
        let mut state = self.state.lock().unwrap();
        if !state.alive {
            // Shut down while we held them; hand back for disposal.
            return instances;
        }
        state.num_free += count;
        state.idle.append(&mut instances);
        drop(state);
        self.notify.notify_waiters();
        Vec::new()
    }

    fn idle_count(&self) -> usize {
        self.state.lock().unwrap().idle.len()
    }

    fn max(&self) -> usize {
        self.state.lock().unwrap().max
    }
}

/// Restores a claimed-but-unused slot when construction fails or the
/// grabbing future is dropped mid-construction
struct SlotRefund<'a, T: Connector> {
    pool: &'a Pool<T>,
    armed: bool,
}

impl<T: Connector> Drop for SlotRefund<'_, T> {
    fn drop(&mut self) {
        if self.armed {
            let mut state = self.pool.state.lock().unwrap();
            if state.alive {
                state.num_free += 1;
            }
            drop(state);
            self.pool.notify.notify_waiters();
        }
    }
}

/// A bounded pool of connector instances, keyed by
/// (implementation class, normalized configuration).
///
/// Each key owns a fixed slot budget, established the first time the key is
/// seen. [`grab`](Self::grab) hands out an idle instance when one exists,
/// constructs a new one while the budget allows, and otherwise waits until
/// a holder releases. Instances are recycled LIFO, so the warmest
/// connection is reused first.
///
/// The pool tracks slots, not sockets: whether a slot currently has a
/// cached instance attached is invisible to the capacity accounting, which
/// is what keeps `num_free + checked_out == max` exact under every
/// interleaving of grabs, releases, failures, and cancelled waits.
pub struct ConnectorPool<T: Connector> {
    pools: DashMap<PoolKey, Arc<Pool<T>>>,
    alive: AtomicBool,
}

impl<T: Connector> Default for ConnectorPool<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Connector> fmt::Debug for ConnectorPool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectorPool")
            .field("pools", &self.pools.len())
            .field("alive", &self.alive.load(Ordering::Relaxed))
            .finish()
    }
}

impl<T: Connector> ConnectorPool<T> {
    /// Create an empty pool set
    #[must_use]
    pub fn new() -> Self {
        Self {
            pools: DashMap::new(),
            alive: AtomicBool::new(true),
        }
    }

    /// Obtain a connector instance for `key`, reusing an idle one when
    /// possible and constructing through `create` otherwise. Waits while
    /// the key's whole slot budget is checked out.
    ///
    /// The budget is fixed by the first grab for a key; later calls with a
    /// different `max_pool_size` keep the established budget and log a
    /// warning.
    ///
    /// # Errors
    ///
    /// Propagates the factory's error (the claimed slot is returned to the
    /// budget first), or [`ErrorKind::Shutdown`] if the pool is torn down
    /// while waiting.
    pub async fn grab<F, Fut>(
        &self,
        key: &PoolKey,
        max_pool_size: usize,
        create: F,
    ) -> Result<(T, ConnectionSource)>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if !self.alive.load(Ordering::Acquire) {
            return Err(ErrorKind::Shutdown);
        }
        let pool = self.pool_for(key, max_pool_size);
        pool.acquire(key, create).await
    }

    /// Grab several pool slots at once, deadlock-free.
    ///
    /// Acquisition happens in ascending order of each request's
    /// `ordering_key`, regardless of the order requests are listed in, so
    /// two callers needing overlapping pool sets always lock in the same
    /// global order. If any grab fails partway, everything already
    /// acquired is released in reverse acquisition order before the
    /// failure propagates; no instance stays checked out.
    ///
    /// Results come back in the caller's original request order.
    ///
    /// # Errors
    ///
    /// [`ErrorKind::DuplicateOrderingKey`] if two requests share an
    /// ordering key; otherwise whatever the failing grab reported.
    pub async fn grab_multiple(&self, requests: Vec<GrabRequest<T>>) -> Result<Vec<T>> {
        let mut seen = HashSet::new();
        for request in &requests {
            if !seen.insert(request.ordering_key.as_str()) {
                return Err(ErrorKind::DuplicateOrderingKey(request.ordering_key.clone()));
            }
        }

        let keys: Vec<PoolKey> = requests.iter().map(|r| r.key.clone()).collect();
        let mut order: Vec<usize> = (0..requests.len()).collect();
        order.sort_by(|&a, &b| requests[a].ordering_key.cmp(&requests[b].ordering_key));

        let mut requests: Vec<Option<GrabRequest<T>>> = requests.into_iter().map(Some).collect();
        let mut slots: Vec<Option<T>> = std::iter::repeat_with(|| None)
            .take(requests.len())
            .collect();
        let mut acquired: Vec<usize> = Vec::new();

        for &index in &order {
            let request = requests[index].take().expect("request taken twice");
            match self
                .grab(&request.key, request.max_pool_size, request.create)
                .await
            {
                Ok((connector, _)) => {
                    slots[index] = Some(connector);
                    acquired.push(index);
                }
                Err(e) => {
                    for &undo in acquired.iter().rev() {
                        self.release(&keys[undo], slots[undo].take()).await;
                    }
                    return Err(e);
                }
            }
        }

        Ok(slots
            .into_iter()
            .map(|slot| slot.expect("slot filled by acquisition walk"))
            .collect())
    }

    /// Return a grabbed instance to its pool's free list and wake waiters.
    ///
    /// `None` is a no-op, so the call can sit unconditionally on every exit
    /// path of a caller. If the pool has been shut down in the meantime the
    /// instance is disconnected and dropped instead of cached.
    pub async fn release(&self, key: &PoolKey, connector: Option<T>) {
        let Some(connector) = connector else {
            return;
        };
        let pool = self.pools.get(key).map(|p| Arc::clone(&p));
        let rejected = match pool {
            Some(pool) => pool.put_back(connector),
            None => Some(connector),
        };
        if let Some(mut connector) = rejected {
            log::warn!("pool {key}: released into a dead pool, disconnecting instance");
            connector.disconnect().await;
        }
    }

    /// Release a batch of instances; a convenience over [`release`](Self::release)
    pub async fn release_multiple(
        &self,
        connectors: impl IntoIterator<Item = (PoolKey, Option<T>)>,
    ) {
        for (key, connector) in connectors {
            self.release(&key, connector).await;
        }
    }

    /// Free the slot of a grabbed instance that was destroyed instead of
    /// returned. The instance itself never touches the free list; only the
    /// budget is restored.
    pub fn discard(&self, key: &PoolKey) {
        if let Some(pool) = self.pools.get(key) {
            pool.free_slot();
        }
    }

    /// Run the [`Connector::poll`] keepalive on every currently idle
    /// instance of `key`. Checked-out instances are untouched; only their
    /// holder may safely touch them.
    pub async fn poll_all(&self, key: &PoolKey) {
        let Some(pool) = self.pools.get(key).map(|p| Arc::clone(&p)) else {
            return;
        };
        let mut taken = pool.take_idle_for_maintenance();
        let count = taken.len();
        for connector in &mut taken {
            connector.poll().await;
        }
        let orphaned = pool.finish_maintenance(taken, count);
        for mut connector in orphaned {
            connector.disconnect().await;
        }
    }

    /// Disconnect and drop every idle instance of `key`, keeping the pool
    /// itself alive. Freed slots immediately allow fresh constructions.
    pub async fn flush_unused(&self, key: &PoolKey) {
        let Some(pool) = self.pools.get(key).map(|p| Arc::clone(&p)) else {
            return;
        };
        let taken = pool.take_idle_for_maintenance();
        let count = taken.len();
        for mut connector in taken {
            connector.disconnect().await;
        }
        let orphaned = pool.finish_maintenance(Vec::new(), count);
        debug_assert!(orphaned.is_empty());
    }

    /// Shut down the pool for `key`: disconnect idle instances and resolve
    /// every parked grab with [`ErrorKind::Shutdown`]. Instances currently
    /// checked out stay with their holders; releasing them later
    /// disconnects them.
    pub async fn release_all(&self, key: &PoolKey) {
        let Some(pool) = self.pools.get(key).map(|p| Arc::clone(&p)) else {
            return;
        };
        let taken = {
            let mut state = pool.state.lock().unwrap();
            state.alive = false;
            std::mem::take(&mut state.idle)
        };
        pool.notify.notify_waiters();
        log::debug!("pool {key}: shut down, disconnecting {} idle instances", taken.len());
        for mut connector in taken {
            connector.disconnect().await;
        }
    }

    /// Shut down every pool; see [`release_all`](Self::release_all)
    pub async fn shutdown(&self) {
        self.alive.store(false, Ordering::Release);
        let keys: Vec<PoolKey> = self.pools.iter().map(|entry| entry.key().clone()).collect();
        for key in keys {
            self.release_all(&key).await;
        }
    }

    /// Number of idle instances currently cached for `key`
    #[must_use]
    pub fn idle_count(&self, key: &PoolKey) -> usize {
        self.pools.get(key).map_or(0, |pool| pool.idle_count())
    }

    fn pool_for(&self, key: &PoolKey, max_pool_size: usize) -> Arc<Pool<T>> {
        if let Some(existing) = self.pools.get(key) {
            let pool = Arc::clone(&existing);
            drop(existing);
            let established = pool.max();
            if established != max_pool_size {
                log::warn!(
                    "pool {key}: requested size {max_pool_size} ignored, \
                     keeping established size {established}"
                );
            }
            return pool;
        }
        match self.pools.entry(key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(entry) => Arc::clone(entry.get()),
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                log::debug!("pool {key}: created with {max_pool_size} slots");
                Arc::clone(&entry.insert(Arc::new(Pool::new(max_pool_size))))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    /// Counts live (constructed, not yet disconnected) instances so tests
    /// can assert the pool bound
    #[derive(Debug)]
    struct TestConnector {
        id: usize,
        live: Arc<AtomicUsize>,
        connected: bool,
    }

    impl TestConnector {
        fn new(id: usize, live: &Arc<AtomicUsize>) -> Self {
            live.fetch_add(1, Ordering::SeqCst);
            Self {
                id,
                live: Arc::clone(live),
                connected: true,
            }
        }
    }

    #[async_trait]
    impl Connector for TestConnector {
        async fn disconnect(&mut self) {
            if self.connected {
                self.connected = false;
                self.live.fetch_sub(1, Ordering::SeqCst);
            }
        }

        fn is_connected(&self) -> bool {
            self.connected
        }
    }

    fn key(name: &str) -> PoolKey {
        PoolKey::new("test", name)
    }

    #[tokio::test]
    async fn grab_reuses_released_instances() {
        let pool = ConnectorPool::new();
        let live = Arc::new(AtomicUsize::new(0));
        let k = key("a");

        let (first, source) = pool
            .grab(&k, 2, || async { Ok(TestConnector::new(1, &live)) })
            .await
            .unwrap();
        assert_eq!(source, ConnectionSource::FromCreation);
        let first_id = first.id;
        pool.release(&k, Some(first)).await;

        let (again, source) = pool
            .grab(&k, 2, || async { Ok(TestConnector::new(2, &live)) })
            .await
            .unwrap();
        assert_eq!(source, ConnectionSource::FromPool);
        assert_eq!(again.id, first_id);
        assert_eq!(live.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn pool_never_exceeds_its_budget() {
        let pool = Arc::new(ConnectorPool::new());
        let live = Arc::new(AtomicUsize::new(0));
        let ids = Arc::new(AtomicUsize::new(0));
        let k = key("bounded");

        let mut tasks = Vec::new();
        for _ in 0..10 {
            let pool = Arc::clone(&pool);
            let live = Arc::clone(&live);
            let ids = Arc::clone(&ids);
            let k = k.clone();
            tasks.push(tokio::spawn(async move {
                for _ in 0..3 {
                    let (connector, _) = pool
                        .grab(&k, 3, || async {
                            Ok(TestConnector::new(
                                ids.fetch_add(1, Ordering::SeqCst),
                                &live,
                            ))
                        })
                        .await
                        .unwrap();
                    assert!(live.load(Ordering::SeqCst) <= 3);
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    pool.release(&k, Some(connector)).await;
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert!(live.load(Ordering::SeqCst) <= 3);
        assert_eq!(pool.idle_count(&k), live.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn construction_failure_returns_the_slot() {
        let pool: ConnectorPool<TestConnector> = ConnectorPool::new();
        let live = Arc::new(AtomicUsize::new(0));
        let k = key("failing");

        let result = pool
            .grab(&k, 1, || async {
                Err(ErrorKind::Connect("no route to host".into()))
            })
            .await;
        assert!(matches!(result, Err(ErrorKind::Connect(_))));

        // The single slot must still be grantable.
        let granted = tokio::time::timeout(
            Duration::from_secs(1),
            pool.grab(&k, 1, || async { Ok(TestConnector::new(7, &live)) }),
        )
        .await
        .expect("slot was leaked by the failed construction")
        .unwrap();
        assert_eq!(granted.1, ConnectionSource::FromCreation);
    }

    #[tokio::test]
    async fn cancelled_grab_does_not_leak_its_slot() {
        let pool: ConnectorPool<TestConnector> = ConnectorPool::new();
        let live = Arc::new(AtomicUsize::new(0));
        let k = key("cancelled");

        // A construction that never finishes; cancelling the grab while it
        // is in flight must refund the claimed slot.
        let hung = pool.grab(&k, 1, || async {
            std::future::pending::<()>().await;
            Ok(TestConnector::new(1, &live))
        });
        let cancelled = tokio::time::timeout(Duration::from_millis(10), hung).await;
        assert!(cancelled.is_err());

        let granted = tokio::time::timeout(
            Duration::from_secs(1),
            pool.grab(&k, 1, || async { Ok(TestConnector::new(2, &live)) }),
        )
        .await
        .expect("slot was leaked by the cancelled grab")
        .unwrap();
        assert_eq!(granted.1, ConnectionSource::FromCreation);
    }

    #[tokio::test]
    async fn grab_multiple_rolls_back_on_failure() {
        let pool: Arc<ConnectorPool<TestConnector>> = Arc::new(ConnectorPool::new());
        let live = Arc::new(AtomicUsize::new(0));

        let make = |name: &str, fail: bool| -> GrabRequest<TestConnector> {
            let live = Arc::clone(&live);
            GrabRequest {
                ordering_key: name.to_string(),
                key: key(name),
                max_pool_size: 2,
                create: Box::new(move || {
                    Box::pin(async move {
                        if fail {
                            Err(ErrorKind::Connect("refused".into()))
                        } else {
                            Ok(TestConnector::new(0, &live))
                        }
                    })
                }),
            }
        };

        let requests = vec![
            make("a", false),
            make("b", false),
            make("c", true),
            make("d", false),
            make("e", false),
        ];
        let result = pool.grab_multiple(requests).await;
        assert!(matches!(result, Err(ErrorKind::Connect(_))));

        // The two successful constructions were released back: their pools
        // hold them idle and the whole budget is free again.
        assert_eq!(pool.idle_count(&key("a")), 1);
        assert_eq!(pool.idle_count(&key("b")), 1);
        assert_eq!(pool.idle_count(&key("c")), 0);
        assert_eq!(pool.idle_count(&key("d")), 0);
        assert_eq!(live.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn grab_multiple_rejects_duplicate_ordering_keys() {
        let pool: ConnectorPool<TestConnector> = ConnectorPool::new();
        let live = Arc::new(AtomicUsize::new(0));
        let make = |name: &str| -> GrabRequest<TestConnector> {
            let live = Arc::clone(&live);
            GrabRequest {
                ordering_key: "same".to_string(),
                key: key(name),
                max_pool_size: 1,
                create: Box::new(move || Box::pin(async move { Ok(TestConnector::new(0, &live)) })),
            }
        };
        let result = pool.grab_multiple(vec![make("a"), make("b")]).await;
        assert!(matches!(result, Err(ErrorKind::DuplicateOrderingKey(_))));
        assert_eq!(live.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn release_none_is_a_no_op() {
        let pool: ConnectorPool<TestConnector> = ConnectorPool::new();
        pool.release(&key("missing"), None).await;
    }

    #[tokio::test]
    async fn shutdown_unblocks_parked_grabs() {
        let pool = Arc::new(ConnectorPool::new());
        let live = Arc::new(AtomicUsize::new(0));
        let k = key("tiny");

        let (held, _) = pool
            .grab(&k, 1, || async { Ok(TestConnector::new(1, &live)) })
            .await
            .unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            let live = Arc::clone(&live);
            let k = k.clone();
            tokio::spawn(async move {
                pool.grab(&k, 1, || async { Ok(TestConnector::new(2, &live)) })
                    .await
            })
        };
        tokio::task::yield_now().await;

        pool.shutdown().await;
        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(ErrorKind::Shutdown)));

        // Releasing the held instance into the dead pool disconnects it.
        pool.release(&k, Some(held)).await;
        assert_eq!(live.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn flush_unused_disconnects_idle_only() {
        let pool = Arc::new(ConnectorPool::new());
        let live = Arc::new(AtomicUsize::new(0));
        let k = key("flush");

        let (busy, _) = pool
            .grab(&k, 2, || async { Ok(TestConnector::new(1, &live)) })
            .await
            .unwrap();
        let (idle, _) = pool
            .grab(&k, 2, || async { Ok(TestConnector::new(2, &live)) })
            .await
            .unwrap();
        pool.release(&k, Some(idle)).await;

        pool.flush_unused(&k).await;
        assert_eq!(pool.idle_count(&k), 0);
        assert_eq!(live.load(Ordering::SeqCst), 1);
        assert!(busy.is_connected());

        pool.release(&k, Some(busy)).await;
        assert_eq!(pool.idle_count(&k), 1);
    }
}
