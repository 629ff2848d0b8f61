//! The throttle group registry and the three gates it hands out.
//!
//! A [`Throttler`] owns named throttle groups — the live per-bin counters
//! derived from each group's installed [`ThrottleSpec`] — and the
//! [`ConnectorPool`] its connection throttlers draw instances from.
//! Workers walk one path through here:
//!
//! 1. [`Throttler::obtain_connection_throttler`] binds a gate to a group,
//!    a pool key, and a bin set.
//! 2. [`ConnectionThrottler::wait_connection_available`] admits the worker
//!    and produces a pooled or fresh connector.
//! 3. [`ConnectionThrottler::connection_fetch_throttler`] →
//!    [`FetchThrottler::obtain_fetch_document_permission`] paces fetch
//!    starts.
//! 4. [`FetchThrottler::create_fetch_stream`] →
//!    [`StreamThrottler::obtain_read_permission`] /
//!    [`StreamThrottler::release_read_permission`] pace the bytes.
//! 5. [`ConnectionThrottler::note_returned_connection`] and one of the two
//!    confirm calls hand the connection back.

mod connection;
mod fetch;
mod stream;

pub use connection::ConnectionThrottler;
pub use fetch::FetchThrottler;
pub use stream::{StreamThrottler, ThrottledReader};

use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::pool::{ConnectorPool, PoolKey};
use crate::spec::ThrottleSpec;
use crate::{Connector, ErrorKind, Result};

use connection::ConnectionBin;
use fetch::FetchBin;
use stream::StreamBin;

/// How long a bin's bandwidth window must sit with no open stream and no
/// byte activity before [`Throttler::poll`] resets it
const DEFAULT_STREAM_IDLE_WINDOW: Duration = Duration::from_secs(60);

/// Policy for [`ConnectionThrottler::note_returned_connection`]: when is a
/// returned connection destroyed instead of kept warm in the pool?
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetentionPolicy {
    /// Destroy only when some bin of the connection's set has more
    /// connections checked out than its current limit allows — which
    /// happens when a spec update lowered the limit mid-flight
    #[default]
    WithinQuota,
    /// As [`WithinQuota`](Self::WithinQuota), and additionally destroy
    /// when the pool already holds this many idle instances for the
    /// connection's key
    IdleCap(usize),
}

/// One named throttling environment: the installed spec and the live bins
/// derived from it. Bins are created lazily, on the first connection
/// throttler that names them.
pub(crate) struct ThrottlingGroup {
    name: String,
    spec: RwLock<Arc<ThrottleSpec>>,
    connection_bins: DashMap<String, Arc<ConnectionBin>>,
    fetch_bins: DashMap<String, Arc<FetchBin>>,
    stream_bins: DashMap<String, Arc<StreamBin>>,
    /// Live connection throttlers bound to this group; the group must not
    /// be removed while nonzero
    throttler_refs: AtomicUsize,
}

impl ThrottlingGroup {
    fn new(name: &str, spec: Arc<ThrottleSpec>) -> Self {
        Self {
            name: name.to_string(),
            spec: RwLock::new(spec),
            connection_bins: DashMap::new(),
            fetch_bins: DashMap::new(),
            stream_bins: DashMap::new(),
            throttler_refs: AtomicUsize::new(0),
        }
    }

    /// Swap the installed spec wholesale and push the new limits into
    /// every live bin, waking waiters so admission re-evaluates
    fn install_spec(&self, spec: Arc<ThrottleSpec>) {
        *self.spec.write().unwrap() = Arc::clone(&spec);
        self.push_limits(&spec);
    }

    fn push_limits(&self, spec: &ThrottleSpec) {
        for bin in self.connection_bins.iter() {
            bin.value().update_max_open(spec.max_open_connections(bin.key()));
        }
        for bin in self.fetch_bins.iter() {
            bin.value()
                .update_min_interval(spec.min_time_between_fetches(bin.key()));
        }
        for bin in self.stream_bins.iter() {
            bin.value()
                .update_min_millis_per_byte(spec.min_millis_per_byte(bin.key()));
        }
    }

    /// Periodic tick: re-push limits and let idle bandwidth windows decay
    fn poll(&self, stream_idle_window: Duration) {
        let spec = Arc::clone(&self.spec.read().unwrap());
        self.push_limits(&spec);
        for bin in self.stream_bins.iter() {
            bin.value().poll_decay(stream_idle_window);
        }
    }

    /// Resolve (creating as needed) the three bins for every name in
    /// `bin_names`, in the given order
    fn bins_for(
        &self,
        bin_names: &[String],
    ) -> (Vec<Arc<ConnectionBin>>, Vec<Arc<FetchBin>>, Vec<Arc<StreamBin>>) {
        let spec = Arc::clone(&self.spec.read().unwrap());
        let mut connection = Vec::with_capacity(bin_names.len());
        let mut fetch = Vec::with_capacity(bin_names.len());
        let mut stream = Vec::with_capacity(bin_names.len());
        for name in bin_names {
            let entry = self.connection_bins.entry(name.clone()).or_insert_with(|| {
                Arc::new(ConnectionBin::new(name, spec.max_open_connections(name)))
            });
            connection.push(Arc::clone(entry.value()));
            drop(entry);

            let entry = self.fetch_bins.entry(name.clone()).or_insert_with(|| {
                Arc::new(FetchBin::new(name, spec.min_time_between_fetches(name)))
            });
            fetch.push(Arc::clone(entry.value()));
            drop(entry);

            let entry = self.stream_bins.entry(name.clone()).or_insert_with(|| {
                Arc::new(StreamBin::new(name, spec.min_millis_per_byte(name)))
            });
            stream.push(Arc::clone(entry.value()));
            drop(entry);
        }
        (connection, fetch, stream)
    }

    /// Unblock every parked waiter with the shutdown error and drop the bins
    fn destroy(&self) {
        log::debug!("throttle group '{}': destroying bins", self.name);
        for bin in self.connection_bins.iter() {
            bin.value().shut_down();
        }
        for bin in self.fetch_bins.iter() {
            bin.value().shut_down();
        }
        for bin in self.stream_bins.iter() {
            bin.value().shut_down();
        }
        self.connection_bins.clear();
        self.fetch_bins.clear();
        self.stream_bins.clear();
    }

    fn add_throttler_ref(&self) {
        self.throttler_refs.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn release_throttler_ref(&self) {
        self.throttler_refs.fetch_sub(1, Ordering::SeqCst);
    }
}

/// The throttle group registry: the entry point of the whole admission
/// layer.
///
/// One registry serves one connector family (it is generic over the pooled
/// connector type) and owns both the named throttle groups and the
/// [`ConnectorPool`] its gates draw from. It is an explicit object with an
/// explicit lifecycle — created at process start, passed by reference, torn
/// down with [`shutdown`](Self::shutdown) — never ambient global state.
///
/// All methods take `&self` and are safe to call from any number of tasks.
pub struct Throttler<T: Connector> {
    pool: Arc<ConnectorPool<T>>,
    groups: DashMap<String, Arc<ThrottlingGroup>>,
    retention: RetentionPolicy,
    stream_idle_window: Duration,
}

impl<T: Connector> Default for Throttler<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Connector> std::fmt::Debug for Throttler<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Throttler")
            .field("groups", &self.groups.len())
            .field("retention", &self.retention)
            .finish_non_exhaustive()
    }
}

impl<T: Connector> Throttler<T> {
    /// A registry with the default retention policy and idle window
    #[must_use]
    pub fn new() -> Self {
        Self {
            pool: Arc::new(ConnectorPool::new()),
            groups: DashMap::new(),
            retention: RetentionPolicy::default(),
            stream_idle_window: DEFAULT_STREAM_IDLE_WINDOW,
        }
    }

    /// Override the destroy-vs-pool policy applied when connections are
    /// returned
    #[must_use]
    pub fn with_retention_policy(mut self, retention: RetentionPolicy) -> Self {
        self.retention = retention;
        self
    }

    /// Override how long a bandwidth window may idle before
    /// [`poll`](Self::poll) resets it
    #[must_use]
    pub fn with_stream_idle_window(mut self, window: Duration) -> Self {
        self.stream_idle_window = window;
        self
    }

    /// Create the named group with `spec`, or atomically replace the
    /// existing group's spec. Readers in flight observe either the old or
    /// the new spec, never a mix; waiters parked on limits that just rose
    /// are woken.
    ///
    /// # Errors
    ///
    /// [`ErrorKind::InvalidThrottleSpec`] if a bin carries a value outside
    /// its domain; the installed spec is untouched in that case.
    pub fn create_or_update_throttle_group(&self, name: &str, spec: ThrottleSpec) -> Result<()> {
        spec.validate()?;
        let spec = Arc::new(spec);
        match self.groups.entry(name.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(entry) => {
                log::debug!("throttle group '{name}': spec updated");
                entry.get().install_spec(spec);
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                log::debug!("throttle group '{name}': created");
                entry.insert(Arc::new(ThrottlingGroup::new(name, spec)));
            }
        }
        Ok(())
    }

    /// Remove a group and its bookkeeping state, unblocking any straggler
    /// waits with the shutdown error. Removing a group that does not exist
    /// is a no-op.
    ///
    /// # Panics
    ///
    /// If a live [`ConnectionThrottler`] still references the group.
    /// Callers are responsible for dropping throttlers first; violating
    /// that is a protocol bug, not a runtime condition to tolerate.
    pub fn remove_throttle_group(&self, name: &str) {
        if let Some((_, group)) = self.groups.remove(name) {
            let refs = group.throttler_refs.load(Ordering::SeqCst);
            assert!(
                refs == 0,
                "removing throttle group '{name}' while {refs} connection throttler(s) still reference it"
            );
            group.destroy();
        }
    }

    /// Names of all live groups
    #[must_use]
    pub fn throttle_groups(&self) -> Vec<String> {
        self.groups.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Bind an admission gate to `group`, the pool slot-set at `pool_key`,
    /// and the given bins. Invoked once per logical outbound connection
    /// object, at connector construction time. The returned throttler
    /// holds a reference on the group until dropped.
    ///
    /// # Errors
    ///
    /// [`ErrorKind::UnknownThrottleGroup`] if the group was never created,
    /// [`ErrorKind::DuplicateBin`] if `bin_names` lists a bin twice.
    pub fn obtain_connection_throttler(
        &self,
        group_name: &str,
        pool_key: PoolKey,
        max_pool_size: usize,
        bin_names: &[&str],
    ) -> Result<ConnectionThrottler<T>> {
        let group = self
            .groups
            .get(group_name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| ErrorKind::UnknownThrottleGroup(group_name.to_string()))?;

        // Canonical order: overlapping bin sets from different throttlers
        // always acquire in the same sequence.
        let mut names: Vec<String> = bin_names.iter().map(ToString::to_string).collect();
        names.sort();
        for window in names.windows(2) {
            if window[0] == window[1] {
                return Err(ErrorKind::DuplicateBin(window[0].clone()));
            }
        }

        let (connection_bins, fetch_bins, stream_bins) = group.bins_for(&names);
        group.add_throttler_ref();
        Ok(ConnectionThrottler {
            group,
            pool: Arc::clone(&self.pool),
            pool_key,
            max_pool_size,
            retention: self.retention,
            connection_bins,
            fetch_bins,
            stream_bins,
        })
    }

    /// Periodic tick for one group: re-push the installed limits into its
    /// bins and reset bandwidth windows that have idled past the
    /// configured window. Driven by an external scheduler.
    ///
    /// # Errors
    ///
    /// [`ErrorKind::UnknownThrottleGroup`] if the group does not exist.
    pub fn poll(&self, group_name: &str) -> Result<()> {
        let group = self
            .groups
            .get(group_name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| ErrorKind::UnknownThrottleGroup(group_name.to_string()))?;
        group.poll(self.stream_idle_window);
        Ok(())
    }

    /// [`poll`](Self::poll) for every live group
    pub fn poll_all(&self) {
        for entry in self.groups.iter() {
            entry.value().poll(self.stream_idle_window);
        }
    }

    /// The connector pool this registry's gates draw from, for pool
    /// maintenance (`poll_all`, `flush_unused`) and multi-grabs
    #[must_use]
    pub fn pool(&self) -> &ConnectorPool<T> {
        &self.pool
    }

    /// Tear down everything: destroy every group, then shut the pool down.
    /// Every parked caller anywhere in the subsystem — admission, fetch
    /// pacing, read pacing, pool grabs — resolves with
    /// [`ErrorKind::Shutdown`].
    pub async fn shutdown(&self) {
        log::debug!("throttler: shutting down {} group(s)", self.groups.len());
        let groups: Vec<Arc<ThrottlingGroup>> = self
            .groups
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        self.groups.clear();
        for group in groups {
            group.destroy();
        }
        self.pool.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::BinLimits;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;
    use tokio::time::Instant;

    #[derive(Debug)]
    struct FakeConnection {
        connected: bool,
    }

    impl FakeConnection {
        fn new() -> Self {
            Self { connected: true }
        }
    }

    #[async_trait]
    impl Connector for FakeConnection {
        async fn disconnect(&mut self) {
            self.connected = false;
        }

        fn is_connected(&self) -> bool {
            self.connected
        }
    }

    fn spec_with(bin: &str, limits: BinLimits) -> ThrottleSpec {
        ThrottleSpec::new().with_bin(bin, limits)
    }

    fn capped(max: u32) -> BinLimits {
        BinLimits {
            max_open_connections: Some(max),
            ..BinLimits::unbounded()
        }
    }

    fn registry() -> Throttler<FakeConnection> {
        Throttler::new()
    }

    #[tokio::test]
    async fn unknown_group_is_an_error() {
        let throttler = registry();
        let result = throttler.obtain_connection_throttler(
            "missing",
            PoolKey::new("fake", "cfg"),
            4,
            &["global"],
        );
        assert!(matches!(result, Err(ErrorKind::UnknownThrottleGroup(_))));
    }

    #[tokio::test]
    async fn duplicate_bins_are_rejected() {
        let throttler = registry();
        throttler
            .create_or_update_throttle_group("g", ThrottleSpec::new())
            .unwrap();
        let result = throttler.obtain_connection_throttler(
            "g",
            PoolKey::new("fake", "cfg"),
            4,
            &["global", "global"],
        );
        assert!(matches!(result, Err(ErrorKind::DuplicateBin(_))));
    }

    #[tokio::test]
    async fn group_listing_and_removal() {
        let throttler = registry();
        throttler
            .create_or_update_throttle_group("a", ThrottleSpec::new())
            .unwrap();
        throttler
            .create_or_update_throttle_group("b", ThrottleSpec::new())
            .unwrap();
        let mut names = throttler.throttle_groups();
        names.sort();
        assert_eq!(names, ["a", "b"]);

        throttler.remove_throttle_group("a");
        assert_eq!(throttler.throttle_groups(), ["b"]);
        // Removing a missing group is a no-op.
        throttler.remove_throttle_group("a");
    }

    #[tokio::test]
    #[should_panic(expected = "still reference it")]
    async fn removing_a_referenced_group_panics() {
        let throttler = registry();
        throttler
            .create_or_update_throttle_group("g", ThrottleSpec::new())
            .unwrap();
        let _gate = throttler
            .obtain_connection_throttler("g", PoolKey::new("fake", "cfg"), 4, &["global"])
            .unwrap();
        throttler.remove_throttle_group("g");
    }

    #[tokio::test]
    async fn dropping_the_throttler_releases_the_group() {
        let throttler = registry();
        throttler
            .create_or_update_throttle_group("g", ThrottleSpec::new())
            .unwrap();
        let gate = throttler
            .obtain_connection_throttler("g", PoolKey::new("fake", "cfg"), 4, &["global"])
            .unwrap();
        drop(gate);
        throttler.remove_throttle_group("g");
    }

    #[tokio::test]
    async fn full_checkout_cycle() {
        let throttler = registry();
        throttler
            .create_or_update_throttle_group("g", spec_with("server:x", capped(2)))
            .unwrap();
        let gate = throttler
            .obtain_connection_throttler(
                "g",
                PoolKey::new("fake", "cfg"),
                2,
                &["global", "server:x"],
            )
            .unwrap();

        let (conn, source) = gate
            .wait_connection_available(|| async { Ok(FakeConnection::new()) })
            .await
            .unwrap();
        assert_eq!(source, crate::ConnectionSource::FromCreation);

        let fetcher = gate.connection_fetch_throttler();
        fetcher.obtain_fetch_document_permission().await.unwrap();
        let stream = fetcher.create_fetch_stream();
        stream.obtain_read_permission(1024).await.unwrap();
        stream.release_read_permission(1024, 1024);
        stream.close_stream();

        assert!(!gate.note_returned_connection());
        gate.note_connection_returned_to_pool(conn).await;

        // The second cycle reuses the pooled instance.
        let (conn, source) = gate
            .wait_connection_available(|| async { Ok(FakeConnection::new()) })
            .await
            .unwrap();
        assert_eq!(source, crate::ConnectionSource::FromPool);
        assert!(!gate.note_returned_connection());
        gate.note_connection_returned_to_pool(conn).await;
    }

    #[tokio::test]
    async fn lowering_the_limit_recommends_destruction() {
        let throttler = registry();
        throttler
            .create_or_update_throttle_group("g", spec_with("server:x", capped(2)))
            .unwrap();
        let gate = throttler
            .obtain_connection_throttler("g", PoolKey::new("fake", "cfg"), 2, &["server:x"])
            .unwrap();

        let (conn, _) = gate
            .wait_connection_available(|| async { Ok(FakeConnection::new()) })
            .await
            .unwrap();

        throttler
            .create_or_update_throttle_group("g", spec_with("server:x", capped(0)))
            .unwrap();

        assert!(gate.note_returned_connection());
        let mut conn = conn;
        conn.disconnect().await;
        gate.note_connection_destroyed();
    }

    #[tokio::test(start_paused = true)]
    async fn raising_the_limit_wakes_parked_admission() {
        let throttler = Arc::new(registry());
        throttler
            .create_or_update_throttle_group("g", spec_with("server:x", capped(0)))
            .unwrap();
        let gate = throttler
            .obtain_connection_throttler("g", PoolKey::new("fake", "cfg"), 1, &["server:x"])
            .unwrap();

        let admitted = Arc::new(AtomicU32::new(0));
        let waiter = {
            let admitted = Arc::clone(&admitted);
            let throttler = Arc::clone(&throttler);
            tokio::spawn(async move {
                let gate = throttler
                    .obtain_connection_throttler(
                        "g",
                        PoolKey::new("fake", "cfg"),
                        1,
                        &["server:x"],
                    )
                    .unwrap();
                let (conn, _) = gate
                    .wait_connection_available(|| async { Ok(FakeConnection::new()) })
                    .await
                    .unwrap();
                admitted.store(1, Ordering::SeqCst);
                gate.note_connection_returned_to_pool(conn).await;
            })
        };
        tokio::task::yield_now().await;
        assert_eq!(admitted.load(Ordering::SeqCst), 0);

        throttler
            .create_or_update_throttle_group("g", spec_with("server:x", capped(1)))
            .unwrap();
        waiter.await.unwrap();
        assert_eq!(admitted.load(Ordering::SeqCst), 1);
        drop(gate);
    }

    #[tokio::test]
    async fn shutdown_resolves_parked_admission() {
        let throttler = Arc::new(registry());
        throttler
            .create_or_update_throttle_group("g", spec_with("server:x", capped(0)))
            .unwrap();

        let waiter = {
            let throttler = Arc::clone(&throttler);
            tokio::spawn(async move {
                let gate = throttler
                    .obtain_connection_throttler(
                        "g",
                        PoolKey::new("fake", "cfg"),
                        1,
                        &["server:x"],
                    )
                    .unwrap();
                gate.wait_connection_available(|| async { Ok(FakeConnection::new()) })
                    .await
                    .map(|_| ())
            })
        };
        tokio::task::yield_now().await;

        throttler.shutdown().await;
        assert!(matches!(waiter.await.unwrap(), Err(ErrorKind::Shutdown)));
    }

    #[tokio::test(start_paused = true)]
    async fn poll_applies_idle_decay() {
        let throttler: Throttler<FakeConnection> =
            Throttler::new().with_stream_idle_window(Duration::from_secs(5));
        throttler
            .create_or_update_throttle_group(
                "g",
                spec_with(
                    "server:x",
                    BinLimits {
                        min_millis_per_byte: 1.0,
                        ..BinLimits::unbounded()
                    },
                ),
            )
            .unwrap();
        let gate = throttler
            .obtain_connection_throttler("g", PoolKey::new("fake", "cfg"), 1, &["server:x"])
            .unwrap();
        let fetcher = gate.connection_fetch_throttler();

        let stream = fetcher.create_fetch_stream();
        stream.obtain_read_permission(1000).await.unwrap();
        stream.release_read_permission(1000, 1000);
        stream.close_stream();

        tokio::time::sleep(Duration::from_secs(6)).await;
        throttler.poll("g").unwrap();

        // The window was reset: a new stream's first read is immediate.
        let stream = fetcher.create_fetch_stream();
        let start = Instant::now();
        stream.obtain_read_permission(1000).await.unwrap();
        assert_eq!(Instant::now(), start);
        stream.release_read_permission(1000, 1000);
        stream.close_stream();
    }
}
