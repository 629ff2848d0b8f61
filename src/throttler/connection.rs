use std::future::Future;
use std::pin::pin;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

use super::fetch::{FetchBin, FetchThrottler};
use super::stream::StreamBin;
use super::{RetentionPolicy, ThrottlingGroup};
use crate::pool::{ConnectionSource, ConnectorPool, PoolKey};
use crate::{Connector, ErrorKind, Result};

/// Connection tracking for a single bin.
///
/// Tracks how many connections that share this bin name are checked out,
/// plus how many slots are promised to callers that are still acquiring
/// the rest of their bin set. A caller holds a connection in *every* bin of
/// its set simultaneously, so admission means finding headroom in all of
/// them; the reservation split lets that happen one bin at a time without
/// ever overshooting any single bin's limit.
pub(crate) struct ConnectionBin {
    bin_name: String,
    state: Mutex<ConnectionBinState>,
    notify: Notify,
}

struct ConnectionBinState {
    alive: bool,
    /// `None` is unbounded
    max_open: Option<u32>,
    /// Connections currently checked out through this bin
    open: u32,
    /// Slots promised to in-flight multi-bin acquisitions
    reserved: u32,
}

impl ConnectionBin {
    pub(crate) fn new(bin_name: &str, max_open: Option<u32>) -> Self {
        Self {
            bin_name: bin_name.to_string(),
            state: Mutex::new(ConnectionBinState {
                alive: true,
                max_open,
                open: 0,
                reserved: 0,
            }),
            notify: Notify::new(),
        }
    }

    /// Wait until this bin has headroom and promise one slot to the caller.
    /// The caller either converts the promise with
    /// [`commit_reservation`](Self::commit_reservation) or withdraws it with
    /// [`unreserve`](Self::unreserve).
    pub(crate) async fn reserve(&self) -> Result<()> {
        let mut notified = pin!(self.notify.notified());
        let mut logged = false;
        loop {
            notified.as_mut().enable();
            {
                let mut state = self.state.lock().unwrap();
                if !state.alive {
                    return Err(ErrorKind::Shutdown);
                }
                let headroom = state
                    .max_open
                    .is_none_or(|max| state.open + state.reserved < max);
                if headroom {
                    state.reserved += 1;
                    return Ok(());
                }
                if !logged {
                    log::debug!(
                        "bin '{}': {} connections open, waiting for headroom",
                        self.bin_name,
                        state.open
                    );
                    logged = true;
                }
            }
            notified.as_mut().await;
            notified.set(self.notify.notified());
        }
    }

    pub(crate) fn unreserve(&self) {
        let mut state = self.state.lock().unwrap();
        assert!(
            state.reserved > 0,
            "bin '{}': withdrawing a connection reservation that is not held",
            self.bin_name
        );
        state.reserved -= 1;
        drop(state);
        self.notify.notify_waiters();
    }

    /// Convert a promised slot into a checked-out connection. No wakeup:
    /// the reserved-plus-open total does not change.
    pub(crate) fn commit_reservation(&self) {
        let mut state = self.state.lock().unwrap();
        assert!(
            state.reserved > 0,
            "bin '{}': committing a connection reservation that is not held",
            self.bin_name
        );
        state.reserved -= 1;
        state.open += 1;
    }

    /// A checked-out connection left this bin (returned to the pool or
    /// destroyed)
    pub(crate) fn note_released(&self) {
        let mut state = self.state.lock().unwrap();
        assert!(
            state.open > 0,
            "bin '{}': connection returned more times than checked out",
            self.bin_name
        );
        state.open -= 1;
        drop(state);
        self.notify.notify_waiters();
    }

    /// Whether more connections are checked out than the current limit
    /// allows (possible after a spec update lowered the limit)
    pub(crate) fn over_quota(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.max_open.is_some_and(|max| state.open > max)
    }

    pub(crate) fn update_max_open(&self, max_open: Option<u32>) {
        let mut state = self.state.lock().unwrap();
        if state.max_open != max_open {
            log::debug!(
                "bin '{}': max open connections {:?} -> {:?}",
                self.bin_name,
                state.max_open,
                max_open
            );
            state.max_open = max_open;
            drop(state);
            self.notify.notify_waiters();
        }
    }

    pub(crate) fn shut_down(&self) {
        self.state.lock().unwrap().alive = false;
        self.notify.notify_waiters();
    }

    #[cfg(test)]
    pub(crate) fn open_count(&self) -> u32 {
        self.state.lock().unwrap().open
    }
}

/// Unwinds bin reservations if a multi-bin acquisition fails or is
/// cancelled partway
struct Reservations<'a> {
    bins: &'a [Arc<ConnectionBin>],
    taken: usize,
}

impl Reservations<'_> {
    /// Convert every reservation into an open connection. Runs
    /// synchronously, so it cannot be interrupted halfway.
    fn commit(mut self) {
        for bin in &self.bins[..self.taken] {
            bin.commit_reservation();
        }
        self.taken = 0;
    }
}

impl Drop for Reservations<'_> {
    fn drop(&mut self) {
        for bin in self.bins[..self.taken].iter().rev() {
            bin.unreserve();
        }
    }
}

/// Decrements the freshly-incremented open counters if the pool grab that
/// follows admission fails or is cancelled
struct OpenConnections<'a> {
    bins: &'a [Arc<ConnectionBin>],
    armed: bool,
}

impl Drop for OpenConnections<'_> {
    fn drop(&mut self) {
        if self.armed {
            for bin in self.bins.iter().rev() {
                bin.note_released();
            }
        }
    }
}

/// The admission gate for one family of connections: one throttle group,
/// one pool key, one fixed set of bins.
///
/// Obtained from
/// [`Throttler::obtain_connection_throttler`](crate::Throttler::obtain_connection_throttler);
/// typically lives as long as the repository connection object that owns
/// it. The bin set is held in
/// a canonical sorted order internally, so overlapping bin sets acquired by
/// different throttlers always lock in one global order and cannot
/// deadlock each other.
pub struct ConnectionThrottler<T: Connector> {
    pub(crate) group: Arc<ThrottlingGroup>,
    pub(crate) pool: Arc<ConnectorPool<T>>,
    pub(crate) pool_key: PoolKey,
    pub(crate) max_pool_size: usize,
    pub(crate) retention: RetentionPolicy,
    pub(crate) connection_bins: Vec<Arc<ConnectionBin>>,
    pub(crate) fetch_bins: Vec<Arc<FetchBin>>,
    pub(crate) stream_bins: Vec<Arc<StreamBin>>,
}

impl<T: Connector> ConnectionThrottler<T> {
    /// Wait until every bin in the set has headroom, check the connection
    /// out of all of them, and obtain the underlying connector: an idle
    /// instance from the pool ([`ConnectionSource::FromPool`]) or a fresh
    /// one built by `create` ([`ConnectionSource::FromCreation`]).
    ///
    /// Admission is all-or-nothing: a slot is promised in each bin in
    /// canonical order, and only when every bin of the set holds a promise
    /// are they all converted to open connections, so no single bin's
    /// limit is ever overshot and partial acquisitions always unwind.
    ///
    /// # Errors
    ///
    /// [`ErrorKind::Shutdown`] if the group or pool is torn down while
    /// waiting (nothing stays reserved), or the factory's error if
    /// construction fails (the bin checkouts are rolled back first).
    pub async fn wait_connection_available<F, Fut>(
        &self,
        create: F,
    ) -> Result<(T, ConnectionSource)>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut reservations = Reservations {
            bins: &self.connection_bins,
            taken: 0,
        };
        for bin in &self.connection_bins {
            bin.reserve().await?;
            reservations.taken += 1;
        }
        reservations.commit();

        let mut open = OpenConnections {
            bins: &self.connection_bins,
            armed: true,
        };
        let (connector, source) = self
            .pool
            .grab(&self.pool_key, self.max_pool_size, create)
            .await?;
        open.armed = false;
        Ok((connector, source))
    }

    /// The fetch pacing gate for a connection checked out through this
    /// throttler, scoped to the same bins. Obtain one per checkout.
    #[must_use]
    pub fn connection_fetch_throttler(&self) -> FetchThrottler {
        FetchThrottler::new(self.fetch_bins.clone(), self.stream_bins.clone())
    }

    /// Signal that the caller is done *using* a checked-out connection and
    /// ask whether it should be destroyed rather than kept warm.
    ///
    /// `true` means destroy: the caller disconnects the instance itself and
    /// then calls [`note_connection_destroyed`](Self::note_connection_destroyed).
    /// `false` means pool it via
    /// [`note_connection_returned_to_pool`](Self::note_connection_returned_to_pool).
    /// Exactly one of the two must follow each checkout — this split keeps
    /// teardown I/O (which may block) outside the window where the bin
    /// counters are still held, and guarantees the counters are decremented
    /// exactly once per checkout.
    #[must_use]
    pub fn note_returned_connection(&self) -> bool {
        let over_quota = self.connection_bins.iter().any(|bin| bin.over_quota());
        match self.retention {
            RetentionPolicy::WithinQuota => over_quota,
            RetentionPolicy::IdleCap(cap) => {
                over_quota || self.pool.idle_count(&self.pool_key) >= cap
            }
        }
    }

    /// Confirm that a checked-out connection went back to the pool's free
    /// list. Decrements every bin and wakes admission waiters.
    pub async fn note_connection_returned_to_pool(&self, connector: T) {
        for bin in self.connection_bins.iter().rev() {
            bin.note_released();
        }
        self.pool.release(&self.pool_key, Some(connector)).await;
    }

    /// Confirm that a checked-out connection was destroyed (the caller has
    /// already disconnected it). Decrements every bin and frees the pool
    /// slot without touching the free list.
    pub fn note_connection_destroyed(&self) {
        for bin in self.connection_bins.iter().rev() {
            bin.note_released();
        }
        self.pool.discard(&self.pool_key);
    }
}

impl<T: Connector> Drop for ConnectionThrottler<T> {
    fn drop(&mut self) {
        self.group.release_throttler_ref();
    }
}
