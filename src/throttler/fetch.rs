use std::pin::pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::stream::{StreamBin, StreamThrottler};
use crate::{ErrorKind, Result};

/// Fetch pacing for a single bin.
///
/// Consecutive fetch starts in a bin must be separated by the bin's
/// minimum interval. A one-deep reservation serializes competing fetchers:
/// holding the reservation in every bin of the set first, then waiting out
/// each bin's schedule, keeps the multi-bin grant atomic without holding
/// any lock while sleeping.
pub(crate) struct FetchBin {
    bin_name: String,
    state: Mutex<FetchBinState>,
    notify: Notify,
}

struct FetchBinState {
    alive: bool,
    min_interval: Duration,
    last_fetch_start: Option<Instant>,
    reserved: bool,
}

/// Far enough in the future to act as "park until reconfigured" when a
/// deadline computation overflows
const FAR_FUTURE: Duration = Duration::from_secs(60 * 60 * 24 * 365);

impl FetchBin {
    pub(crate) fn new(bin_name: &str, min_interval: Duration) -> Self {
        Self {
            bin_name: bin_name.to_string(),
            state: Mutex::new(FetchBinState {
                alive: true,
                min_interval,
                last_fetch_start: None,
                reserved: false,
            }),
            notify: Notify::new(),
        }
    }

    /// Wait until this bin's next-fetch slot is free and claim it. The
    /// claim is withdrawn with [`clear_reservation`](Self::clear_reservation)
    /// or consumed by [`wait_next_fetch`](Self::wait_next_fetch).
    pub(crate) async fn reserve_fetch(&self) -> Result<()> {
        let mut notified = pin!(self.notify.notified());
        loop {
            notified.as_mut().enable();
            {
                let mut state = self.state.lock().unwrap();
                if !state.alive {
                    return Err(ErrorKind::Shutdown);
                }
                if !state.reserved {
                    state.reserved = true;
                    return Ok(());
                }
            }
            notified.as_mut().await;
            notified.set(self.notify.notified());
        }
    }

    pub(crate) fn clear_reservation(&self) {
        let mut state = self.state.lock().unwrap();
        assert!(
            state.reserved,
            "bin '{}': clearing a fetch reservation that is not held",
            self.bin_name
        );
        state.reserved = false;
        drop(state);
        self.notify.notify_waiters();
    }

    /// Wait out the pacing schedule, stamp the fetch start, and release
    /// the reservation. Must hold the reservation from
    /// [`reserve_fetch`](Self::reserve_fetch).
    pub(crate) async fn wait_next_fetch(&self) -> Result<()> {
        let mut notified = pin!(self.notify.notified());
        let mut logged = false;
        loop {
            notified.as_mut().enable();
            let deadline = {
                let mut state = self.state.lock().unwrap();
                assert!(
                    state.reserved,
                    "bin '{}': no fetch reservation held",
                    self.bin_name
                );
                if !state.alive {
                    return Err(ErrorKind::Shutdown);
                }
                let now = Instant::now();
                let deadline = match state.last_fetch_start {
                    None => now,
                    Some(last) => last
                        .checked_add(state.min_interval)
                        .unwrap_or_else(|| now + FAR_FUTURE),
                };
                if deadline <= now {
                    state.last_fetch_start = Some(now);
                    state.reserved = false;
                    drop(state);
                    self.notify.notify_waiters();
                    return Ok(());
                }
                deadline
            };
            if !logged {
                log::debug!(
                    "bin '{}': waiting {}ms before next fetch",
                    self.bin_name,
                    deadline.saturating_duration_since(Instant::now()).as_millis()
                );
                logged = true;
            }
            tokio::select! {
                () = notified.as_mut() => {
                    notified.set(self.notify.notified());
                }
                () = tokio::time::sleep_until(deadline) => {}
            }
        }
    }

    pub(crate) fn update_min_interval(&self, min_interval: Duration) {
        let mut state = self.state.lock().unwrap();
        if state.min_interval != min_interval {
            log::debug!(
                "bin '{}': min time between fetches {:?} -> {:?}",
                self.bin_name,
                state.min_interval,
                min_interval
            );
            state.min_interval = min_interval;
            drop(state);
            self.notify.notify_waiters();
        }
    }

    pub(crate) fn shut_down(&self) {
        self.state.lock().unwrap().alive = false;
        self.notify.notify_waiters();
    }
}

/// Clears the fetch reservations in `bins[from..to]` if the grant walk
/// fails or is cancelled while they are still held
struct FetchReservations<'a> {
    bins: &'a [Arc<FetchBin>],
    from: usize,
    to: usize,
}

impl Drop for FetchReservations<'_> {
    fn drop(&mut self) {
        for bin in self.bins[self.from..self.to].iter().rev() {
            bin.clear_reservation();
        }
    }
}

/// The fetch pacing gate for one checked-out connection, scoped to the
/// connection's bins. Obtained once per checkout from
/// [`ConnectionThrottler::connection_fetch_throttler`](super::ConnectionThrottler::connection_fetch_throttler).
pub struct FetchThrottler {
    fetch_bins: Vec<Arc<FetchBin>>,
    stream_bins: Vec<Arc<StreamBin>>,
}

impl FetchThrottler {
    pub(crate) fn new(fetch_bins: Vec<Arc<FetchBin>>, stream_bins: Vec<Arc<StreamBin>>) -> Self {
        Self {
            fetch_bins,
            stream_bins,
        }
    }

    /// Wait until a fetch may start in every bin of the set, then stamp
    /// the fetch start time in all of them.
    ///
    /// Two phases, both in canonical bin order: first claim each bin's
    /// next-fetch slot (so competing fetchers serialize without deadlock),
    /// then wait out each bin's schedule. Claims not yet converted are
    /// withdrawn if the wait is interrupted.
    ///
    /// # Errors
    ///
    /// [`ErrorKind::Shutdown`] if the group is torn down while waiting.
    pub async fn obtain_fetch_document_permission(&self) -> Result<()> {
        let mut claims = FetchReservations {
            bins: &self.fetch_bins,
            from: 0,
            to: 0,
        };
        for (i, bin) in self.fetch_bins.iter().enumerate() {
            bin.reserve_fetch().await?;
            claims.to = i + 1;
        }
        for (i, bin) in self.fetch_bins.iter().enumerate() {
            // A successful wait releases that bin's claim itself.
            bin.wait_next_fetch().await?;
            claims.from = i + 1;
        }
        Ok(())
    }

    /// Open the bandwidth pacing context for the fetch about to happen.
    /// Close it with [`StreamThrottler::close_stream`] (or by dropping it)
    /// when the transfer ends, successfully or not.
    #[must_use]
    pub fn create_fetch_stream(&self) -> StreamThrottler {
        for bin in &self.stream_bins {
            bin.begin_stream();
        }
        StreamThrottler::new(self.stream_bins.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn throttler_for(bins: Vec<Arc<FetchBin>>) -> FetchThrottler {
        FetchThrottler::new(bins, Vec::new())
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_starts_respect_the_minimum_interval() {
        let bin = Arc::new(FetchBin::new("paced", Duration::from_millis(20)));
        let throttler = throttler_for(vec![Arc::clone(&bin)]);

        let mut stamps = Vec::new();
        for _ in 0..5 {
            throttler.obtain_fetch_document_permission().await.unwrap();
            stamps.push(Instant::now());
        }
        for pair in stamps.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(20));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn zero_interval_grants_immediately() {
        let bin = Arc::new(FetchBin::new("free", Duration::ZERO));
        let throttler = throttler_for(vec![bin]);

        let start = Instant::now();
        for _ in 0..10 {
            throttler.obtain_fetch_document_permission().await.unwrap();
        }
        assert_eq!(Instant::now(), start);
    }

    #[tokio::test(start_paused = true)]
    async fn competing_fetchers_are_serialized() {
        let bin = Arc::new(FetchBin::new("shared", Duration::from_millis(10)));
        let stamps = Arc::new(Mutex::new(Vec::new()));

        let mut tasks = Vec::new();
        for _ in 0..4 {
            let bin = Arc::clone(&bin);
            let stamps = Arc::clone(&stamps);
            tasks.push(tokio::spawn(async move {
                let throttler = throttler_for(vec![bin]);
                for _ in 0..3 {
                    throttler.obtain_fetch_document_permission().await.unwrap();
                    stamps.lock().unwrap().push(Instant::now());
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let mut stamps = stamps.lock().unwrap().clone();
        stamps.sort();
        assert_eq!(stamps.len(), 12);
        for pair in stamps.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(10));
        }
    }

    #[tokio::test]
    async fn shutdown_unblocks_a_parked_fetch() {
        let bin = Arc::new(FetchBin::new("dying", Duration::from_secs(3600)));
        let throttler = throttler_for(vec![Arc::clone(&bin)]);
        throttler.obtain_fetch_document_permission().await.unwrap();

        let waiter = {
            let bin = Arc::clone(&bin);
            tokio::spawn(async move {
                throttler_for(vec![bin])
                    .obtain_fetch_document_permission()
                    .await
            })
        };
        tokio::task::yield_now().await;
        bin.shut_down();
        assert!(matches!(waiter.await.unwrap(), Err(ErrorKind::Shutdown)));
    }

    #[test]
    #[should_panic(expected = "clearing a fetch reservation that is not held")]
    fn clearing_an_unheld_reservation_panics() {
        let bin = FetchBin::new("strict", Duration::ZERO);
        bin.clear_reservation();
    }
}
