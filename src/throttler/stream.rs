use std::pin::pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::{ErrorKind, Result};

/// Bandwidth pacing for a single bin.
///
/// Pacing is a lazy floor on elapsed time rather than a token bucket:
/// before an `n`-byte read is granted, the wall-clock time since the bin's
/// first byte must be at least `(cumulative_bytes + n) × min_millis_per_byte`.
/// Bursty short reads catch up naturally; sustained throughput stays
/// bounded. Two counters per bin is all it takes.
///
/// The window spans fetches: back-to-back transfers in the same bin keep
/// paying into the same floor. Only genuine idleness resets it, via
/// [`poll_decay`](Self::poll_decay).
pub(crate) struct StreamBin {
    bin_name: String,
    state: Mutex<StreamBinState>,
    notify: Notify,
}

struct StreamBinState {
    alive: bool,
    min_millis_per_byte: f64,
    /// When the window opened; `None` until the first paced byte
    first_byte: Option<Instant>,
    /// Bytes granted since `first_byte`, reconciled to actual counts as
    /// reads complete
    cumulative_bytes: u64,
    /// Streams currently open on this bin
    active_streams: u32,
    last_activity: Instant,
}

impl StreamBin {
    pub(crate) fn new(bin_name: &str, min_millis_per_byte: f64) -> Self {
        Self {
            bin_name: bin_name.to_string(),
            state: Mutex::new(StreamBinState {
                alive: true,
                min_millis_per_byte,
                first_byte: None,
                cumulative_bytes: 0,
                active_streams: 0,
                last_activity: Instant::now(),
            }),
            notify: Notify::new(),
        }
    }

    pub(crate) fn begin_stream(&self) {
        let mut state = self.state.lock().unwrap();
        state.active_streams += 1;
        state.last_activity = Instant::now();
    }

    pub(crate) fn end_stream(&self) {
        let mut state = self.state.lock().unwrap();
        assert!(
            state.active_streams > 0,
            "bin '{}': closing a stream that is not open",
            self.bin_name
        );
        state.active_streams -= 1;
        state.last_activity = Instant::now();
    }

    /// Wait until the bandwidth floor allows reading `byte_count` more
    /// bytes, then count them. The first paced byte of a fresh window
    /// opens the window and is granted immediately; there is no history to
    /// pace against.
    pub(crate) async fn begin_read(&self, byte_count: usize) -> Result<()> {
        let mut notified = pin!(self.notify.notified());
        let mut logged = false;
        loop {
            notified.as_mut().enable();
            let deadline = {
                let mut state = self.state.lock().unwrap();
                if !state.alive {
                    return Err(ErrorKind::Shutdown);
                }
                let now = Instant::now();
                let Some(first_byte) = state.first_byte else {
                    state.first_byte = Some(now);
                    state.cumulative_bytes = byte_count as u64;
                    state.last_activity = now;
                    return Ok(());
                };
                let projected = state.cumulative_bytes.saturating_add(byte_count as u64);
                let floor = millis_for_bytes(projected, state.min_millis_per_byte);
                let deadline = first_byte
                    .checked_add(floor)
                    .unwrap_or_else(|| now + Duration::from_secs(60 * 60 * 24 * 365));
                if deadline <= now {
                    state.cumulative_bytes = projected;
                    state.last_activity = now;
                    return Ok(());
                }
                deadline
            };
            if !logged {
                log::debug!(
                    "bin '{}': read wait of {}ms for {byte_count} bytes",
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

    /// Reconcile a granted read against what was actually read. A short
    /// read lowers the floor, so waiters are woken to re-check.
    pub(crate) fn end_read(&self, original_count: usize, actual_count: usize) {
        let mut state = self.state.lock().unwrap();
        state.cumulative_bytes = state
            .cumulative_bytes
            .saturating_add(actual_count as u64)
            .saturating_sub(original_count as u64);
        state.last_activity = Instant::now();
        drop(state);
        self.notify.notify_waiters();
    }

    /// Reset the bandwidth window if the bin has been idle long enough.
    /// Driven by registry polling.
    pub(crate) fn poll_decay(&self, idle_window: Duration) {
        let mut state = self.state.lock().unwrap();
        if state.active_streams == 0
            && state.first_byte.is_some()
            && Instant::now().saturating_duration_since(state.last_activity) >= idle_window
        {
            log::debug!(
                "bin '{}': idle for {idle_window:?}, resetting bandwidth window",
                self.bin_name
            );
            state.first_byte = None;
            state.cumulative_bytes = 0;
        }
    }

    pub(crate) fn update_min_millis_per_byte(&self, min_millis_per_byte: f64) {
        let mut state = self.state.lock().unwrap();
        #[allow(clippy::float_cmp)]
        if state.min_millis_per_byte != min_millis_per_byte {
            log::debug!(
                "bin '{}': min millis per byte {} -> {}",
                self.bin_name,
                state.min_millis_per_byte,
                min_millis_per_byte
            );
            state.min_millis_per_byte = min_millis_per_byte;
            drop(state);
            self.notify.notify_waiters();
        }
    }

    pub(crate) fn shut_down(&self) {
        self.state.lock().unwrap().alive = false;
        self.notify.notify_waiters();
    }
}

fn millis_for_bytes(bytes: u64, min_millis_per_byte: f64) -> Duration {
    // Validated finite and non-negative at spec construction; an
    // astronomical product still must not panic, it just parks until the
    // spec changes.
    Duration::try_from_secs_f64(bytes as f64 * min_millis_per_byte / 1000.0)
        .unwrap_or(Duration::MAX)
}

/// Rolls back the byte counts granted to `bins[..granted]` if a later bin
/// reports shutdown or the wait is cancelled
struct ReadGrants<'a> {
    bins: &'a [Arc<StreamBin>],
    byte_count: usize,
    granted: usize,
}

impl Drop for ReadGrants<'_> {
    fn drop(&mut self) {
        for bin in self.bins[..self.granted].iter().rev() {
            bin.end_read(self.byte_count, 0);
        }
    }
}

/// The bandwidth pacing gate for one transfer, created per fetch by
/// [`FetchThrottler::create_fetch_stream`](super::FetchThrottler::create_fetch_stream).
///
/// Call [`obtain_read_permission`](Self::obtain_read_permission) before
/// every read and [`release_read_permission`](Self::release_read_permission)
/// after it — regardless of whether the read succeeded — so the counters
/// track what actually crossed the wire. Dropping the throttler closes the
/// stream.
pub struct StreamThrottler {
    stream_bins: Vec<Arc<StreamBin>>,
}

impl StreamThrottler {
    pub(crate) fn new(stream_bins: Vec<Arc<StreamBin>>) -> Self {
        Self { stream_bins }
    }

    /// Wait until every bin's bandwidth floor allows a read of up to
    /// `byte_count` bytes.
    ///
    /// # Errors
    ///
    /// [`ErrorKind::Shutdown`] if the group is torn down while waiting;
    /// grants already made to other bins are rolled back first.
    pub async fn obtain_read_permission(&self, byte_count: usize) -> Result<()> {
        let mut grants = ReadGrants {
            bins: &self.stream_bins,
            byte_count,
            granted: 0,
        };
        for (i, bin) in self.stream_bins.iter().enumerate() {
            bin.begin_read(byte_count).await?;
            grants.granted = i + 1;
        }
        grants.granted = 0;
        Ok(())
    }

    /// Reconcile the last permission against the byte count the read
    /// actually returned (a network read may return fewer bytes than
    /// requested, and zero on failure)
    pub fn release_read_permission(&self, byte_count: usize, actual_count: usize) {
        for bin in &self.stream_bins {
            bin.end_read(byte_count, actual_count);
        }
    }

    /// Detach the pacing context. Equivalent to dropping the throttler;
    /// provided so call sites can make the end of the transfer explicit.
    pub fn close_stream(self) {
        drop(self);
    }
}

impl Drop for StreamThrottler {
    fn drop(&mut self) {
        for bin in &self.stream_bins {
            bin.end_stream();
        }
    }
}

/// Wraps an [`AsyncRead`] source so every chunk read is paced by a
/// [`StreamThrottler`], the way a repository connector wraps the body
/// stream of a fetch. Permission is released on every path, including read
/// errors; dropping the reader closes the stream context.
pub struct ThrottledReader<R> {
    inner: R,
    throttler: StreamThrottler,
}

impl<R: AsyncRead + Unpin> ThrottledReader<R> {
    /// Pace `inner` against `throttler`
    pub fn new(inner: R, throttler: StreamThrottler) -> Self {
        Self { inner, throttler }
    }

    /// Read up to `buf.len()` bytes, waiting for bandwidth permission
    /// first. Returns the number of bytes read; zero means end of stream.
    ///
    /// # Errors
    ///
    /// [`ErrorKind::Shutdown`] if the throttler is torn down while
    /// waiting, or [`ErrorKind::Io`] if the underlying read fails (the
    /// permission is released with an actual count of zero).
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.throttler.obtain_read_permission(buf.len()).await?;
        match self.inner.read(buf).await {
            Ok(actual) => {
                self.throttler.release_read_permission(buf.len(), actual);
                Ok(actual)
            }
            Err(e) => {
                self.throttler.release_read_permission(buf.len(), 0);
                Err(e.into())
            }
        }
    }

    /// Unwrap the source, closing the stream context
    pub fn into_inner(self) -> R {
        self.inner
    }
}
