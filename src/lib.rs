//! `weir` is the resource-admission layer of a crawling framework: it
//! decides when a connection to a crawled repository may be created or
//! reused, when a fetch may begin, and how fast bytes may be read from an
//! open transfer — all against per-target quotas that are configured
//! independently and can change at runtime.
//!
//! Quotas are expressed per *bin*, a named capacity/rate bucket. A single
//! connection typically participates in several bins at once (say,
//! `"global"` plus `"server:example.com"`), and admission is granted only
//! when every bin of the set has headroom simultaneously. Three limits
//! exist per bin: maximum open connections, minimum time between fetch
//! starts, and a minimum-milliseconds-per-byte bandwidth floor.
//!
//! ```no_run
//! use async_trait::async_trait;
//! use weir::{BinLimits, Connector, PoolKey, Result, ThrottleSpec, Throttler};
//!
//! struct RepoConnection;
//!
//! #[async_trait]
//! impl Connector for RepoConnection {
//!     async fn disconnect(&mut self) {}
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let throttler = Throttler::new();
//!     throttler.create_or_update_throttle_group(
//!         "web",
//!         ThrottleSpec::new().with_bin(
//!             "server:example.com",
//!             BinLimits {
//!                 max_open_connections: Some(2),
//!                 min_millis_per_byte: 0.5,
//!                 min_time_between_fetches: std::time::Duration::from_millis(250),
//!             },
//!         ),
//!     )?;
//!
//!     let gate = throttler.obtain_connection_throttler(
//!         "web",
//!         PoolKey::new("RepoConnection", "host=example.com"),
//!         4,
//!         &["global", "server:example.com"],
//!     )?;
//!
//!     let (connection, _source) = gate
//!         .wait_connection_available(|| async { Ok(RepoConnection) })
//!         .await?;
//!
//!     let fetcher = gate.connection_fetch_throttler();
//!     fetcher.obtain_fetch_document_permission().await?;
//!     let stream = fetcher.create_fetch_stream();
//!     stream.obtain_read_permission(4096).await?;
//!     // ... read up to 4096 bytes from the connection ...
//!     stream.release_read_permission(4096, 4096);
//!     stream.close_stream();
//!
//!     if gate.note_returned_connection() {
//!         // destroy `connection`, then:
//!         gate.note_connection_destroyed();
//!     } else {
//!         gate.note_connection_returned_to_pool(connection).await;
//!     }
//!     Ok(())
//! }
//! ```
//!
//! Everything blocks by waiting, never by erroring: capacity pressure and
//! pacing are handled inside the gates. The only failure outcomes are
//! configuration mistakes, factory failures, and
//! [`ErrorKind::Shutdown`] when the registry is torn down under parked
//! callers.
#![warn(missing_docs)]

mod connector;
mod error;
mod pool;
mod spec;
mod throttler;

pub use connector::Connector;
pub use error::{ErrorKind, Result};
pub use pool::{ConnectionSource, ConnectorFactory, ConnectorPool, GrabRequest, PoolKey};
pub use spec::{BinLimits, ThrottleSpec};
pub use throttler::{
    ConnectionThrottler, FetchThrottler, RetentionPolicy, StreamThrottler, ThrottledReader,
    Throttler,
};
