use async_trait::async_trait;

/// A live connection to some backend repository, owned by a
/// [`ConnectorPool`](crate::ConnectorPool).
///
/// The pool never constructs instances itself; construction (including the
/// implementation-specific connect step) happens in the factory closure
/// passed to [`grab`](crate::ConnectorPool::grab). The trait only covers
/// the lifecycle the pool drives on instances it holds: periodic keepalive
/// while idle, and teardown when an instance leaves the pool for good.
///
/// An instance is owned by exactly one place at any time: the pool's free
/// list, or the single caller that grabbed it. The pool only ever calls
/// these methods on idle instances; a checked-out instance belongs to its
/// holder alone.
#[async_trait]
pub trait Connector: Send + 'static {
    /// Tear down the underlying connection. Called when an instance is
    /// flushed from the pool or released into a pool that is shutting
    /// down. May block on I/O; the pool never holds its admission
    /// bookkeeping across this call.
    async fn disconnect(&mut self);

    /// Periodic keepalive hook, driven by pool maintenance on idle
    /// instances only
    async fn poll(&mut self) {}

    /// Whether the instance still holds a usable connection
    fn is_connected(&self) -> bool {
        true
    }
}
