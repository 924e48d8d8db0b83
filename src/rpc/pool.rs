//! Bounded pool of reusable client connections.
//!
//! `get` hands out an idle connection when one is available and otherwise
//! builds a new one through the factory; it never waits for capacity. `put`
//! keeps a connection only while there is room, so the capacity is a hard
//! cap on idle connections rather than on connections in use.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex, RwLock, mpsc};
use tracing::debug;

use super::codec::{Codec, JsonCodec};
use super::connection::Connection;
use crate::error::{Error, Result};

/// Boxed future returned by connection factories.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Constructor for fresh connections.
pub type Factory<C> = Arc<dyn Fn() -> BoxFuture<'static, Result<Connection<C>>> + Send + Sync>;

/// Channel-backed connection pool.
///
/// Cloning yields another handle to the same pool.
pub struct ChanPool<C: Codec> {
    shared: Arc<PoolShared<C>>,
}

impl<C: Codec> Clone for ChanPool<C> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

/// State shared between pool handles. Connections point here weakly.
pub(crate) struct PoolShared<C: Codec> {
    /// `None` once the pool is closed.
    state: RwLock<Option<PoolState<C>>>,
}

struct PoolState<C: Codec> {
    idle: Arc<IdleBuffer<C>>,
    factory: Factory<C>,
}

struct IdleBuffer<C: Codec> {
    tx: mpsc::Sender<Connection<C>>,
    rx: Mutex<mpsc::Receiver<Connection<C>>>,
}

impl<C: Codec> IdleBuffer<C> {
    fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            tx,
            rx: Mutex::new(rx),
        }
    }

    async fn take(&self) -> Option<Connection<C>> {
        self.rx.lock().await.try_recv().ok()
    }

    fn len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }
}

/// Builder for [`ChanPool`].
pub struct PoolBuilder<C: Codec> {
    capacity: usize,
    factory: Option<Factory<C>>,
}

impl<C: Codec> Default for PoolBuilder<C> {
    fn default() -> Self {
        Self {
            capacity: 0,
            factory: None,
        }
    }
}

impl<C: Codec> PoolBuilder<C> {
    /// Maximum number of idle connections kept.
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Function used to build a connection whenever the pool has none idle.
    pub fn factory<F, Fut>(mut self, factory: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Connection<C>>> + Send + 'static,
    {
        let factory: Factory<C> =
            Arc::new(move || -> BoxFuture<'static, Result<Connection<C>>> { Box::pin(factory()) });
        self.factory = Some(factory);
        self
    }

    /// Fails with [`Error::InvalidCapacity`] for a zero capacity and with
    /// [`Error::InvalidFactory`] when no factory was given.
    pub fn build(self) -> Result<ChanPool<C>> {
        if self.capacity == 0 || self.capacity > tokio::sync::Semaphore::MAX_PERMITS {
            return Err(Error::InvalidCapacity);
        }
        let factory = self.factory.ok_or(Error::InvalidFactory)?;

        Ok(ChanPool {
            shared: Arc::new(PoolShared {
                state: RwLock::new(Some(PoolState {
                    idle: Arc::new(IdleBuffer::new(self.capacity)),
                    factory,
                })),
            }),
        })
    }
}

impl<C: Codec> ChanPool<C> {
    pub fn builder() -> PoolBuilder<C> {
        PoolBuilder::default()
    }

    /// Create a pool holding at most `capacity` idle connections.
    pub fn new<F, Fut>(capacity: usize, factory: F) -> Result<Self>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Connection<C>>> + Send + 'static,
    {
        Self::builder().capacity(capacity).factory(factory).build()
    }

    /// Take an idle connection, or build a new one when none is idle.
    pub async fn get(&self) -> Result<Connection<C>> {
        let (idle, factory) = {
            let state = self.shared.state.read().await;
            let state = state.as_ref().ok_or(Error::PoolClosed)?;
            (Arc::clone(&state.idle), Arc::clone(&state.factory))
        };

        if let Some(conn) = idle.take().await {
            return Ok(conn);
        }

        let mut conn = factory().await?;
        conn.attach(Arc::downgrade(&self.shared));
        debug!("Created new pooled connection");
        Ok(conn)
    }

    /// Return a connection. It is closed instead when the pool is closed or
    /// full, or when the connection is unusable.
    pub async fn put(&self, conn: Connection<C>) {
        self.shared.put(conn).await;
    }

    /// Number of idle connections. Advisory under concurrent use.
    pub async fn len(&self) -> usize {
        let state = self.shared.state.read().await;
        state.as_ref().map_or(0, |state| state.idle.len())
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn is_closed(&self) -> bool {
        self.shared.state.read().await.is_none()
    }

    /// Close the pool and every idle connection. Later `get` calls fail with
    /// [`Error::PoolClosed`] and later `put` calls close what they are given.
    pub async fn close(&self) {
        let retired = self.shared.state.write().await.take();
        let Some(state) = retired else {
            return;
        };

        let mut rx = state.idle.rx.lock().await;
        rx.close();

        let mut drained = 0usize;
        while let Ok(conn) = rx.try_recv() {
            discard(conn).await;
            drained += 1;
        }
        debug!(drained = drained, "Connection pool closed");
    }
}

impl<C: Codec> PoolShared<C> {
    pub(crate) async fn put(self: &Arc<Self>, mut conn: Connection<C>) {
        if conn.is_unusable() {
            discard(conn).await;
            return;
        }

        let state = self.state.read().await;
        let Some(state) = state.as_ref() else {
            discard(conn).await;
            return;
        };

        conn.attach(Arc::downgrade(self));
        match state.idle.tx.try_send(conn) {
            Ok(()) => {}
            Err(TrySendError::Full(conn)) | Err(TrySendError::Closed(conn)) => {
                debug!("Pool full, closing connection");
                discard(conn).await;
            }
        }
    }
}

async fn discard<C: Codec>(conn: Connection<C>) {
    if let Err(e) = conn.shutdown().await {
        debug!(error = %e, "Failed to close connection");
    }
}

/// Factory for JSON connections to `addr`, for use with [`ChanPool::new`].
pub fn tcp_factory(
    addr: impl Into<String>,
) -> impl Fn() -> BoxFuture<'static, Result<Connection<JsonCodec<TcpStream>>>> + Send + Sync + 'static
{
    let addr = addr.into();
    move || -> BoxFuture<'static, Result<Connection<JsonCodec<TcpStream>>>> {
        let addr = addr.clone();
        Box::pin(async move { Connection::connect(addr).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, DuplexStream, duplex};
    use tokio::sync::mpsc::UnboundedReceiver;

    type TestCodec = JsonCodec<DuplexStream>;

    /// Pool over in-memory streams. The far end of every stream the factory
    /// builds is sent to the returned receiver.
    fn duplex_pool(capacity: usize) -> (ChanPool<TestCodec>, UnboundedReceiver<DuplexStream>) {
        let (peers_tx, peers_rx) = mpsc::unbounded_channel();
        let pool = ChanPool::new(capacity, move || {
            let peers_tx = peers_tx.clone();
            async move {
                let (a, b) = duplex(1024);
                let _ = peers_tx.send(b);
                Ok(Connection::new(JsonCodec::new(a)))
            }
        })
        .unwrap();
        (pool, peers_rx)
    }

    async fn assert_closed(peer: &mut DuplexStream) {
        let mut buf = [0u8; 8];
        let read = tokio::time::timeout(Duration::from_secs(1), peer.read(&mut buf))
            .await
            .expect("stream was not closed")
            .unwrap();
        assert_eq!(read, 0);
    }

    #[test]
    fn test_invalid_capacity() {
        let result = ChanPool::<TestCodec>::new(0, || async {
            Err::<Connection<TestCodec>, _>(Error::ConnectionClosed)
        });
        assert!(matches!(result, Err(Error::InvalidCapacity)));
    }

    #[test]
    fn test_oversized_capacity() {
        let result = ChanPool::<TestCodec>::new(usize::MAX, || async {
            Err::<Connection<TestCodec>, _>(Error::ConnectionClosed)
        });
        assert!(matches!(result, Err(Error::InvalidCapacity)));
    }

    #[test]
    fn test_missing_factory() {
        let result = ChanPool::<TestCodec>::builder().capacity(4).build();
        assert!(matches!(result, Err(Error::InvalidFactory)));
    }

    #[tokio::test]
    async fn test_get_creates_then_reuses() {
        let (pool, mut peers) = duplex_pool(2);

        let conn = pool.get().await.unwrap();
        assert_eq!(pool.len().await, 0);

        conn.close().await.unwrap();
        assert_eq!(pool.len().await, 1);

        let _conn = pool.get().await.unwrap();
        assert_eq!(pool.len().await, 0);

        // Only one stream was ever built.
        assert!(peers.recv().await.is_some());
        assert!(peers.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_len_never_exceeds_capacity() {
        let (pool, mut peers) = duplex_pool(3);

        let mut checked_out = Vec::new();
        for _ in 0..5 {
            checked_out.push(pool.get().await.unwrap());
        }
        for conn in checked_out {
            conn.close().await.unwrap();
            assert!(pool.len().await <= 3);
        }
        assert_eq!(pool.len().await, 3);

        // The first three went back into the pool, the last two were closed.
        let mut streams = Vec::new();
        while let Ok(peer) = peers.try_recv() {
            streams.push(peer);
        }
        assert_eq!(streams.len(), 5);
        assert_closed(&mut streams[3]).await;
        assert_closed(&mut streams[4]).await;
    }

    #[tokio::test]
    async fn test_checked_out_connection_not_idle() {
        let (pool, _peers) = duplex_pool(2);

        let first = pool.get().await.unwrap();
        first.close().await.unwrap();

        let a = pool.get().await.unwrap();
        let b = pool.get().await.unwrap();
        assert_eq!(pool.len().await, 0);

        a.close().await.unwrap();
        b.close().await.unwrap();
        assert_eq!(pool.len().await, 2);
    }

    #[tokio::test]
    async fn test_unusable_connection_is_closed_not_pooled() {
        let (pool, mut peers) = duplex_pool(2);

        let mut conn = pool.get().await.unwrap();
        let mut peer = peers.recv().await.unwrap();

        conn.mark_unusable();
        conn.close().await.unwrap();

        assert_eq!(pool.len().await, 0);
        assert_closed(&mut peer).await;
    }

    #[tokio::test]
    async fn test_put_rejects_unusable_connection() {
        let (pool, mut peers) = duplex_pool(2);

        let mut conn = pool.get().await.unwrap();
        let mut peer = peers.recv().await.unwrap();

        conn.mark_unusable();
        pool.put(conn).await;

        assert_eq!(pool.len().await, 0);
        assert_closed(&mut peer).await;
    }

    #[tokio::test]
    async fn test_closed_pool_is_terminal() {
        let (pool, mut peers) = duplex_pool(2);

        let idle = pool.get().await.unwrap();
        let mut idle_peer = peers.recv().await.unwrap();
        let held = pool.get().await.unwrap();
        let mut held_peer = peers.recv().await.unwrap();
        idle.close().await.unwrap();
        assert_eq!(pool.len().await, 1);

        pool.close().await;
        assert!(pool.is_closed().await);
        assert_eq!(pool.len().await, 0);
        assert_closed(&mut idle_peer).await;

        assert!(matches!(pool.get().await, Err(Error::PoolClosed)));

        held.close().await.unwrap();
        assert_eq!(pool.len().await, 0);
        assert_closed(&mut held_peer).await;

        // Closing twice is harmless.
        pool.close().await;
    }

    #[tokio::test]
    async fn test_dropped_pool_closes_returned_connection() {
        let (pool, mut peers) = duplex_pool(2);

        let conn = pool.get().await.unwrap();
        let mut peer = peers.recv().await.unwrap();
        drop(pool);

        conn.close().await.unwrap();
        assert_closed(&mut peer).await;
    }

    #[tokio::test]
    async fn test_factory_error_propagates() {
        let pool = ChanPool::<TestCodec>::new(1, || async {
            Err(Error::Protocol("refused".into()))
        })
        .unwrap();

        assert!(matches!(pool.get().await, Err(Error::Protocol(_))));
    }
}
