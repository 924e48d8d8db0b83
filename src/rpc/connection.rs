//! Client-side connection: one stream, one codec, one call at a time.

use std::sync::{Arc, Weak};
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::Mutex;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use super::codec::{Codec, JsonCodec};
use super::pool::PoolShared;
use super::protocol::Message;
use crate::error::{Error, Result};

/// A client connection, optionally owned by a [`ChanPool`](super::ChanPool).
///
/// A connection that saw a timeout or a transport error is marked unusable.
/// The flag is sticky: [`close`](Self::close) then tears the stream down
/// instead of handing it back to its pool.
pub struct Connection<C: Codec> {
    codec: Arc<Mutex<C>>,
    unusable: bool,
    /// Pool to return to on close. Never keeps the pool alive.
    pool: Option<Weak<PoolShared<C>>>,
    /// Exchange abandoned by a timed out call, still running.
    abandoned: Option<AbortHandle>,
}

impl Connection<JsonCodec<TcpStream>> {
    /// Dial `addr` and bind a JSON codec to the stream.
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Self::new(JsonCodec::new(stream)))
    }
}

impl<C: Codec> Connection<C> {
    /// Wrap a codec that is already bound to a stream.
    pub fn new(codec: C) -> Self {
        Self {
            codec: Arc::new(Mutex::new(codec)),
            unusable: false,
            pool: None,
            abandoned: None,
        }
    }

    /// Send one request and wait for its response.
    ///
    /// A non-empty `err` in the response becomes [`Error::Remote`]. A send or
    /// receive failure poisons the connection. No retries.
    pub async fn call<Req, Resp>(&mut self, method: &str, request: &Req) -> Result<Resp>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let request = Message::request(method, C::encode_payload(request)?);

        let reply = match exchange(&self.codec, request).await {
            Ok(reply) => reply,
            Err(e) => {
                self.mark_unusable();
                return Err(e);
            }
        };

        decode_reply::<C, Resp>(reply)
    }

    /// Like [`call`](Self::call), but give up after `timeout`.
    ///
    /// The exchange runs on its own task. When the timer fires first the
    /// caller gets [`Error::CallTimeout`] and the connection is marked
    /// unusable, since a late response may still arrive on the stream. The
    /// abandoned exchange keeps running until the poisoned connection is
    /// closed, which aborts it and drops the stream; its result is discarded.
    pub async fn call_with_timeout<Req, Resp>(
        &mut self,
        method: &str,
        request: &Req,
        timeout: Duration,
    ) -> Result<Resp>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let request = Message::request(method, C::encode_payload(request)?);
        let codec = Arc::clone(&self.codec);
        let task = tokio::spawn(async move { exchange(&codec, request).await });
        let abort = task.abort_handle();

        match tokio::time::timeout(timeout, task).await {
            Ok(Ok(Ok(reply))) => decode_reply::<C, Resp>(reply),
            Ok(Ok(Err(e))) => {
                self.mark_unusable();
                Err(e)
            }
            Ok(Err(join_error)) => {
                self.mark_unusable();
                Err(Error::TaskFailed(join_error.to_string()))
            }
            Err(_) => {
                warn!(method = %method, timeout_ms = timeout.as_millis() as u64, "Call timed out");
                self.mark_unusable();
                self.abandoned = Some(abort);
                Err(Error::CallTimeout)
            }
        }
    }

    /// Release the connection.
    ///
    /// Goes back to the owning pool when there is one and the connection is
    /// healthy; otherwise the stream is closed.
    pub async fn close(self) -> Result<()> {
        let pool = match (&self.pool, self.unusable) {
            (Some(pool), false) => pool.upgrade(),
            _ => None,
        };

        match pool {
            Some(pool) => {
                pool.put(self).await;
                Ok(())
            }
            None => self.shutdown().await,
        }
    }

    /// Poison the connection. Irreversible.
    pub fn mark_unusable(&mut self) {
        self.unusable = true;
    }

    pub fn is_unusable(&self) -> bool {
        self.unusable
    }

    pub(crate) fn attach(&mut self, pool: Weak<PoolShared<C>>) {
        self.pool = Some(pool);
    }

    /// Close the stream outright.
    pub(crate) async fn shutdown(mut self) -> Result<()> {
        if let Some(abandoned) = self.abandoned.take() {
            abandoned.abort();
        }

        // Still locked means an abandoned exchange owns the codec; the stream
        // is dropped together with that task.
        let result = match self.codec.try_lock() {
            Ok(mut codec) => codec.shutdown().await,
            Err(_) => {
                debug!("Stream busy with an abandoned call, dropping it");
                Ok(())
            }
        };
        result
    }
}

async fn exchange<C: Codec>(codec: &Mutex<C>, request: Message) -> Result<Message> {
    let mut codec = codec.lock().await;
    codec.send(&request).await?;
    codec.recv().await
}

fn decode_reply<C: Codec, Resp: DeserializeOwned>(reply: Message) -> Result<Resp> {
    let content = reply.into_result()?;
    C::parse_raw(content.as_ref())
}
