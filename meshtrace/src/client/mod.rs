// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//!
//! Provides a client that connects to a server and sends multiplexed unary requests.

use crate::context::Context;
use crate::status::Status;
use crate::transport::{self, codec, Request, RequestFrame, ResponseFrame};
use crate::BoxFuture;
use bytes::Bytes;
use dashmap::DashMap;
use faststr::FastStr;
use futures::{FutureExt, Sink, SinkExt, Stream, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, oneshot};
use tracing::{trace, warn};

/// Describes the unary call an interceptor is wrapping.
#[derive(Clone, Debug)]
pub struct UnaryClientInfo {
    /// Fully qualified service name.
    pub service: FastStr,
    /// Method name.
    pub method: FastStr,
    /// Size of the marshalled request in bytes.
    pub request_size: usize,
}

impl UnaryClientInfo {
    /// `/<service>/<method>`.
    pub fn full_method(&self) -> String {
        format!("/{}/{}", self.service, self.method)
    }
}

/// Performs the wrapped call. An interceptor invokes it at most once.
pub struct ClientInvoker(Box<dyn FnOnce(Context) -> BoxFuture<Result<Bytes, Status>> + Send>);

impl ClientInvoker {
    /// Wrap a function sending the call described by the given context.
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: FnOnce(Context) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Bytes, Status>> + Send + 'static,
    {
        Self(Box::new(move |ctx| f(ctx).boxed()))
    }

    /// Send the call.
    pub fn invoke(self, ctx: Context) -> BoxFuture<Result<Bytes, Status>> {
        (self.0)(ctx)
    }
}

impl fmt::Debug for ClientInvoker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientInvoker").finish_non_exhaustive()
    }
}

/// A hook invoked around every unary call a [`Client`] makes.
///
/// The interceptor may modify the context (e.g. its metadata) before handing it to the
/// invoker, and observes the outcome. Closures of the same shape implement this trait.
pub trait UnaryClientInterceptor: Send + Sync + 'static {
    /// Wrap one call.
    fn intercept(&self, ctx: Context, info: UnaryClientInfo, invoker: ClientInvoker) -> BoxFuture<Result<Bytes, Status>>;
}

impl<F> UnaryClientInterceptor for F
where
    F: Fn(Context, UnaryClientInfo, ClientInvoker) -> BoxFuture<Result<Bytes, Status>> + Send + Sync + 'static,
{
    fn intercept(&self, ctx: Context, info: UnaryClientInfo, invoker: ClientInvoker) -> BoxFuture<Result<Bytes, Status>> {
        self(ctx, info, invoker)
    }
}

/// Settings that control the behavior of the client.
#[derive(Clone)]
#[non_exhaustive]
pub struct ClientConfig {
    /// The hook wrapping every unary call.
    pub(crate) interceptor: Option<Arc<dyn UnaryClientInterceptor>>,
    /// Maximum frame length, default is [`DEFAULT_MAX_FRAME_LEN`](transport::DEFAULT_MAX_FRAME_LEN).
    pub(crate) max_frame_len: usize,
    /// The number of requests that can be buffered client-side before being written.
    /// Default is 100.
    pub(crate) pending_request_buffer: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            interceptor: None,
            max_frame_len: transport::DEFAULT_MAX_FRAME_LEN,
            pending_request_buffer: 100,
        }
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("interceptor", &self.interceptor.is_some())
            .field("max_frame_len", &self.max_frame_len)
            .field("pending_request_buffer", &self.pending_request_buffer)
            .finish()
    }
}

impl ClientConfig {
    /// Install the hook wrapping every unary call.
    pub fn with_unary_interceptor(mut self, interceptor: impl UnaryClientInterceptor) -> Self {
        self.interceptor = Some(Arc::new(interceptor));
        self
    }
    /// Set maximum frame length; zero means the default.
    pub fn with_max_frame_len(mut self, max_frame_len: usize) -> Self {
        self.max_frame_len = if max_frame_len == 0 { transport::DEFAULT_MAX_FRAME_LEN } else { max_frame_len };
        self
    }
    /// Set the number of requests that can be buffered client-side before being written;
    /// zero means 100.
    pub fn with_pending_request_buffer(mut self, pending_request_buffer: usize) -> Self {
        self.pending_request_buffer = if pending_request_buffer == 0 { 100 } else { pending_request_buffer };
        self
    }
}

type Pending = DashMap<u32, oneshot::Sender<Result<Bytes, Status>>>;

/// A connection to a meshrpc server.
///
/// Calls are multiplexed over the connection by stream id, so concurrent calls never wait for
/// each other. Cloning is cheap and clones share the connection.
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

struct Inner {
    requests: mpsc::Sender<RequestFrame>,
    pending: Arc<Pending>,
    next_stream_id: AtomicU32,
    interceptor: Option<Arc<dyn UnaryClientInterceptor>>,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client").field("in_flight", &self.inner.pending.len()).finish_non_exhaustive()
    }
}

impl Client {
    /// Create a client over an established connection.
    ///
    /// Spawns the connection's reader and writer tasks, so it must be called within a tokio
    /// runtime.
    pub fn new<T>(io: T, config: ClientConfig) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (sink, stream) = transport::new_transport::<T, ResponseFrame, RequestFrame>(io, config.max_frame_len).split();
        let (requests, rx) = mpsc::channel(config.pending_request_buffer);
        let pending: Arc<Pending> = Default::default();
        tokio::spawn(write_requests(sink, rx, pending.clone()));
        tokio::spawn(read_responses(stream, pending.clone()));
        Self {
            inner: Arc::new(Inner {
                requests,
                pending,
                next_stream_id: AtomicU32::new(1),
                interceptor: config.interceptor,
            }),
        }
    }

    /// Connect to a server over TCP.
    pub async fn connect(addr: impl ToSocketAddrs, config: ClientConfig) -> io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Self::new(stream, config))
    }

    /// Connect to a server over a unix domain socket.
    #[cfg(unix)]
    pub async fn connect_unix(path: impl AsRef<std::path::Path>, config: ClientConfig) -> io::Result<Self> {
        let stream = tokio::net::UnixStream::connect(path).await?;
        Ok(Self::new(stream, config))
    }

    /// Marshal `request`, call `service`/`method` and unmarshal the response.
    pub async fn call<Req, Resp>(&self, ctx: Context, service: &str, method: &str, request: &Req) -> Result<Resp, Status>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let payload = codec::marshal(request)?;
        let response = self.call_raw(ctx, service, method, payload).await?;
        codec::unmarshal(&response)
    }

    /// Call `service`/`method` with an already marshalled payload.
    ///
    /// The configured interceptor, if any, wraps the call.
    pub async fn call_raw(&self, ctx: Context, service: &str, method: &str, payload: Bytes) -> Result<Bytes, Status> {
        let info = UnaryClientInfo {
            service: FastStr::new(service),
            method: FastStr::new(method),
            request_size: payload.len(),
        };
        let invoker = self.invoker(info.service.clone(), info.method.clone(), payload);
        match &self.inner.interceptor {
            Some(interceptor) => interceptor.intercept(ctx, info, invoker).await,
            None => invoker.invoke(ctx).await,
        }
    }

    fn invoker(&self, service: FastStr, method: FastStr, payload: Bytes) -> ClientInvoker {
        let inner = self.inner.clone();
        ClientInvoker::new(move |ctx| async move { inner.dispatch(ctx, service, method, payload).await })
    }
}

impl Inner {
    async fn dispatch(&self, ctx: Context, service: FastStr, method: FastStr, payload: Bytes) -> Result<Bytes, Status> {
        let timeout_nano = match ctx.deadline {
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Err(Status::deadline_exceeded("deadline exceeded before the request was sent"));
                }
                u64::try_from(remaining.as_nanos()).unwrap_or(u64::MAX)
            },
            None => 0,
        };
        let stream_id = self.next_stream_id.fetch_add(2, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(stream_id, tx);
        // Unregisters the call however it ends, including when the caller drops it.
        let _registered = Registered {
            pending: &self.pending,
            stream_id,
        };

        let frame = RequestFrame {
            stream_id,
            request: Request {
                service: service.to_string(),
                method: method.to_string(),
                timeout_nano,
                metadata: ctx.metadata,
                payload,
            },
        };
        let timed_out = || Status::deadline_exceeded(format!("/{service}/{method} timed out"));
        let sent = match ctx.deadline {
            Some(deadline) => tokio::time::timeout_at(deadline.into(), self.requests.send(frame)).await.map_err(|_| timed_out())?,
            None => self.requests.send(frame).await,
        };
        if sent.is_err() {
            return Err(Status::unavailable("connection closed"));
        }

        let response = match ctx.deadline {
            Some(deadline) => tokio::time::timeout_at(deadline.into(), rx).await.map_err(|_| timed_out())?,
            None => rx.await,
        };
        response.unwrap_or_else(|_| Err(Status::unavailable("connection closed")))
    }
}

/// Removes a call's entry from the pending table when dropped.
struct Registered<'a> {
    pending: &'a Pending,
    stream_id: u32,
}

impl Drop for Registered<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.stream_id);
    }
}

async fn write_requests<S>(mut sink: S, mut requests: mpsc::Receiver<RequestFrame>, pending: Arc<Pending>)
where
    S: Sink<RequestFrame, Error = io::Error> + Unpin,
{
    while let Some(frame) = requests.recv().await {
        let stream_id = frame.stream_id;
        if let Err(e) = sink.send(frame).await {
            warn!("[MESHTRACE] Writing request {stream_id} failed: {e}");
            pending.clear();
            return;
        }
    }
    // Every client handle is gone; half-close so the server can finish the connection.
    if let Err(e) = sink.close().await {
        trace!("[MESHTRACE] Closing connection failed: {e}");
    }
}

async fn read_responses<S>(mut stream: S, pending: Arc<Pending>)
where
    S: Stream<Item = io::Result<ResponseFrame>> + Unpin,
{
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(ResponseFrame { stream_id, response }) => match pending.remove(&stream_id) {
                Some((_, tx)) => {
                    // The caller may have given up on the call already.
                    let _ = tx.send(response);
                },
                None => trace!("[MESHTRACE] Dropping response for unknown stream {stream_id}"),
            },
            Err(e) => {
                warn!("[MESHTRACE] Reading response failed: {e}");
                break;
            },
        }
    }
    // Fails every call still waiting on this connection.
    pending.clear();
}
