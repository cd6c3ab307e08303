// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//! Server component.

use crate::context::Context;
use crate::status::Status;
use crate::transport::{self, codec, Request, RequestFrame, ResponseFrame};
use crate::BoxFuture;
use bytes::Bytes;
use faststr::FastStr;
use futures::{FutureExt, SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Decodes the request payload of one call. Handlers call it exactly once.
#[derive(Clone, Debug)]
pub struct Unmarshaler {
    payload: Bytes,
}

impl Unmarshaler {
    /// Wrap a raw request payload.
    pub fn new(payload: Bytes) -> Self {
        Self { payload }
    }
    /// Decode the request message.
    pub fn unmarshal<T: DeserializeOwned>(&self) -> Result<T, Status> {
        codec::unmarshal(&self.payload)
    }
    /// The raw payload.
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }
    /// Size of the raw payload in bytes.
    pub fn len(&self) -> usize {
        self.payload.len()
    }
    /// Whether the raw payload is empty.
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// A registered unary method: decodes its request through the [`Unmarshaler`], runs the
/// business logic and returns the marshalled response.
pub type Method = Arc<dyn Fn(Context, Unmarshaler) -> BoxFuture<Result<Bytes, Status>> + Send + Sync>;

/// Build a [`Method`] from an async function.
pub fn method<F, Fut>(f: F) -> Method
where
    F: Fn(Context, Unmarshaler) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Bytes, Status>> + Send + 'static,
{
    Arc::new(move |ctx, unmarshal| f(ctx, unmarshal).boxed())
}

/// Describes the unary call an interceptor is wrapping.
#[derive(Clone, Debug)]
pub struct UnaryServerInfo {
    /// Fully qualified service name.
    pub service: FastStr,
    /// Method name.
    pub method: FastStr,
}

impl UnaryServerInfo {
    /// `/<service>/<method>`.
    pub fn full_method(&self) -> String {
        format!("/{}/{}", self.service, self.method)
    }
}

/// A hook invoked around every unary method the [`Server`] runs.
///
/// The method includes request decoding, so the interceptor also observes unmarshal failures.
/// Closures of the same shape implement this trait.
pub trait UnaryServerInterceptor: Send + Sync + 'static {
    /// Wrap one method invocation.
    fn intercept(&self, ctx: Context, unmarshal: Unmarshaler, info: UnaryServerInfo, method: Method) -> BoxFuture<Result<Bytes, Status>>;
}

impl<F> UnaryServerInterceptor for F
where
    F: Fn(Context, Unmarshaler, UnaryServerInfo, Method) -> BoxFuture<Result<Bytes, Status>> + Send + Sync + 'static,
{
    fn intercept(&self, ctx: Context, unmarshal: Unmarshaler, info: UnaryServerInfo, method: Method) -> BoxFuture<Result<Bytes, Status>> {
        self(ctx, unmarshal, info, method)
    }
}

/// Server config.
#[derive(Clone)]
#[non_exhaustive]
pub struct ServerConfig {
    /// The hook wrapping every unary method.
    pub(crate) interceptor: Option<Arc<dyn UnaryServerInterceptor>>,
    /// Maximum frame length, default is [`DEFAULT_MAX_FRAME_LEN`](transport::DEFAULT_MAX_FRAME_LEN).
    pub(crate) max_frame_len: usize,
    /// Controls the buffer size of the in-process channel over which a connection's handlers
    /// send responses to its writer. In other words, this is the number of responses that can
    /// sit in the outbound queue before request handlers begin blocking.
    /// Default is 100.
    pub(crate) pending_response_buffer: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            interceptor: None,
            max_frame_len: transport::DEFAULT_MAX_FRAME_LEN,
            pending_response_buffer: 100,
        }
    }
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("interceptor", &self.interceptor.is_some())
            .field("max_frame_len", &self.max_frame_len)
            .field("pending_response_buffer", &self.pending_response_buffer)
            .finish()
    }
}

impl ServerConfig {
    /// Install the hook wrapping every unary method.
    pub fn with_unary_interceptor(mut self, interceptor: impl UnaryServerInterceptor) -> Self {
        self.interceptor = Some(Arc::new(interceptor));
        self
    }
    /// Set maximum frame length; zero means the default.
    pub fn with_max_frame_len(mut self, max_frame_len: usize) -> Self {
        self.max_frame_len = if max_frame_len == 0 { transport::DEFAULT_MAX_FRAME_LEN } else { max_frame_len };
        self
    }
    /// Set the number of responses that can sit in a connection's outbound queue before
    /// request handlers begin blocking; zero means 100.
    pub fn with_pending_response_buffer(mut self, pending_response_buffer: usize) -> Self {
        self.pending_response_buffer = if pending_response_buffer == 0 { 100 } else { pending_response_buffer };
        self
    }
}

/// A source of incoming connections.
pub trait Listener: Send + 'static {
    /// The connection type.
    type Io: AsyncRead + AsyncWrite + Send + Unpin + 'static;
    /// Accept the next connection.
    fn accept(&mut self) -> impl Future<Output = io::Result<Self::Io>> + Send;
}

impl Listener for TcpListener {
    type Io = TcpStream;

    async fn accept(&mut self) -> io::Result<TcpStream> {
        let (stream, _) = TcpListener::accept(self).await?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

#[cfg(unix)]
impl Listener for tokio::net::UnixListener {
    type Io = tokio::net::UnixStream;

    async fn accept(&mut self) -> io::Result<tokio::net::UnixStream> {
        let (stream, _) = tokio::net::UnixListener::accept(self).await?;
        Ok(stream)
    }
}

#[derive(Clone)]
struct Shared {
    services: HashMap<String, HashMap<String, Method>>,
    config: ServerConfig,
}

/// A meshrpc server: a registry of named services and the connections serving them.
#[derive(Clone)]
pub struct Server {
    shared: Arc<Shared>,
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("services", &self.shared.services.keys().collect::<Vec<_>>())
            .field("config", &self.shared.config)
            .finish()
    }
}

impl Server {
    /// Create a server without services.
    pub fn new(config: ServerConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                services: HashMap::new(),
                config,
            }),
        }
    }

    /// Register `service` with its methods, replacing any previous registration of that name.
    pub fn register<I, K>(&mut self, service: impl Into<String>, methods: I)
    where
        I: IntoIterator<Item = (K, Method)>,
        K: Into<String>,
    {
        let methods = methods.into_iter().map(|(name, method)| (name.into(), method)).collect();
        Arc::make_mut(&mut self.shared).services.insert(service.into(), methods);
    }

    /// Accept connections until the listener fails.
    pub async fn serve<L: Listener>(self, mut listener: L) -> io::Result<()> {
        loop {
            match listener.accept().await {
                Ok(io) => {
                    self.serve_connection(io);
                },
                Err(e) if is_transient(&e) => {
                    debug!("[MESHTRACE] Ignoring accept error: {e}");
                },
                Err(e) => {
                    warn!("[MESHTRACE] Accepting connections failed: {e}");
                    return Err(e);
                },
            }
        }
    }

    /// Accept connections until `signal` completes or the listener fails.
    pub async fn serve_with_shutdown<L, F>(self, listener: L, signal: F) -> io::Result<()>
    where
        L: Listener,
        F: Future<Output = ()>,
    {
        tokio::select! {
            res = self.serve(listener) => res,
            _ = signal => {
                info!("[MESHTRACE] Server shutting down");
                Ok(())
            },
        }
    }

    /// Serve a single established connection in the background.
    pub fn serve_connection<T>(&self, io: T) -> JoinHandle<()>
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        tokio::spawn(handle_connection(self.shared.clone(), io))
    }
}

fn is_transient(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::ConnectionAborted | io::ErrorKind::ConnectionReset | io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock)
}

async fn handle_connection<T>(shared: Arc<Shared>, io: T)
where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (mut sink, mut stream) = transport::new_transport::<T, RequestFrame, ResponseFrame>(io, shared.config.max_frame_len).split();
    let (responses, mut rx) = mpsc::channel::<ResponseFrame>(shared.config.pending_response_buffer);
    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let Err(e) = sink.send(frame).await {
                warn!("[MESHTRACE] Writing response failed: {e}");
                return;
            }
        }
        if let Err(e) = sink.close().await {
            trace!("[MESHTRACE] Closing connection failed: {e}");
        }
    });

    while let Some(frame) = stream.next().await {
        let RequestFrame { stream_id, request } = match frame {
            Ok(frame) => frame,
            Err(e) => {
                debug!("[MESHTRACE] Reading request failed: {e}");
                break;
            },
        };
        let shared = shared.clone();
        let responses = responses.clone();
        tokio::spawn(async move {
            let response = shared.dispatch(request).await;
            if responses.send(ResponseFrame { stream_id, response }).await.is_err() {
                trace!("[MESHTRACE] Connection closed before stream {stream_id} was answered");
            }
        });
    }
    // The writer finishes once every in-flight call has answered.
    drop(responses);
    if let Err(e) = writer.await {
        warn!("[MESHTRACE] Response writer failed: {e}");
    }
}

impl Shared {
    fn resolve(&self, service: &str, method: &str) -> Result<&Method, Status> {
        self.services
            .get(service)
            .ok_or_else(|| Status::unimplemented(format!("service {service}")))?
            .get(method)
            .ok_or_else(|| Status::unimplemented(format!("method {method}")))
    }

    async fn dispatch(&self, request: Request) -> Result<Bytes, Status> {
        let Request {
            service,
            method,
            timeout_nano,
            metadata,
            payload,
        } = request;
        let handler = self.resolve(&service, &method)?.clone();
        let deadline = (timeout_nano > 0).then(|| Instant::now() + Duration::from_nanos(timeout_nano));
        let ctx = Context {
            deadline,
            metadata,
            trace: opentelemetry::Context::new(),
        };
        let unmarshal = Unmarshaler::new(payload);
        let call = match &self.config.interceptor {
            Some(interceptor) => interceptor.intercept(
                ctx,
                unmarshal,
                UnaryServerInfo {
                    service: FastStr::from(service),
                    method: FastStr::from(method),
                },
                handler,
            ),
            None => handler(ctx, unmarshal),
        };
        match deadline {
            // Dropping the call on expiry cancels the handler.
            Some(deadline) => tokio::time::timeout_at(deadline.into(), call)
                .await
                .unwrap_or_else(|_| Err(Status::deadline_exceeded("server deadline exceeded"))),
            None => call.await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{method, Server, ServerConfig, Unmarshaler};
    use crate::client::{Client, ClientConfig};
    use crate::context::Context;
    use crate::status::Status;
    use crate::transport::codec;
    use bytes::Bytes;
    use std::time::Duration;

    async fn echo(_: Context, unmarshal: Unmarshaler) -> Result<Bytes, Status> {
        let name: String = unmarshal.unmarshal()?;
        codec::marshal(&name)
    }

    fn echo_server() -> Server {
        let mut server = Server::new(ServerConfig::default());
        server.register("Echo", [("Say", method(echo))]);
        server
    }

    #[tokio::test]
    async fn connection_ends_when_the_peer_goes_away() -> anyhow::Result<()> {
        let (client_io, server_io) = tokio::io::duplex(1024);
        let connection = echo_server().serve_connection(server_io);
        drop(client_io);
        tokio::time::timeout(Duration::from_secs(1), connection).await??;
        Ok(())
    }

    #[tokio::test]
    async fn connection_ends_after_the_client_closes() -> anyhow::Result<()> {
        let (client_io, server_io) = tokio::io::duplex(1024);
        let connection = echo_server().serve_connection(server_io);
        let client = Client::new(client_io, ClientConfig::default());
        let reply: String = client.call(Context::background(), "Echo", "Say", &"hi".to_string()).await?;
        assert_eq!(reply, "hi");

        // The client half-closes once its last handle is gone; the server flushes and closes.
        drop(client);
        tokio::time::timeout(Duration::from_secs(1), connection).await??;
        Ok(())
    }
}
