// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//!
//! meshtrace is OpenTelemetry tracing instrumentation for meshrpc unary calls.
//!
//! A client and a server exchanging unary calls take part in the same distributed trace:
//! the [client interceptor](trace::ClientInterceptor) starts a span for each outgoing call and
//! writes its trace context into the call's [`Metadata`]; the
//! [server interceptor](trace::ServerInterceptor) reads it back and starts a child span around
//! the handler.
//!
//! ```no_run
//! # async fn run() -> std::io::Result<()> {
//! use meshtrace::client::{Client, ClientConfig};
//! use meshtrace::server::{Server, ServerConfig};
//! use meshtrace::trace::{self, Config};
//!
//! let server = Server::new(ServerConfig::default().with_unary_interceptor(trace::unary_server_interceptor(Config::global())));
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:8888").await?;
//! tokio::spawn(server.serve(listener));
//!
//! let client = Client::connect("127.0.0.1:8888", ClientConfig::default().with_unary_interceptor(trace::unary_client_interceptor(Config::global()))).await?;
//! # Ok(())
//! # }
//! ```
#![deny(missing_docs)]
#![allow(clippy::type_complexity)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod client;
pub mod context;
pub mod metadata;
pub mod server;
pub mod status;
pub mod trace;
pub mod transport;

pub use context::Context;
pub use metadata::Metadata;
pub use status::{Code, Status};
pub use transport::codec;

/// A boxed future returned by the interceptor hooks.
pub type BoxFuture<T> = futures::future::BoxFuture<'static, T>;
