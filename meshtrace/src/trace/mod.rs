// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//! Provides the interceptors tracing distributed unary calls.
//!
//! A trace is logically a tree of causally-related spans. The client side starts a span for
//! every outgoing call and [injects](Propagator::inject) its context into the call's
//! [`Metadata`](crate::Metadata); the server side [extracts](Propagator::extract) it and starts
//! the handler's span as a child, so events occurring on either side of the connection end up
//! in the same trace.
//!
//! The interceptors are configured with an explicit [`Config`]: the tracer to start spans with,
//! the propagation format, and which call details become span attributes.

mod client;
mod config;
pub mod propagation;
mod server;
pub mod span;

pub use client::ClientInterceptor;
pub use config::Config;
pub use propagation::{CompositePropagator, GlobalPropagator, Propagator, TextMapPropagatorAdapter, TraceContextPropagator};
pub use server::ServerInterceptor;

use std::sync::Arc;

/// The instrumentation scope name of tracers created by this crate.
pub const INSTRUMENTATION_NAME: &str = "meshtrace";

/// Returns the client-side hook tracing every outgoing unary call.
pub fn unary_client_interceptor<T>(config: impl Into<Arc<Config<T>>>) -> ClientInterceptor<T> {
    ClientInterceptor::new(config)
}

/// Returns the server-side hook tracing every incoming unary call.
pub fn unary_server_interceptor<T>(config: impl Into<Arc<Config<T>>>) -> ServerInterceptor<T> {
    ServerInterceptor::new(config)
}
