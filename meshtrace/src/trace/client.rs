// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

use super::span::{call_attributes, span_name, MessageType, SpanGuard};
use super::Config;
use crate::client::{ClientInvoker, UnaryClientInfo, UnaryClientInterceptor};
use crate::context::Context;
use crate::status::Status;
use crate::BoxFuture;
use bytes::Bytes;
use futures::FutureExt;
use opentelemetry::global::BoxedTracer;
use opentelemetry::trace::{SpanKind, TraceContextExt, Tracer};
use std::fmt;
use std::sync::Arc;
use tracing::trace;

/// Traces every outgoing unary call of a [`Client`](crate::client::Client).
///
/// Each call gets a `Client` span, a child of the span active in the call's
/// [`Context::trace`] (or a root span if there is none). The span's context is written into
/// the call's metadata, so the server can continue the trace, and the span becomes the active
/// span of the context handed down to the transport.
pub struct ClientInterceptor<T = BoxedTracer> {
    config: Arc<Config<T>>,
}

impl<T> ClientInterceptor<T> {
    /// Create an interceptor with the given tracing configuration.
    pub fn new(config: impl Into<Arc<Config<T>>>) -> Self {
        Self { config: config.into() }
    }
}

impl Default for ClientInterceptor<BoxedTracer> {
    fn default() -> Self {
        Self::new(Config::global())
    }
}

impl<T> Clone for ClientInterceptor<T> {
    fn clone(&self) -> Self {
        Self { config: self.config.clone() }
    }
}

impl<T> fmt::Debug for ClientInterceptor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientInterceptor").field("config", &self.config).finish()
    }
}

impl<T> UnaryClientInterceptor for ClientInterceptor<T>
where
    T: Tracer + Send + Sync + 'static,
    T::Span: Send + Sync + 'static,
{
    fn intercept(&self, mut ctx: Context, info: UnaryClientInfo, invoker: ClientInvoker) -> BoxFuture<Result<Bytes, Status>> {
        let config = &self.config;
        if !config.should_trace(&info.service, &info.method) {
            trace!("[MESHTRACE] Not tracing {}", info.full_method());
            return invoker.invoke(ctx);
        }

        let span = config
            .tracer
            .span_builder(span_name(&info.service, &info.method))
            .with_kind(SpanKind::Client)
            .with_attributes(call_attributes(&config.system, &info.service, &info.method, ctx.deadline))
            .start_with_context(&config.tracer, &ctx.trace);
        let cx = ctx.trace.with_span(span);
        config.propagator.inject(cx.span().span_context(), &mut ctx.metadata);
        ctx.trace = cx.clone();

        let guard = SpanGuard::new(cx, config.message_events);
        guard.message(MessageType::Sent, 1, info.request_size);
        async move {
            let result = invoker.invoke(ctx).await;
            if let Ok(response) = &result {
                guard.message(MessageType::Received, 1, response.len());
            }
            guard.finish(&result);
            result
        }
        .boxed()
    }
}
