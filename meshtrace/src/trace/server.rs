// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

use super::span::{call_attributes, metadata_attributes, span_name, MessageType, SpanGuard};
use super::Config;
use crate::context::Context;
use crate::server::{Method, UnaryServerInfo, UnaryServerInterceptor, Unmarshaler};
use crate::status::Status;
use crate::BoxFuture;
use bytes::Bytes;
use futures::FutureExt;
use opentelemetry::global::BoxedTracer;
use opentelemetry::trace::{FutureExt as _, SpanKind, TraceContextExt, Tracer};
use std::fmt;
use std::sync::Arc;
use tracing::trace;

/// Traces every incoming unary call of a [`Server`](crate::server::Server).
///
/// Each call gets a `Server` span whose parent is the span context the caller propagated in
/// the call's metadata, or a root span if none could be extracted. The span is active in the
/// handler's [`Context::trace`] and is the current OpenTelemetry context while the handler
/// runs, so spans the handler starts (including outgoing calls) join the trace.
pub struct ServerInterceptor<T = BoxedTracer> {
    config: Arc<Config<T>>,
}

impl<T> ServerInterceptor<T> {
    /// Create an interceptor with the given tracing configuration.
    pub fn new(config: impl Into<Arc<Config<T>>>) -> Self {
        Self { config: config.into() }
    }
}

impl Default for ServerInterceptor<BoxedTracer> {
    fn default() -> Self {
        Self::new(Config::global())
    }
}

impl<T> Clone for ServerInterceptor<T> {
    fn clone(&self) -> Self {
        Self { config: self.config.clone() }
    }
}

impl<T> fmt::Debug for ServerInterceptor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerInterceptor").field("config", &self.config).finish()
    }
}

impl<T> UnaryServerInterceptor for ServerInterceptor<T>
where
    T: Tracer + Send + Sync + 'static,
    T::Span: Send + Sync + 'static,
{
    fn intercept(&self, mut ctx: Context, unmarshal: Unmarshaler, info: UnaryServerInfo, method: Method) -> BoxFuture<Result<Bytes, Status>> {
        let config = &self.config;
        if !config.should_trace(&info.service, &info.method) {
            trace!("[MESHTRACE] Not tracing {}", info.full_method());
            return method(ctx, unmarshal);
        }

        // Never inherit an ambient span: the parent is exactly what the caller sent.
        let parent = match config.propagator.extract(&ctx.metadata) {
            Some(remote) => opentelemetry::Context::new().with_remote_span_context(remote),
            None => {
                trace!("[MESHTRACE] No trace context in {} request, starting a root span", info.full_method());
                opentelemetry::Context::new()
            },
        };
        let mut attributes = call_attributes(&config.system, &info.service, &info.method, ctx.deadline);
        attributes.extend(metadata_attributes(&ctx.metadata, &config.metadata_attributes));
        let span = config
            .tracer
            .span_builder(span_name(&info.service, &info.method))
            .with_kind(SpanKind::Server)
            .with_attributes(attributes)
            .start_with_context(&config.tracer, &parent);
        let cx = parent.with_span(span);
        ctx.trace = cx.clone();

        let guard = SpanGuard::new(cx.clone(), config.message_events);
        guard.message(MessageType::Received, 1, unmarshal.len());
        async move {
            let result = method(ctx, unmarshal).with_context(cx).await;
            if let Ok(response) = &result {
                guard.message(MessageType::Sent, 1, response.len());
            }
            guard.finish(&result);
            result
        }
        .boxed()
    }
}
