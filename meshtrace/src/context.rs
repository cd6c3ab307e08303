// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//! The per-call execution context.

use crate::metadata::Metadata;
use opentelemetry::trace::{SpanRef, TraceContextExt};
use std::time::{Duration, Instant};
use tracing_opentelemetry::OpenTelemetrySpanExt;

/// The execution context of one unary call.
///
/// A context is created by the caller for every call (or by the server for every incoming
/// request) and is discarded when the call completes. Nothing in it is shared with other
/// in-flight calls.
#[derive(Clone, Debug, Default)]
pub struct Context {
    /// When the call must be finished, if bounded.
    pub deadline: Option<Instant>,
    /// The call's out-of-band metadata.
    pub metadata: Metadata,
    /// The OpenTelemetry context whose active span is the parent of spans started for this call.
    pub trace: opentelemetry::Context,
}

impl Context {
    /// An empty context: no deadline, no metadata, no parent span.
    pub fn background() -> Self {
        Self::default()
    }

    /// A context whose parent span is the thread's current OpenTelemetry context.
    pub fn current() -> Self {
        Self {
            trace: opentelemetry::Context::current(),
            ..Default::default()
        }
    }

    /// A context whose parent span is the OpenTelemetry span backing a [`tracing::Span`].
    ///
    /// Requires a `tracing-opentelemetry` layer to be installed; otherwise the parent is empty.
    pub fn from_span(span: &tracing::Span) -> Self {
        Self {
            trace: span.context(),
            ..Default::default()
        }
    }

    /// Set the deadline.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Set the deadline to `timeout` from now. A timeout too large to represent means no deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Instant::now().checked_add(timeout);
        self
    }

    /// Set the metadata.
    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Set the OpenTelemetry parent context.
    pub fn with_trace(mut self, trace: opentelemetry::Context) -> Self {
        self.trace = trace;
        self
    }

    /// Time left before the deadline; zero once it has passed.
    pub fn timeout(&self) -> Option<Duration> {
        self.deadline.map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// The active span of this call.
    pub fn span(&self) -> SpanRef<'_> {
        self.trace.span()
    }
}

#[cfg(test)]
mod tests {
    use super::Context;
    use std::time::{Duration, Instant};

    #[test]
    fn timeouts_set_the_deadline() {
        let before = Instant::now();
        let ctx = Context::background().with_timeout(Duration::from_secs(1));
        let deadline = ctx.deadline.unwrap();
        assert!(deadline >= before + Duration::from_secs(1));
        assert!(ctx.timeout().unwrap() <= Duration::from_secs(1));
    }

    #[test]
    fn unrepresentable_timeouts_mean_no_deadline() {
        let ctx = Context::background().with_deadline(Instant::now()).with_timeout(Duration::MAX);
        assert_eq!(ctx.deadline, None);
        assert_eq!(ctx.timeout(), None);
    }
}
