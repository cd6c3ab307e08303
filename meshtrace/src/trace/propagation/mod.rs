// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//! Trace context propagation through call metadata.
//!
//! Propagation is best-effort: a carrier without (valid) trace context yields `None` and the
//! server starts a root span. A propagator never fails a call.

mod trace_context;

pub use trace_context::{TraceContextPropagator, TRACEPARENT_HEADER, TRACESTATE_HEADER};

use crate::metadata::Metadata;
use opentelemetry::global;
use opentelemetry::propagation::TextMapPropagator;
use opentelemetry::trace::{SpanContext, TraceContextExt};
use std::fmt;

/// Encodes a span context into call metadata and decodes it back.
pub trait Propagator: Send + Sync + fmt::Debug {
    /// Write `span_context` into `carrier`. Keys not owned by this format are left untouched;
    /// invalid span contexts are not injected.
    fn inject(&self, span_context: &SpanContext, carrier: &mut Metadata);

    /// Read a remote span context from `carrier`. Missing or malformed keys yield `None`.
    fn extract(&self, carrier: &Metadata) -> Option<SpanContext>;

    /// The metadata keys this format reads and writes.
    fn fields(&self) -> Vec<String>;
}

/// Tries several formats in a fixed priority order.
///
/// Injection writes every format; extraction returns the first context found.
#[derive(Debug, Default)]
pub struct CompositePropagator {
    propagators: Vec<Box<dyn Propagator>>,
}

impl CompositePropagator {
    /// Create a composite from formats in priority order.
    pub fn new(propagators: Vec<Box<dyn Propagator>>) -> Self {
        Self { propagators }
    }

    /// Append a format with the lowest priority.
    pub fn with(mut self, propagator: impl Propagator + 'static) -> Self {
        self.propagators.push(Box::new(propagator));
        self
    }
}

impl Propagator for CompositePropagator {
    fn inject(&self, span_context: &SpanContext, carrier: &mut Metadata) {
        for propagator in &self.propagators {
            propagator.inject(span_context, carrier);
        }
    }

    fn extract(&self, carrier: &Metadata) -> Option<SpanContext> {
        self.propagators.iter().find_map(|propagator| propagator.extract(carrier))
    }

    fn fields(&self) -> Vec<String> {
        let mut fields: Vec<String> = Vec::new();
        for field in self.propagators.iter().flat_map(|p| p.fields()) {
            if !fields.contains(&field) {
                fields.push(field);
            }
        }
        fields
    }
}

/// Uses any OpenTelemetry [`TextMapPropagator`] as a [`Propagator`].
#[derive(Clone, Debug, Default)]
pub struct TextMapPropagatorAdapter<P> {
    inner: P,
}

impl<P> TextMapPropagatorAdapter<P> {
    /// Wrap `inner`.
    pub fn new(inner: P) -> Self {
        Self { inner }
    }
}

impl<P> Propagator for TextMapPropagatorAdapter<P>
where
    P: TextMapPropagator + Send + Sync,
{
    fn inject(&self, span_context: &SpanContext, carrier: &mut Metadata) {
        if !span_context.is_valid() {
            return;
        }
        let cx = opentelemetry::Context::new().with_remote_span_context(span_context.clone());
        self.inner.inject_context(&cx, carrier);
    }

    fn extract(&self, carrier: &Metadata) -> Option<SpanContext> {
        remote_span_context(&self.inner.extract(carrier))
    }

    fn fields(&self) -> Vec<String> {
        self.inner.fields().map(str::to_owned).collect()
    }
}

/// Delegates to the process-wide propagator installed with
/// [`opentelemetry::global::set_text_map_propagator`], looked up on every call.
///
/// Until one is installed the global propagator is a no-op, so nothing is injected or extracted.
#[derive(Clone, Copy, Debug, Default)]
pub struct GlobalPropagator;

impl Propagator for GlobalPropagator {
    fn inject(&self, span_context: &SpanContext, carrier: &mut Metadata) {
        if !span_context.is_valid() {
            return;
        }
        let cx = opentelemetry::Context::new().with_remote_span_context(span_context.clone());
        global::get_text_map_propagator(|propagator| propagator.inject_context(&cx, carrier));
    }

    fn extract(&self, carrier: &Metadata) -> Option<SpanContext> {
        global::get_text_map_propagator(|propagator| remote_span_context(&propagator.extract(carrier)))
    }

    fn fields(&self) -> Vec<String> {
        global::get_text_map_propagator(|propagator| propagator.fields().map(str::to_owned).collect())
    }
}

fn remote_span_context(cx: &opentelemetry::Context) -> Option<SpanContext> {
    let span = cx.span();
    let span_context = span.span_context();
    span_context.is_valid().then(|| span_context.clone())
}

#[cfg(test)]
mod tests {
    use super::{CompositePropagator, Propagator, TextMapPropagatorAdapter, TraceContextPropagator};
    use crate::metadata::Metadata;
    use opentelemetry::trace::{SpanContext, SpanId, TraceFlags, TraceId, TraceState};
    use opentelemetry_sdk::propagation::TraceContextPropagator as SdkTraceContextPropagator;

    fn span_context(trace_id: u128, span_id: u64, state: &[(&str, &str)]) -> SpanContext {
        let trace_state = if state.is_empty() { TraceState::default() } else { TraceState::from_key_value(state.iter().copied()).unwrap() };
        SpanContext::new(
            TraceId::from_bytes(trace_id.to_be_bytes()),
            SpanId::from_bytes(span_id.to_be_bytes()),
            TraceFlags::SAMPLED,
            true,
            trace_state,
        )
    }

    /// Reads a fixed header holding `<trace-id>:<span-id>`.
    #[derive(Debug)]
    struct ColonPropagator;

    impl Propagator for ColonPropagator {
        fn inject(&self, span_context: &SpanContext, carrier: &mut Metadata) {
            carrier.insert("x-colon-trace", format!("{}:{}", span_context.trace_id(), span_context.span_id()));
        }

        fn extract(&self, carrier: &Metadata) -> Option<SpanContext> {
            let (trace_id, span_id) = carrier.get("x-colon-trace")?.split_once(':')?;
            Some(SpanContext::new(
                TraceId::from_hex(trace_id).ok()?,
                SpanId::from_hex(span_id).ok()?,
                TraceFlags::SAMPLED,
                true,
                TraceState::default(),
            ))
        }

        fn fields(&self) -> Vec<String> {
            vec!["x-colon-trace".to_string()]
        }
    }

    #[test]
    fn sdk_propagator_reads_injected_context() {
        let expected = span_context(0x4bf92f3577b34da6a3ce929d0e0e4736, 0x00f067aa0ba902b7, &[("vendor", "opaque")]);
        let mut carrier = Metadata::new();
        TraceContextPropagator::new().inject(&expected, &mut carrier);

        let sdk = TextMapPropagatorAdapter::new(SdkTraceContextPropagator::new());
        assert_eq!(sdk.extract(&carrier), Some(expected));
    }

    #[test]
    fn extracts_context_injected_by_sdk_propagator() {
        let expected = span_context(7, 9, &[("a", "1"), ("b", "2")]);
        let mut carrier = Metadata::new();
        TextMapPropagatorAdapter::new(SdkTraceContextPropagator::new()).inject(&expected, &mut carrier);

        assert_eq!(carrier.get("traceparent"), Some("00-00000000000000000000000000000007-0000000000000009-01"));
        assert_eq!(TraceContextPropagator::new().extract(&carrier), Some(expected));
    }

    #[test]
    fn composite_prefers_earlier_formats() {
        let colon = span_context(1, 1, &[]);
        let w3c = span_context(2, 2, &[]);
        let mut carrier = Metadata::new();
        ColonPropagator.inject(&colon, &mut carrier);
        TraceContextPropagator::new().inject(&w3c, &mut carrier);

        let composite = CompositePropagator::default().with(ColonPropagator).with(TraceContextPropagator::new());
        assert_eq!(composite.extract(&carrier), Some(colon.clone()));

        let composite = CompositePropagator::default().with(TraceContextPropagator::new()).with(ColonPropagator);
        assert_eq!(composite.extract(&carrier), Some(w3c));

        carrier.remove("traceparent");
        assert_eq!(composite.extract(&carrier), Some(colon));
        assert_eq!(composite.fields(), vec!["traceparent", "tracestate", "x-colon-trace"]);
    }

    #[test]
    fn composite_injects_every_format() {
        let composite = CompositePropagator::new(vec![Box::new(TraceContextPropagator::new()), Box::new(ColonPropagator)]);
        let mut carrier = Metadata::new();
        composite.inject(&span_context(3, 4, &[]), &mut carrier);
        assert!(carrier.contains_key("traceparent"));
        assert!(carrier.contains_key("x-colon-trace"));
        assert!(!carrier.contains_key("tracestate"));
    }
}
