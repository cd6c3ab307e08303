// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//! [W3C Trace Context](https://www.w3.org/TR/trace-context/) propagation.
//!
//! Encoding and decoding are done by the SDK's propagator. Call metadata is multi-valued, so this
//! wrapper joins repeated `tracestate` values, rejects traceparent fields that are not fixed-width
//! lower-case hex before decoding, and never leaves an empty `tracestate` behind.

use super::{Propagator, TextMapPropagatorAdapter};
use crate::metadata::Metadata;
use opentelemetry::trace::SpanContext;
use opentelemetry_sdk::propagation::TraceContextPropagator as W3cPropagator;
use tracing::debug;

/// Metadata key of the trace parent.
pub const TRACEPARENT_HEADER: &str = "traceparent";
/// Metadata key of the vendor trace state.
pub const TRACESTATE_HEADER: &str = "tracestate";

/// Widths of `version`, `trace-id`, `parent-id` and `trace-flags`.
const FIELD_WIDTHS: [usize; 4] = [2, 32, 16, 2];

/// Propagates span contexts in the W3C Trace Context format.
#[derive(Clone, Debug)]
pub struct TraceContextPropagator {
    inner: TextMapPropagatorAdapter<W3cPropagator>,
}

impl TraceContextPropagator {
    /// Create the propagator.
    pub fn new() -> Self {
        Self {
            inner: TextMapPropagatorAdapter::new(W3cPropagator::new()),
        }
    }
}

impl Default for TraceContextPropagator {
    fn default() -> Self {
        Self::new()
    }
}

impl Propagator for TraceContextPropagator {
    fn inject(&self, span_context: &SpanContext, carrier: &mut Metadata) {
        if !span_context.is_valid() {
            return;
        }
        self.inner.inject(span_context, carrier);
        if carrier.get(TRACESTATE_HEADER).map_or(false, str::is_empty) {
            carrier.remove(TRACESTATE_HEADER);
        }
    }

    fn extract(&self, carrier: &Metadata) -> Option<SpanContext> {
        let traceparent = carrier.get(TRACEPARENT_HEADER)?.trim();
        if !is_well_formed(traceparent) {
            debug!("[MESHTRACE] Ignoring malformed {TRACEPARENT_HEADER}: {traceparent:?}");
            return None;
        }

        let mut normalized = Metadata::new();
        normalized.insert(TRACEPARENT_HEADER, traceparent);
        let members: Vec<&str> = carrier.get_all(TRACESTATE_HEADER).iter().flat_map(|v| v.split(',')).map(str::trim).filter(|m| !m.is_empty()).collect();
        if !members.is_empty() {
            normalized.insert(TRACESTATE_HEADER, members.join(","));
        }

        let span_context = self.inner.extract(&normalized);
        if span_context.is_none() {
            debug!("[MESHTRACE] Ignoring invalid {TRACEPARENT_HEADER}: {traceparent:?}");
        }
        span_context
    }

    fn fields(&self) -> Vec<String> {
        self.inner.fields()
    }
}

/// The first four fields are present with their fixed widths and in lower-case hex.
fn is_well_formed(traceparent: &str) -> bool {
    let mut fields = traceparent.split('-');
    FIELD_WIDTHS
        .iter()
        .all(|&width| fields.next().map_or(false, |field| field.len() == width && field.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))))
}
