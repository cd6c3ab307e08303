// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//! Span naming and the attributes and events recorded on call spans.

use crate::metadata::Metadata;
use crate::status::{Code, Status};
use bytes::Bytes;
use opentelemetry::trace::{Status as SpanStatus, TraceContextExt};
use opentelemetry::{Array, KeyValue, StringValue, Value};
use opentelemetry_semantic_conventions::trace::{RPC_METHOD, RPC_SERVICE, RPC_SYSTEM};
use std::time::{Instant, SystemTime};
use tracing::trace;

/// The absolute deadline of the call, RFC 3339 with millisecond precision.
pub const RPC_DEADLINE: &str = "rpc.deadline";
/// The numeric [`Code`] the call finished with.
pub const STATUS_CODE: &str = "rpc.meshrpc.status_code";
/// Prefix of the attributes holding whitelisted request metadata.
pub const REQUEST_METADATA_PREFIX: &str = "rpc.request.metadata.";

/// Name of the events recording a message crossing the connection.
pub const MESSAGE_EVENT: &str = "message";
/// `SENT` or `RECEIVED`.
pub const MESSAGE_TYPE: &str = "message.type";
/// Per-call sequence number of the message, starting at 1.
pub const MESSAGE_ID: &str = "message.id";
/// Size of the marshalled message in bytes.
pub const MESSAGE_UNCOMPRESSED_SIZE: &str = "message.uncompressed_size";

/// Direction of a message event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageType {
    /// The local side wrote the message.
    Sent,
    /// The local side read the message.
    Received,
}

impl MessageType {
    /// The attribute value.
    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::Sent => "SENT",
            MessageType::Received => "RECEIVED",
        }
    }
}

/// The span name of a call: `<service>.<method>`, the same on both sides.
///
/// ```
/// assert_eq!(meshtrace::trace::span::span_name("Greeter", "SayHello"), "Greeter.SayHello");
/// ```
pub fn span_name(service: &str, method: &str) -> String {
    format!("{service}.{method}")
}

/// The attributes describing a call: system, service, method and deadline if any.
pub fn call_attributes(system: &str, service: &str, method: &str, deadline: Option<Instant>) -> Vec<KeyValue> {
    let mut attributes = vec![
        KeyValue::new(RPC_SYSTEM, system.to_string()),
        KeyValue::new(RPC_SERVICE, service.to_string()),
        KeyValue::new(RPC_METHOD, method.to_string()),
    ];
    attributes.extend(deadline.map(deadline_attribute));
    attributes
}

/// The `rpc.deadline` attribute of a monotonic deadline, converted to wall-clock time.
pub fn deadline_attribute(deadline: Instant) -> KeyValue {
    let now = Instant::now();
    let wall = if deadline >= now {
        SystemTime::now() + (deadline - now)
    } else {
        SystemTime::now() - (now - deadline)
    };
    KeyValue::new(RPC_DEADLINE, humantime::format_rfc3339_millis(wall).to_string())
}

/// One `rpc.request.metadata.<key>` attribute per whitelisted key present in `metadata`,
/// holding all of its values.
pub fn metadata_attributes(metadata: &Metadata, keys: &[String]) -> Vec<KeyValue> {
    keys.iter()
        .filter_map(|key| {
            let values = metadata.get_all(key);
            if values.is_empty() {
                return None;
            }
            let values = values.iter().cloned().map(StringValue::from).collect();
            Some(KeyValue::new(format!("{REQUEST_METADATA_PREFIX}{}", key.to_ascii_lowercase()), Value::Array(Array::String(values))))
        })
        .collect()
}

/// Owns the span of one call and ends it exactly once.
///
/// [`finish`](SpanGuard::finish) records the outcome; a guard dropped before that (the call
/// future was cancelled) records [`Code::Cancelled`].
pub(crate) struct SpanGuard {
    cx: Option<opentelemetry::Context>,
    message_events: bool,
}

impl SpanGuard {
    /// Guard the active span of `cx`.
    pub(crate) fn new(cx: opentelemetry::Context, message_events: bool) -> Self {
        Self { cx: Some(cx), message_events }
    }

    /// Record a message event, if enabled.
    pub(crate) fn message(&self, kind: MessageType, id: i64, size: usize) {
        let Some(cx) = self.cx.as_ref().filter(|_| self.message_events) else {
            return;
        };
        cx.span().add_event(
            MESSAGE_EVENT,
            vec![
                KeyValue::new(MESSAGE_TYPE, kind.as_str()),
                KeyValue::new(MESSAGE_ID, id),
                KeyValue::new(MESSAGE_UNCOMPRESSED_SIZE, i64::try_from(size).unwrap_or(i64::MAX)),
            ],
        );
    }

    /// Record `result` and end the span.
    pub(crate) fn finish(mut self, result: &Result<Bytes, Status>) {
        if let Some(cx) = self.cx.take() {
            match result {
                Ok(_) => end(&cx, Code::Ok, SpanStatus::Ok),
                Err(status) => end(&cx, status.code(), SpanStatus::error(status.message().to_string())),
            }
        }
    }
}

impl Drop for SpanGuard {
    fn drop(&mut self) {
        if let Some(cx) = self.cx.take() {
            trace!("[MESHTRACE] Call dropped before completion");
            end(&cx, Code::Cancelled, SpanStatus::error("call cancelled"));
        }
    }
}

fn end(cx: &opentelemetry::Context, code: Code, status: SpanStatus) {
    let span = cx.span();
    span.set_attribute(KeyValue::new(STATUS_CODE, i64::from(code.as_i32())));
    span.set_status(status);
    span.end();
}
