//! The default config follows the process-wide propagator. Kept in its own test binary because
//! it installs global state.

use bytes::Bytes;
use meshtrace::client::{Client, ClientConfig};
use meshtrace::server::{self, Server, ServerConfig, Unmarshaler};
use meshtrace::trace::{self, Config, Propagator};
use meshtrace::{codec, Context, Metadata, Status};
use opentelemetry::propagation::TextMapCompositePropagator;
use opentelemetry::trace::{SpanContext, SpanId, SpanKind, TraceFlags, TraceId, TraceState};
use opentelemetry_sdk::propagation::{BaggagePropagator, TraceContextPropagator};
use opentelemetry_sdk::testing::trace::InMemorySpanExporter;
use opentelemetry_sdk::trace::TracerProvider;
use std::time::Duration;

async fn echo_metadata(ctx: Context, _: Unmarshaler) -> Result<Bytes, Status> {
    codec::marshal(&ctx.metadata)
}

#[tokio::test]
async fn default_config_uses_the_global_propagator() -> anyhow::Result<()> {
    let exporter = InMemorySpanExporter::default();
    let provider = TracerProvider::builder().with_simple_exporter(exporter.clone()).build();
    opentelemetry::global::set_tracer_provider(provider);

    // Nothing installed yet: the global no-op propagator writes nothing.
    let span_context = SpanContext::new(TraceId::from_bytes(7u128.to_be_bytes()), SpanId::from_bytes(9u64.to_be_bytes()), TraceFlags::SAMPLED, true, TraceState::default());
    let mut carrier = Metadata::new();
    Config::default().propagator().inject(&span_context, &mut carrier);
    assert!(carrier.is_empty());

    opentelemetry::global::set_text_map_propagator(TextMapCompositePropagator::new(vec![
        Box::new(TraceContextPropagator::new()),
        Box::new(BaggagePropagator::new()),
    ]));

    let config = Config::default();
    let mut fields = config.propagator().fields();
    fields.sort();
    assert_eq!(fields, vec!["baggage", "traceparent", "tracestate"]);
    config.propagator().inject(&span_context, &mut carrier);
    assert_eq!(carrier.get("traceparent"), Some("00-00000000000000000000000000000007-0000000000000009-01"));
    let extracted = config.propagator().extract(&carrier).unwrap();
    assert_eq!(extracted.trace_id(), span_context.trace_id());
    assert_eq!(extracted.span_id(), span_context.span_id());
    assert!(extracted.is_remote());

    // Both sides on the process defaults join one trace.
    let mut server = Server::new(ServerConfig::default().with_unary_interceptor(trace::unary_server_interceptor(Config::global())));
    server.register("Echo", [("Metadata", server::method(echo_metadata))]);
    let (client_io, server_io) = tokio::io::duplex(4096);
    server.serve_connection(server_io);
    let client = Client::new(client_io, ClientConfig::default().with_unary_interceptor(trace::unary_client_interceptor(Config::global())));

    let seen: Metadata = client.call(Context::background(), "Echo", "Metadata", &()).await?;
    assert!(seen.contains_key("traceparent"));

    let mut spans = exporter.get_finished_spans()?;
    for _ in 0..200 {
        if spans.len() >= 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        spans = exporter.get_finished_spans()?;
    }
    let client_span = spans.iter().find(|span| span.span_kind == SpanKind::Client).unwrap();
    let server_span = spans.iter().find(|span| span.span_kind == SpanKind::Server).unwrap();
    assert_eq!(server_span.parent_span_id, client_span.span_context.span_id());
    Ok(())
}
