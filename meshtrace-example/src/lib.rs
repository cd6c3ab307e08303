// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

use meshtrace::client::Client;
use meshtrace::server::{self, Server};
use meshtrace::{codec, Context, Status};
use opentelemetry::trace::TracerProvider as _;
use opentelemetry::KeyValue;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::TracerProvider;
use opentelemetry_sdk::Resource;
use opentelemetry_semantic_conventions::resource::SERVICE_NAME;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tracing_subscriber::{fmt::format::FmtSpan, prelude::*};

/// The registered name of the hello service.
pub const HELLO_SERVICE: &str = "api.HelloService";

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HelloRequest {
    pub name: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HelloResponse {
    pub reply: String,
}

/// The hello service.
pub trait HelloService: Send + Sync + 'static {
    /// Greets the requester.
    fn say_hello(&self, ctx: Context, request: HelloRequest) -> impl Future<Output = Result<HelloResponse, Status>> + Send;
}

/// Registers `service` on `server` under [`HELLO_SERVICE`].
pub fn register_hello_service<S: HelloService>(server: &mut Server, service: S) {
    let service = Arc::new(service);
    server.register(
        HELLO_SERVICE,
        [(
            "SayHello",
            server::method(move |ctx, unmarshal| {
                let service = service.clone();
                async move {
                    let request: HelloRequest = unmarshal.unmarshal()?;
                    let response = service.say_hello(ctx, request).await?;
                    codec::marshal(&response)
                }
            }),
        )],
    );
}

/// A typed client of the hello service.
#[derive(Clone, Debug)]
pub struct HelloServiceClient {
    client: Client,
}

impl HelloServiceClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub async fn say_hello(&self, ctx: Context, request: &HelloRequest) -> Result<HelloResponse, Status> {
        self.client.call(ctx, HELLO_SERVICE, "SayHello", request).await
    }
}

/// Initializes an OpenTelemetry tracing subscriber with a OTLP backend.
///
/// Installs the provider and the W3C propagator globally so `meshtrace::trace::Config::global()`
/// picks them up.
pub fn init_tracing(service_name: &'static str) -> anyhow::Result<TracerProvider> {
    let tracer_provider = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_batch_config(opentelemetry_sdk::trace::BatchConfig::default())
        .with_exporter(opentelemetry_otlp::new_exporter().tonic())
        .with_trace_config(opentelemetry_sdk::trace::Config::default().with_resource(Resource::new([KeyValue::new(SERVICE_NAME, service_name)])))
        .install_batch(opentelemetry_sdk::runtime::Tokio)?;
    opentelemetry::global::set_tracer_provider(tracer_provider.clone());
    opentelemetry::global::set_text_map_propagator(TraceContextPropagator::new());
    let tracer = tracer_provider.tracer(service_name);

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer().with_span_events(FmtSpan::NEW | FmtSpan::CLOSE))
        .with(tracing_opentelemetry::layer().with_tracer(tracer))
        .try_init()?;

    Ok(tracer_provider)
}
