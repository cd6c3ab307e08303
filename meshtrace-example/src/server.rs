// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

use clap::Parser;
use meshtrace::server::{Server, ServerConfig};
use meshtrace::trace::{self, Config};
use meshtrace::{Context, Status};
use opentelemetry::trace::TraceContextExt;
use service::{init_tracing, register_hello_service, HelloRequest, HelloResponse, HelloService};
use std::net::{IpAddr, Ipv6Addr};
use std::time::Duration;
use tokio::net::TcpListener;

#[derive(Parser)]
struct Flags {
    /// Sets the port number to listen on.
    #[clap(long, default_value_t = 8888)]
    port: u16,
    /// Records these request metadata keys on server spans.
    #[clap(long = "metadata-attribute")]
    metadata_attributes: Vec<String>,
}

#[derive(Clone)]
struct HelloServer;

impl HelloService for HelloServer {
    async fn say_hello(&self, ctx: Context, request: HelloRequest) -> Result<HelloResponse, Status> {
        if request.name.is_empty() {
            return Err(Status::invalid_argument("name is required"));
        }
        tracing::info!(trace_id = %ctx.span().span_context().trace_id(), "greeting {}", request.name);
        tokio::time::sleep(Duration::from_millis(10)).await;
        Ok(HelloResponse {
            reply: format!("Hello, {}!", request.name),
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let flags = Flags::parse();
    let provider = init_tracing("Meshtrace Example Server")?;

    let config = Config::from_provider(&provider).with_metadata_attributes(flags.metadata_attributes);
    let mut server = Server::new(ServerConfig::default().with_unary_interceptor(trace::unary_server_interceptor(config)));
    register_hello_service(&mut server, HelloServer);

    let listener = TcpListener::bind((IpAddr::V6(Ipv6Addr::LOCALHOST), flags.port)).await?;
    tracing::info!("listening on {}", listener.local_addr()?);
    server
        .serve_with_shutdown(listener, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!("cannot listen for ctrl-c, shutting down: {e}");
            }
        })
        .await?;

    opentelemetry::global::shutdown_tracer_provider();
    Ok(())
}
