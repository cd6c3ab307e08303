// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

use clap::Parser;
use meshtrace::client::{Client, ClientConfig};
use meshtrace::trace::{self, Config};
use meshtrace::{Context, Metadata};
use service::{init_tracing, HelloRequest, HelloServiceClient};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::time::sleep;
use tracing::Instrument;

#[derive(Parser)]
struct Flags {
    /// Sets the server address to connect to.
    #[clap(long, default_value = "[::1]:8888")]
    server_addr: SocketAddr,
    /// Sets the name to say hello to.
    #[clap(long, default_value = "p.s.m")]
    name: String,
    /// Sets the call timeout.
    #[clap(long, default_value = "5s", value_parser = humantime::parse_duration)]
    timeout: Duration,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let flags = Flags::parse();
    init_tracing("Meshtrace Example Client")?;

    let config = ClientConfig::default().with_unary_interceptor(trace::unary_client_interceptor(Config::global()));
    let client = HelloServiceClient::new(Client::connect(flags.server_addr, config).await?);

    let span = tracing::info_span!("Two Hellos");
    let metadata: Metadata = [("client", "meshtrace-example")].into_iter().collect();
    let ctx = Context::from_span(&span).with_metadata(metadata).with_timeout(flags.timeout);
    let hello = async move {
        // Send the request twice, just to be safe! ;)
        let req1 = HelloRequest { name: format!("{}1", flags.name) };
        let req2 = HelloRequest { name: format!("{}2", flags.name) };
        tokio::select! {
            hello1 = client.say_hello(ctx.clone(), &req1) => { hello1 }
            hello2 = client.say_hello(ctx, &req2) => { hello2 }
        }
    }
    .instrument(span)
    .await;

    match hello {
        Ok(hello) => tracing::info!("{hello:?}"),
        Err(e) => tracing::warn!("{:?}", anyhow::Error::from(e)),
    }

    // Let the background span processor finish.
    sleep(Duration::from_micros(10)).await;
    opentelemetry::global::shutdown_tracer_provider();

    Ok(())
}
