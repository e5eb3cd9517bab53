// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

mod config;
mod upstream;

use std::convert::Infallible;
use std::fmt::Display;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use gateway_apm::pipeline::{Backend, EndpointConfig, Handler, HttpBody, HttpClientFactory};
use gateway_apm::router::{self, RouterLayer, RouterService};
use gateway_apm::{backend, http_client, proxy, Agent, Registrar};
use http::{Method, StatusCode};
use http_body_util::BodyExt;
use hyper::body::{Body, Incoming};
use tower::{ServiceBuilder, ServiceExt};
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use crate::config::DemoConfig;

const ENDPOINT_TIMEOUT: Duration = Duration::from_secs(3);

#[tokio::main]
pub async fn main() {
    let config = DemoConfig::from_env();
    let log_level = config
        .as_ref()
        .map(|config| config.log_level.clone())
        .unwrap_or_else(|_| "info".to_string());

    let env_filter = format!("h2=off,hyper=off,hyper_util=off,{}", log_level);

    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).expect("could not parse log level in configuration"),
        )
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .without_time()
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    debug!("Logging subsystem enabled");

    let config = match config {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {e:#}");
            return;
        }
    };

    if let Err(e) = run(config).await {
        error!("Gateway stopped: {e:#}");
    }
}

async fn run(config: DemoConfig) -> anyhow::Result<()> {
    let extra = config.load_extra_config()?;
    let registrar = Registrar::default();
    let agent = registrar.register(&extra);
    match &agent {
        Some(agent) => info!(
            app = %agent.config().app_name,
            rate = agent.config().instrumentation_rate,
            "APM instrumentation enabled"
        ),
        None => info!("APM instrumentation disabled"),
    }

    let endpoint = EndpointConfig {
        endpoint: config.endpoint.clone(),
        method: Method::GET,
        timeout: ENDPOINT_TIMEOUT,
        backends: vec![Backend {
            hosts: vec![config.upstream.clone()],
            ..Default::default()
        }],
    };
    let handler = build_handler(
        agent.as_ref(),
        &endpoint,
        &config.upstream,
        upstream::client_factory(),
    )?;
    let service = ServiceBuilder::new()
        .layer(RouterLayer::new(agent.as_ref()))
        .service(handler);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Serving {} on {addr}", endpoint.endpoint);

    serve(listener, Arc::from(endpoint.endpoint.as_str()), service).await
}

/// Composes the instrumented pipeline for `endpoint`.
fn build_handler(
    agent: Option<&Arc<Agent>>,
    endpoint: &EndpointConfig,
    upstream: &str,
    clients: HttpClientFactory,
) -> anyhow::Result<Handler> {
    let clients = http_client::http_client_factory(clients);
    let backends = backend::backend_factory(
        agent,
        "backend-0",
        upstream::backends(upstream.to_string(), clients),
    );
    let proxies = proxy::proxy_factory(agent, "proxy", upstream::proxy_factory(backends));
    let proxy = proxies.new_proxy(endpoint).map_err(|e| anyhow!(e))?;

    Ok(router::handler_factory(agent, upstream::handlers())(
        endpoint, proxy,
    ))
}

async fn serve(
    listener: tokio::net::TcpListener,
    route: Arc<str>,
    service: RouterService<Handler>,
) -> anyhow::Result<()> {
    let server = hyper::server::conn::http1::Builder::new();
    let mut joinset = tokio::task::JoinSet::new();

    loop {
        let conn = tokio::select! {
            con_res = listener.accept() => match con_res {
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::ConnectionAborted
                            | io::ErrorKind::ConnectionReset
                            | io::ErrorKind::ConnectionRefused
                    ) =>
                {
                    continue;
                }
                Err(e) => {
                    error!("Server error: {e}");
                    return Err(e.into());
                }
                Ok((conn, _)) => conn,
            },
            finished = async {
                match joinset.join_next().await {
                    Some(finished) => finished,
                    None => std::future::pending().await,
                }
            } => match finished {
                Err(e) if e.is_panic() => {
                    error!("Connection handler panicked: {:?}", e);
                    continue;
                },
                Ok(()) | Err(_) => continue,
            },
        };

        let conn = hyper_util::rt::TokioIo::new(conn);
        let server = server.clone();
        let route = route.clone();
        let service = service.clone();
        let connection_service = hyper::service::service_fn(move |req: http::Request<Incoming>| {
            dispatch(route.clone(), service.clone(), req)
        });
        joinset.spawn(async move {
            if let Err(e) = server.serve_connection(conn, connection_service).await {
                error!("Connection error: {e}");
            }
        });
    }
}

/// Routes `req` to the endpoint, answering 404 off route and 400 on an unreadable body.
async fn dispatch<B>(
    route: Arc<str>,
    service: RouterService<Handler>,
    req: http::Request<B>,
) -> Result<http::Response<HttpBody>, Infallible>
where
    B: Body,
    B::Error: Display,
{
    if upstream::match_route(&route, req.uri().path()).is_none() {
        return Ok(upstream::plain(
            StatusCode::NOT_FOUND,
            format!("no endpoint at {}", req.uri().path()),
        ));
    }

    let (parts, body) = req.into_parts();
    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            debug!("unable to read request body: {e}");
            return Ok(upstream::plain(
                StatusCode::BAD_REQUEST,
                format!("unable to read request body: {e}"),
            ));
        }
    };
    let req = http::Request::from_parts(parts, HttpBody::new(body));

    service.oneshot(req).await
}
