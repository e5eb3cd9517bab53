// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Router and handler adapters.
//!
//! [`RouterLayer`] opens the request transaction and stores it in the request extensions,
//! where every later stage finds it. [`handler_factory`] names the transaction after the
//! endpoint that served it.

use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};

use tower::util::BoxCloneService;
use tower::{Layer, Service};
use tracing::trace;

use crate::agent::{Agent, InboundRequest, Transaction};
use crate::context;
use crate::pipeline::{EndpointConfig, Handler, HandlerFactory, HttpBody, Proxy};

/// Opens one transaction per sampled inbound request.
#[derive(Clone, Debug, Default)]
pub struct RouterLayer {
    agent: Option<Arc<Agent>>,
}

impl RouterLayer {
    /// Without an agent, or with an instrumentation rate of zero, the layer adds nothing.
    pub fn new(agent: Option<&Arc<Agent>>) -> Self {
        let agent = agent.filter(|agent| !agent.sampler().is_disabled()).cloned();
        Self { agent }
    }

    pub fn is_active(&self) -> bool {
        self.agent.is_some()
    }
}

impl<S> Layer<S> for RouterLayer {
    type Service = RouterService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RouterService {
            inner,
            agent: self.agent.clone(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct RouterService<S> {
    inner: S,
    agent: Option<Arc<Agent>>,
}

/// Ends the transaction when the request future completes or is dropped.
struct TransactionGuard(Transaction);

impl Drop for TransactionGuard {
    fn drop(&mut self) {
        self.0.end();
    }
}

impl<S, ReqBody, ResBody> Service<http::Request<ReqBody>> for RouterService<S>
where
    S: Service<http::Request<ReqBody>, Response = http::Response<ResBody>>
        + Clone
        + Send
        + 'static,
    S::Future: Send + 'static,
    ReqBody: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut TaskContext<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: http::Request<ReqBody>) -> Self::Future {
        // the ready service is the one that must be called
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        let agent = match &self.agent {
            Some(agent) if agent.sampler().sample() => agent,
            _ => return Box::pin(inner.call(req)),
        };

        let name = format!("{} {}", req.method(), req.uri().path());
        let txn = agent.start_transaction(&name, InboundRequest::from_request(&req));
        trace!(transaction = %name, "transaction started");

        context::attach_to(&mut req, txn.clone());
        let guard = TransactionGuard(txn);
        let response = inner.call(req);
        Box::pin(async move {
            let result = response.await;
            if let Ok(response) = &result {
                guard.0.set_response_status(response.status());
            }
            drop(guard);
            result
        })
    }
}

/// Names each request's transaction after the endpoint that handled it.
pub fn handler_factory(agent: Option<&Arc<Agent>>, next: HandlerFactory) -> HandlerFactory {
    if agent.is_none() {
        return next;
    }

    Arc::new(move |cfg: &EndpointConfig, proxy: Proxy| -> Handler {
        BoxCloneService::new(EndpointNaming {
            inner: next(cfg, proxy),
            endpoint: Arc::from(cfg.endpoint.as_str()),
        })
    })
}

#[derive(Clone)]
struct EndpointNaming {
    inner: Handler,
    endpoint: Arc<str>,
}

impl Service<http::Request<HttpBody>> for EndpointNaming {
    type Response = http::Response<HttpBody>;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut TaskContext<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: http::Request<HttpBody>) -> Self::Future {
        let txn = context::retrieve(&req);
        let response = self.inner.call(req);
        let endpoint = self.endpoint.clone();
        Box::pin(async move {
            let result = response.await;
            if let Some(txn) = txn {
                txn.set_name(&endpoint);
            }
            result
        })
    }
}
