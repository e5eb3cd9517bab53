// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Extension points of the host gateway.
//!
//! These are the shapes the gateway composes its pipeline from. Every adapter in this crate
//! takes one of them and returns a replacement of exactly the same shape.

use std::collections::HashMap;
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, Method};
use serde_json::{Map, Value};
use tower::util::BoxCloneService;

use crate::context::Context;
use crate::error::{ApmError, BoxError, CompositionError};

pub type HttpBody = http_body_util::Full<Bytes>;

#[derive(Debug, Clone, Default)]
pub struct EndpointConfig {
    /// Route the endpoint is exposed on, e.g. `/users/{id}`.
    pub endpoint: String,
    pub method: Method,
    pub timeout: Duration,
    pub backends: Vec<Backend>,
}

#[derive(Debug, Clone, Default)]
pub struct Backend {
    pub url_pattern: String,
    pub hosts: Vec<String>,
    pub method: Method,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Request {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub params: HashMap<String, String>,
    pub headers: HeaderMap,
    pub body: Bytes,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Response {
    pub data: Map<String, Value>,
    pub is_complete: bool,
    pub metadata: Metadata,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Metadata {
    pub status_code: u16,
    pub headers: HeaderMap,
}

pub type ProxyFuture = Pin<Box<dyn Future<Output = Result<Response, BoxError>> + Send>>;

/// One stage of the proxy pipeline.
pub type Proxy = Arc<dyn Fn(Context, Request) -> ProxyFuture + Send + Sync>;

/// Composes a proxy over its successors.
pub type Middleware = Arc<dyn Fn(Vec<Proxy>) -> Result<Proxy, ApmError> + Send + Sync>;

pub type BackendFactory = Arc<dyn Fn(&Backend) -> Proxy + Send + Sync>;

pub type HttpClient =
    BoxCloneService<http::Request<HttpBody>, http::Response<HttpBody>, BoxError>;

pub type HttpClientFactory = Arc<dyn Fn(&Context) -> HttpClient + Send + Sync>;

pub type Handler = BoxCloneService<http::Request<HttpBody>, http::Response<HttpBody>, Infallible>;

pub type HandlerFactory = Arc<dyn Fn(&EndpointConfig, Proxy) -> Handler + Send + Sync>;

pub trait ProxyFactory: Send + Sync {
    fn new_proxy(&self, cfg: &EndpointConfig) -> Result<Proxy, BoxError>;
}

impl<F> ProxyFactory for F
where
    F: Fn(&EndpointConfig) -> Result<Proxy, BoxError> + Send + Sync,
{
    fn new_proxy(&self, cfg: &EndpointConfig) -> Result<Proxy, BoxError> {
        self(cfg)
    }
}

/// A proxy that answers every request with an empty response.
pub fn noop_proxy() -> Proxy {
    Arc::new(|_ctx: Context, _req: Request| -> ProxyFuture {
        Box::pin(async { Ok(Response::default()) })
    })
}

/// A middleware that hands back its only successor untouched.
pub fn empty_middleware() -> Middleware {
    Arc::new(|next: Vec<Proxy>| -> Result<Proxy, ApmError> { Ok(single_successor(next)?) })
}

/// The one proxy a single-successor middleware wraps.
pub fn single_successor(next: Vec<Proxy>) -> Result<Proxy, CompositionError> {
    let mut next = next.into_iter();
    match (next.next(), next.next()) {
        (None, _) => Err(CompositionError::NotEnoughProxies),
        (Some(proxy), None) => Ok(proxy),
        (Some(_), Some(_)) => Err(CompositionError::TooManyProxies),
    }
}
