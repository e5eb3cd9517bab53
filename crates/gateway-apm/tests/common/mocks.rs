// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Mock APM client and pipeline stages

use std::convert::Infallible;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use gateway_apm::agent::{
    Apm, ApmConnector, InboundRequest, SegmentHandle, Transaction, TransactionHandle,
};
use gateway_apm::config::InstrumentationConfig;
use gateway_apm::pipeline::{
    Backend, BackendFactory, EndpointConfig, Handler, HandlerFactory, HttpBody, Proxy,
    ProxyFactory, ProxyFuture, Request, Response,
};
use gateway_apm::{BoxError, Context};
use http::{Method, StatusCode, Uri};
use tower::util::BoxCloneService;
use tower::service_fn;

/// Everything the mock APM client was asked to do, in order
#[derive(Debug, Clone, Default)]
pub struct Calls(Arc<Mutex<Vec<String>>>);

impl Calls {
    pub fn push(&self, call: impl Into<String>) {
        self.0.lock().unwrap().push(call.into());
    }

    pub fn all(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn count(&self, call: &str) -> usize {
        self.0.lock().unwrap().iter().filter(|c| *c == call).count()
    }
}

#[derive(Debug, Clone, Default)]
pub struct MockApm {
    pub calls: Calls,
}

impl MockApm {
    pub fn connector(&self) -> ApmConnector {
        let apm = self.clone();
        Arc::new(move |_config: &InstrumentationConfig| Ok(Arc::new(apm.clone()) as Arc<dyn Apm>))
    }
}

impl Apm for MockApm {
    fn start_transaction(&self, name: &str, _request: InboundRequest<'_>) -> Transaction {
        self.calls.push(format!("start {name}"));
        Transaction::new(MockTransaction {
            calls: self.calls.clone(),
        })
    }
}

#[derive(Debug)]
struct MockTransaction {
    calls: Calls,
}

impl TransactionHandle for MockTransaction {
    fn set_name(&self, name: &str) {
        self.calls.push(format!("name {name}"));
    }

    fn start_segment(&self, name: &str) -> Box<dyn SegmentHandle> {
        self.calls.push(format!("segment start {name}"));
        Box::new(MockSegment {
            calls: self.calls.clone(),
            name: name.to_string(),
        })
    }

    fn start_external_segment(&self, method: &Method, uri: &Uri) -> Box<dyn SegmentHandle> {
        let name = format!("{method} {uri}");
        self.calls.push(format!("external start {name}"));
        Box::new(MockSegment {
            calls: self.calls.clone(),
            name: format!("external {name}"),
        })
    }

    fn set_response_status(&self, status: StatusCode) {
        self.calls.push(format!("status {}", status.as_u16()));
    }

    fn end(&self) {
        self.calls.push("end");
    }
}

struct MockSegment {
    calls: Calls,
    name: String,
}

impl SegmentHandle for MockSegment {
    fn end(self: Box<Self>) {
        self.calls.push(format!("segment end {}", self.name));
    }
}

#[derive(Debug, thiserror::Error)]
#[error("backend unavailable")]
pub struct BackendUnavailable;

/// Backend factory whose proxies fail with [`BackendUnavailable`]
pub fn failing_backends() -> BackendFactory {
    Arc::new(|_backend: &Backend| -> Proxy {
        Arc::new(|_ctx: Context, _req: Request| -> ProxyFuture {
            Box::pin(async { Err(Box::new(BackendUnavailable) as BoxError) })
        })
    })
}

/// Backend factory whose proxies answer `{"ok": true}`
pub fn responding_backends() -> BackendFactory {
    Arc::new(|_backend: &Backend| -> Proxy {
        Arc::new(|_ctx: Context, _req: Request| -> ProxyFuture {
            let mut response = Response {
                is_complete: true,
                ..Default::default()
            };
            response.data.insert("ok".into(), true.into());
            response.metadata.status_code = 200;
            Box::pin(async move { Ok(response) })
        })
    })
}

/// Proxy factory calling the first backend of the endpoint
pub fn first_backend(backends: BackendFactory) -> Arc<dyn ProxyFactory> {
    Arc::new(move |cfg: &EndpointConfig| -> Result<Proxy, BoxError> {
        let backend = cfg.backends.first().ok_or("endpoint without backends")?;
        Ok(backends(backend))
    })
}

/// Handler factory that runs the proxy and reports transaction visibility in a header
pub fn handlers(seen: Calls) -> HandlerFactory {
    Arc::new(move |_cfg: &EndpointConfig, proxy: Proxy| -> Handler {
        let seen = seen.clone();
        BoxCloneService::new(service_fn(move |req: http::Request<HttpBody>| {
            let proxy = proxy.clone();
            let seen = seen.clone();
            async move {
                let ctx = Context::from_request(&req);
                if gateway_apm::context::retrieve(&ctx).is_some() {
                    seen.push("handler saw transaction");
                }
                let request = Request {
                    method: req.method().clone(),
                    path: req.uri().path().to_string(),
                    ..Default::default()
                };
                let response = match proxy(ctx, request).await {
                    Ok(response) => http::Response::builder()
                        .status(response.metadata.status_code)
                        .body(HttpBody::new(Bytes::from(
                            serde_json::to_vec(&response.data).unwrap(),
                        )))
                        .unwrap(),
                    Err(err) => http::Response::builder()
                        .status(StatusCode::INTERNAL_SERVER_ERROR)
                        .body(HttpBody::new(Bytes::from(err.to_string())))
                        .unwrap(),
                };
                Ok::<_, Infallible>(response)
            }
        }))
    })
}
