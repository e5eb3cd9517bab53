// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The uninstrumented gateway stages: an HTTP client, a backend forwarding to the
//! upstream, a proxy over the endpoint's first backend and the handler serving it.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;

use bytes::Bytes;
use gateway_apm::pipeline::{
    Backend, BackendFactory, EndpointConfig, Handler, HandlerFactory, HttpBody, HttpClient,
    HttpClientFactory, Metadata, Proxy, ProxyFactory, ProxyFuture, Request, Response,
};
use gateway_apm::{BoxError, Context};
use http::StatusCode;
use http_body_util::BodyExt;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use serde_json::{Map, Value};
use tower::util::BoxCloneService;
use tower::{service_fn, ServiceExt};
use tracing::{debug, warn};

/// Plain HTTP/1 client shared by every request.
pub fn client_factory() -> HttpClientFactory {
    let client = Client::builder(TokioExecutor::new()).build_http::<HttpBody>();
    Arc::new(move |_ctx: &Context| -> HttpClient {
        let client = client.clone();
        BoxCloneService::new(service_fn(move |req: http::Request<HttpBody>| {
            let client = client.clone();
            async move {
                let response = client.request(req).await?;
                let (parts, body) = response.into_parts();
                let body = body.collect().await?.to_bytes();
                Ok::<_, BoxError>(http::Response::from_parts(parts, HttpBody::new(body)))
            }
        }))
    })
}

/// Backends forwarding to their first host, or to `upstream` when they have none.
///
/// The inbound method is kept. The path is the backend's url pattern with `{param}`
/// placeholders filled from the request, or the request path when there is no pattern.
pub fn backends(upstream: String, clients: HttpClientFactory) -> BackendFactory {
    Arc::new(move |backend: &Backend| -> Proxy {
        let host = backend
            .hosts
            .first()
            .cloned()
            .unwrap_or_else(|| upstream.clone());
        let url_pattern = backend.url_pattern.clone();
        let clients = clients.clone();

        Arc::new(move |ctx: Context, req: Request| -> ProxyFuture {
            let path = if url_pattern.is_empty() {
                req.path.clone()
            } else {
                expand(&url_pattern, &req.params)
            };
            let uri = match &req.query {
                Some(query) => format!("{host}{path}?{query}"),
                None => format!("{host}{path}"),
            };
            let client = clients(&ctx);
            let method = req.method.clone();
            Box::pin(async move { forward(client, method, uri, req).await })
        })
    })
}

async fn forward(
    client: HttpClient,
    method: http::Method,
    uri: String,
    mut req: Request,
) -> Result<Response, BoxError> {
    req.headers.remove(http::header::HOST);
    let mut builder = http::Request::builder().method(method).uri(&uri);
    if let Some(headers) = builder.headers_mut() {
        headers.extend(req.headers);
    }
    let outbound = builder.body(HttpBody::new(req.body))?;

    debug!("forwarding to {uri}");
    let response = client.oneshot(outbound).await?;
    let status = response.status();
    let (parts, body) = response.into_parts();
    let body = body.collect().await?.to_bytes();

    Ok(Response {
        data: decode(&body),
        is_complete: status.is_success(),
        metadata: Metadata {
            status_code: status.as_u16(),
            headers: parts.headers,
        },
    })
}

fn placeholder(segment: &str) -> Option<&str> {
    segment.strip_prefix('{')?.strip_suffix('}')
}

/// Matches `path` against an endpoint pattern such as `/users/{id}`, returning the
/// captured parameters.
pub fn match_route(pattern: &str, path: &str) -> Option<HashMap<String, String>> {
    let mut params = HashMap::new();
    let mut path_segments = path.split('/');
    for expected in pattern.split('/') {
        let actual = path_segments.next()?;
        match placeholder(expected) {
            Some(name) if !actual.is_empty() => {
                params.insert(name.to_string(), actual.to_string());
            }
            Some(_) => return None,
            None if expected == actual => {}
            None => return None,
        }
    }
    path_segments.next().is_none().then_some(params)
}

/// Fills `{param}` placeholders of `pattern`. Unknown placeholders are left as they are.
fn expand(pattern: &str, params: &HashMap<String, String>) -> String {
    pattern
        .split('/')
        .map(|segment| {
            placeholder(segment)
                .and_then(|name| params.get(name))
                .map_or(segment, String::as_str)
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// JSON objects are merged as is, anything else lands under `content`.
fn decode(body: &Bytes) -> Map<String, Value> {
    match serde_json::from_slice::<Value>(body) {
        Ok(Value::Object(data)) => data,
        Ok(other) => Map::from_iter([("content".to_string(), other)]),
        Err(_) => Map::from_iter([(
            "content".to_string(),
            Value::String(String::from_utf8_lossy(body).into_owned()),
        )]),
    }
}

/// Proxies calling the endpoint's first backend.
pub fn proxy_factory(backends: BackendFactory) -> Arc<dyn ProxyFactory> {
    Arc::new(move |cfg: &EndpointConfig| -> Result<Proxy, BoxError> {
        let backend = cfg
            .backends
            .first()
            .ok_or_else(|| format!("endpoint {} has no backends", cfg.endpoint))?;
        Ok(backends(backend))
    })
}

/// Handlers translating between HTTP and the pipeline, bounded by the endpoint timeout.
pub fn handlers() -> HandlerFactory {
    Arc::new(|cfg: &EndpointConfig, proxy: Proxy| -> Handler {
        let timeout = cfg.timeout;
        let pattern = cfg.endpoint.clone();
        BoxCloneService::new(service_fn(move |req: http::Request<HttpBody>| {
            let proxy = proxy.clone();
            let pattern = pattern.clone();
            async move {
                let ctx = Context::from_request(&req);
                let (parts, body) = req.into_parts();
                let body = match body.collect().await {
                    Ok(collected) => collected.to_bytes(),
                    Err(never) => match never {},
                };
                let path = parts.uri.path().to_string();
                let request = Request {
                    method: parts.method,
                    params: match_route(&pattern, &path).unwrap_or_default(),
                    query: parts.uri.query().map(str::to_string),
                    path,
                    headers: parts.headers,
                    body,
                };

                let response = match tokio::time::timeout(timeout, proxy(ctx, request)).await {
                    Ok(Ok(response)) => respond(response),
                    Ok(Err(err)) => {
                        warn!("backend call failed: {err}");
                        plain(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
                    }
                    Err(_) => plain(StatusCode::GATEWAY_TIMEOUT, "backend timed out".to_string()),
                };
                Ok::<_, Infallible>(response)
            }
        }))
    })
}

fn respond(response: Response) -> http::Response<HttpBody> {
    let status = StatusCode::from_u16(response.metadata.status_code).unwrap_or(StatusCode::OK);
    match serde_json::to_vec(&response.data) {
        Ok(body) => {
            let mut out = http::Response::new(HttpBody::new(Bytes::from(body)));
            *out.status_mut() = status;
            out.headers_mut().insert(
                http::header::CONTENT_TYPE,
                http::HeaderValue::from_static("application/json"),
            );
            out
        }
        Err(err) => plain(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

pub fn plain(status: StatusCode, message: String) -> http::Response<HttpBody> {
    let mut out = http::Response::new(HttpBody::new(Bytes::from(message)));
    *out.status_mut() = status;
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Client answering every call with `body`, remembering `METHOD uri` of each call.
    fn canned_clients(body: &'static str, seen: Arc<Mutex<Vec<String>>>) -> HttpClientFactory {
        Arc::new(move |_ctx: &Context| -> HttpClient {
            let seen = seen.clone();
            BoxCloneService::new(service_fn(move |req: http::Request<HttpBody>| {
                seen.lock().unwrap().push(format!("{} {}", req.method(), req.uri()));
                async move {
                    Ok::<_, BoxError>(http::Response::new(HttpBody::new(Bytes::from_static(
                        body.as_bytes(),
                    ))))
                }
            }))
        })
    }

    #[test]
    fn test_decode() {
        let data = decode(&Bytes::from_static(br#"{"id": 7}"#));
        assert_eq!(data.get("id"), Some(&Value::from(7)));

        let data = decode(&Bytes::from_static(b"[1, 2]"));
        assert_eq!(data.get("content"), Some(&serde_json::json!([1, 2])));

        let data = decode(&Bytes::from_static(b"plain text"));
        assert_eq!(data.get("content"), Some(&Value::from("plain text")));
    }

    #[tokio::test]
    async fn test_backend_forwards_to_host() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let backends = backends(
            "http://fallback.local".to_string(),
            canned_clients(r#"{"name": "ada"}"#, seen.clone()),
        );
        let backend = Backend {
            hosts: vec!["http://users.local".into()],
            ..Default::default()
        };

        let request = Request {
            path: "/users/7".into(),
            query: Some("full=1".into()),
            ..Default::default()
        };
        let response = backends(&backend)(Context::new(), request).await.unwrap();

        assert_eq!(response.data.get("name"), Some(&Value::from("ada")));
        assert!(response.is_complete);
        assert_eq!(
            *seen.lock().unwrap(),
            vec!["GET http://users.local/users/7?full=1".to_string()]
        );
    }

    #[tokio::test]
    async fn test_backend_uses_upstream_without_hosts() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let backends = backends(
            "http://fallback.local".to_string(),
            canned_clients("{}", seen.clone()),
        );
        let backend = Backend {
            url_pattern: "/health".into(),
            ..Default::default()
        };

        backends(&backend)(Context::new(), Request::default())
            .await
            .unwrap();

        assert_eq!(
            *seen.lock().unwrap(),
            vec!["GET http://fallback.local/health".to_string()]
        );
    }

    #[tokio::test]
    async fn test_backend_keeps_method_and_fills_params() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let backends = backends(
            "http://fallback.local".to_string(),
            canned_clients("{}", seen.clone()),
        );
        let backend = Backend {
            url_pattern: "/v2/accounts/{id}/{missing}".into(),
            ..Default::default()
        };

        let request = Request {
            method: http::Method::POST,
            path: "/users/7".into(),
            params: HashMap::from([("id".to_string(), "7".to_string())]),
            ..Default::default()
        };
        backends(&backend)(Context::new(), request).await.unwrap();

        assert_eq!(
            *seen.lock().unwrap(),
            vec!["POST http://fallback.local/v2/accounts/7/{missing}".to_string()]
        );
    }

    #[test]
    fn test_match_route() {
        assert_eq!(match_route("/users", "/users"), Some(HashMap::new()));
        assert_eq!(
            match_route("/users/{id}", "/users/7"),
            Some(HashMap::from([("id".to_string(), "7".to_string())]))
        );
        assert_eq!(match_route("/users/{id}", "/users/"), None);
        assert_eq!(match_route("/users/{id}", "/users/7/posts"), None);
        assert_eq!(match_route("/users", "/accounts"), None);
    }

    #[tokio::test]
    async fn test_handler_passes_route_params() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let proxy = backends(
            "http://users.local".to_string(),
            canned_clients("{}", seen.clone()),
        )(&Backend {
            url_pattern: "/accounts/{id}".into(),
            ..Default::default()
        });
        let cfg = EndpointConfig {
            endpoint: "/users/{id}".into(),
            timeout: Duration::from_secs(1),
            ..Default::default()
        };

        let request = http::Request::delete("/users/42")
            .body(HttpBody::new(Bytes::new()))
            .unwrap();
        let response = handlers()(&cfg, proxy).oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            *seen.lock().unwrap(),
            vec!["DELETE http://users.local/accounts/42".to_string()]
        );
    }

    #[test]
    fn test_proxy_factory_requires_backend() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let factory = proxy_factory(backends(String::new(), canned_clients("{}", seen)));
        assert!(factory.new_proxy(&EndpointConfig::default()).is_err());
    }

    #[tokio::test]
    async fn test_handler_times_out() {
        let slow: Proxy = Arc::new(|_ctx: Context, _req: Request| -> ProxyFuture {
            Box::pin(std::future::pending::<Result<Response, BoxError>>())
        });
        let cfg = EndpointConfig {
            timeout: Duration::from_millis(10),
            ..Default::default()
        };

        let request = http::Request::new(HttpBody::new(Bytes::new()));
        let response = handlers()(&cfg, slow).oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[tokio::test]
    async fn test_handler_reports_backend_failure() {
        let failing: Proxy = Arc::new(|_ctx: Context, _req: Request| -> ProxyFuture {
            Box::pin(async { Err::<Response, BoxError>("connection refused".into()) })
        });
        let cfg = EndpointConfig {
            timeout: Duration::from_secs(1),
            ..Default::default()
        };

        let request = http::Request::new(HttpBody::new(Bytes::new()));
        let response = handlers()(&cfg, failing).oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
