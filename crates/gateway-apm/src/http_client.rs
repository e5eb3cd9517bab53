// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};

use tower::util::BoxCloneService;
use tower::Service;

use crate::agent::Transaction;
use crate::context::{self, Context};
use crate::pipeline::{HttpClient, HttpClientFactory};

/// Times every outbound call made by a client built for a transaction-bearing context.
///
/// Clients built for any other context are returned exactly as `next` made them.
pub fn http_client_factory(next: HttpClientFactory) -> HttpClientFactory {
    Arc::new(move |ctx: &Context| -> HttpClient {
        let client = next(ctx);
        match context::retrieve(ctx) {
            Some(transaction) => BoxCloneService::new(TracingTransport::new(client, transaction)),
            None => client,
        }
    })
}

/// A transport recording each round trip as an external segment of `transaction`.
#[derive(Clone, Debug)]
pub struct TracingTransport<S> {
    inner: S,
    transaction: Transaction,
}

impl<S> TracingTransport<S> {
    pub fn new(inner: S, transaction: Transaction) -> Self {
        Self { inner, transaction }
    }
}

impl<S, ReqBody> Service<http::Request<ReqBody>> for TracingTransport<S>
where
    S: Service<http::Request<ReqBody>>,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut TaskContext<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: http::Request<ReqBody>) -> Self::Future {
        for (name, value) in &self.transaction.outbound_headers() {
            req.headers_mut().insert(name, value.clone());
        }
        let segment = self
            .transaction
            .start_external_segment(req.method(), req.uri());
        let response = self.inner.call(req);
        Box::pin(async move {
            let result = response.await;
            segment.end();
            result
        })
    }
}
