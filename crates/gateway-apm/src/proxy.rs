// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use crate::agent::Agent;
use crate::error::{ApmError, BoxError};
use crate::pipeline::{self, EndpointConfig, Middleware, Proxy, ProxyFactory};
use crate::segment;

/// Instruments every proxy built by `next` with a segment named `segment_name`.
///
/// Without an agent `next` is returned unchanged.
pub fn proxy_factory(
    agent: Option<&Arc<Agent>>,
    segment_name: &str,
    next: Arc<dyn ProxyFactory>,
) -> Arc<dyn ProxyFactory> {
    if agent.is_none() {
        return next;
    }

    let middleware = new_proxy_middleware(agent, segment_name);
    Arc::new(move |cfg: &EndpointConfig| -> Result<Proxy, BoxError> {
        let proxy = next.new_proxy(cfg)?;
        Ok(middleware(vec![proxy])?)
    })
}

/// Middleware adding a segment around its single successor.
///
/// Composing it over no proxy or over several fails whether or not an agent is present.
pub fn new_proxy_middleware(agent: Option<&Arc<Agent>>, segment_name: &str) -> Middleware {
    if agent.is_none() {
        return pipeline::empty_middleware();
    }

    let segment_name: Arc<str> = Arc::from(segment_name);
    Arc::new(move |next: Vec<Proxy>| -> Result<Proxy, ApmError> {
        let next = pipeline::single_successor(next)?;
        Ok(segment::wrap(segment_name.clone(), next))
    })
}
