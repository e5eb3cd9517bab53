// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use crate::agent::Agent;
use crate::pipeline::{Backend, BackendFactory, Proxy};
use crate::segment;

/// Instruments every backend proxy built by `next` with a segment named `segment_name`.
pub fn backend_factory(
    agent: Option<&Arc<Agent>>,
    segment_name: &str,
    next: BackendFactory,
) -> BackendFactory {
    if agent.is_none() {
        return next;
    }

    let segment_name: Arc<str> = Arc::from(segment_name);
    Arc::new(move |backend: &Backend| segment::wrap(segment_name.clone(), next(backend)))
}

pub fn new_backend(agent: Option<&Arc<Agent>>, segment_name: &str, next: Proxy) -> Proxy {
    match agent {
        Some(_) => segment::wrap(segment_name, next),
        None => next,
    }
}
