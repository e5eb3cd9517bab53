// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! APM instrumentation for an API gateway request pipeline.
//!
//! Each inbound request sampled by the [`router::RouterLayer`] becomes a transaction. The
//! proxy, backend and outbound HTTP client stages record their work as segments of that
//! transaction. Every adapter receives the optional [`Agent`] when the pipeline is built;
//! without one, or for requests that are not sampled, the pipeline runs exactly as it would
//! uninstrumented.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod agent;
pub mod backend;
pub mod config;
pub mod context;
pub mod error;
pub mod http_client;
pub mod pipeline;
pub mod proxy;
pub mod router;
pub mod sampling;
pub mod segment;
pub mod tracing_apm;

#[cfg(test)]
mod test_support;

pub use agent::{Agent, Registrar, Transaction};
pub use config::{ExtraConfig, InstrumentationConfig, NAMESPACE};
pub use context::Context;
pub use error::{ApmError, BoxError, CompositionError};
