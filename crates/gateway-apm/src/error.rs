// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

/// Error type carried by pipeline stages. Wrappers hand it back untouched.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors raised while setting up instrumentation.
///
/// The first three variants mean "instrumentation is off for this deployment": they are
/// logged at debug level and never reach the request path. `MisconfiguredComposition` is an
/// integration bug and is returned from the composition call itself.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum ApmError {
    #[error("no instrumentation config found under namespace {0}")]
    ConfigNotFound(String),

    #[error("malformed instrumentation config: {0}")]
    ConfigMalformed(String),

    #[error("unable to start the APM agent: {0}")]
    AgentConstruction(String),

    #[error("misconfigured composition: {0}")]
    MisconfiguredComposition(#[from] CompositionError),
}

/// Arity violations of a middleware that expects exactly one successor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CompositionError {
    #[error("not enough proxies for this middleware")]
    NotEnoughProxies,

    #[error("too many proxies for this middleware")]
    TooManyProxies,
}
