// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The instrumentation handle and the narrow APM client contract behind it.
//!
//! An APM backend only has to provide [`Apm`] (start a transaction) and
//! [`TransactionHandle`]/[`SegmentHandle`] (name it, time nested work, end it). The
//! [`Registrar`] resolves configuration, asks an [`ApmConnector`] for a client and
//! publishes the resulting [`Agent`]. Adapters capture `Option<Arc<Agent>>` once, when
//! they are built; `None` turns them into passthroughs.

use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use http::{HeaderMap, Method, StatusCode, Uri};
use tracing::debug;

use crate::config::{self, ExtraConfig, InstrumentationConfig, NAMESPACE};
use crate::error::ApmError;
use crate::sampling::Sampler;
use crate::tracing_apm::TracingApm;

/// Builds an APM client from resolved configuration.
pub type ApmConnector =
    Arc<dyn Fn(&InstrumentationConfig) -> Result<Arc<dyn Apm>, ApmError> + Send + Sync>;

/// What an APM client sees of an inbound request.
#[derive(Debug, Clone, Copy)]
pub struct InboundRequest<'a> {
    pub method: &'a Method,
    pub uri: &'a Uri,
    pub headers: &'a HeaderMap,
}

impl<'a> InboundRequest<'a> {
    pub fn from_request<B>(request: &'a http::Request<B>) -> Self {
        Self {
            method: request.method(),
            uri: request.uri(),
            headers: request.headers(),
        }
    }
}

pub trait Apm: Send + Sync + fmt::Debug {
    fn start_transaction(&self, name: &str, request: InboundRequest<'_>) -> Transaction;
}

pub trait TransactionHandle: Send + Sync + fmt::Debug {
    fn set_name(&self, name: &str);

    fn start_segment(&self, name: &str) -> Box<dyn SegmentHandle>;

    /// Starts a segment timing an outbound HTTP call.
    fn start_external_segment(&self, method: &Method, uri: &Uri) -> Box<dyn SegmentHandle>;

    fn set_response_status(&self, status: StatusCode);

    /// Headers to add to an outbound call so the callee can join this trace.
    fn outbound_headers(&self) -> HeaderMap {
        HeaderMap::new()
    }

    /// Ends the transaction. Calls after the first are ignored.
    fn end(&self);
}

pub trait SegmentHandle: Send {
    fn end(self: Box<Self>);
}

/// A per-request transaction. Cloning shares the same underlying transaction.
#[derive(Clone, Debug)]
pub struct Transaction(Arc<dyn TransactionHandle>);

impl Transaction {
    pub fn new(handle: impl TransactionHandle + 'static) -> Self {
        Self(Arc::new(handle))
    }

    pub fn set_name(&self, name: &str) {
        self.0.set_name(name);
    }

    pub fn start_segment(&self, name: &str) -> Segment {
        Segment::new(self.0.start_segment(name))
    }

    pub fn start_external_segment(&self, method: &Method, uri: &Uri) -> Segment {
        Segment::new(self.0.start_external_segment(method, uri))
    }

    pub fn set_response_status(&self, status: StatusCode) {
        self.0.set_response_status(status);
    }

    pub fn outbound_headers(&self) -> HeaderMap {
        self.0.outbound_headers()
    }

    pub fn end(&self) {
        self.0.end();
    }

    /// Whether both handles refer to the same transaction.
    pub fn ptr_eq(&self, other: &Transaction) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// A started segment. It ends exactly once: on [`Segment::end`] or, failing that, on drop,
/// which covers panicking stages and cancelled request futures.
#[must_use = "a segment ends as soon as it is dropped"]
pub struct Segment {
    handle: Option<Box<dyn SegmentHandle>>,
}

impl Segment {
    fn new(handle: Box<dyn SegmentHandle>) -> Self {
        Self {
            handle: Some(handle),
        }
    }

    pub fn end(mut self) {
        if let Some(handle) = self.handle.take() {
            handle.end();
        }
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.end();
        }
    }
}

impl fmt::Debug for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Segment")
            .field("open", &self.handle.is_some())
            .finish()
    }
}

/// The long-lived instrumentation handle.
#[derive(Debug)]
pub struct Agent {
    config: InstrumentationConfig,
    sampler: Sampler,
    apm: Arc<dyn Apm>,
}

impl Agent {
    pub fn new(config: InstrumentationConfig, apm: Arc<dyn Apm>) -> Self {
        let sampler = Sampler::from_rate(config.instrumentation_rate);
        Self {
            config,
            sampler,
            apm,
        }
    }

    pub fn config(&self) -> &InstrumentationConfig {
        &self.config
    }

    pub fn sampler(&self) -> Sampler {
        self.sampler
    }

    pub fn start_transaction(&self, name: &str, request: InboundRequest<'_>) -> Transaction {
        self.apm.start_transaction(name, request)
    }
}

/// Owns the published [`Agent`].
///
/// Registration is expected once at startup; a later successful registration replaces the
/// agent atomically, so readers never see a half-built one. A failed registration leaves
/// whatever was published untouched.
pub struct Registrar {
    namespace: String,
    connector: ApmConnector,
    agent: ArcSwapOption<Agent>,
}

impl Registrar {
    pub fn new(connector: ApmConnector) -> Self {
        Self {
            namespace: NAMESPACE.to_string(),
            connector,
            agent: ArcSwapOption::empty(),
        }
    }

    #[must_use]
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Resolves the configuration and starts the agent. Every failure only disables
    /// instrumentation, so it is logged at debug level and reported as `None`.
    pub fn register(&self, extra: &ExtraConfig) -> Option<Arc<Agent>> {
        let config = match config::resolve(extra, &self.namespace) {
            Ok(config) => config,
            Err(err) => {
                debug!("no config for the APM module: {err}");
                return None;
            }
        };

        let apm = match (self.connector)(&config) {
            Ok(apm) => apm,
            Err(err) => {
                debug!("unable to start the APM module: {err}");
                return None;
            }
        };

        debug!(
            app = %config.app_name,
            rate = config.instrumentation_rate,
            "APM module registered"
        );
        let agent = Arc::new(Agent::new(config, apm));
        self.agent.store(Some(agent.clone()));
        Some(agent)
    }

    pub fn agent(&self) -> Option<Arc<Agent>> {
        self.agent.load_full()
    }
}

impl Default for Registrar {
    fn default() -> Self {
        Self::new(TracingApm::connector())
    }
}

impl fmt::Debug for Registrar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registrar")
            .field("namespace", &self.namespace)
            .field("agent", &self.agent.load().is_some())
            .finish()
    }
}
