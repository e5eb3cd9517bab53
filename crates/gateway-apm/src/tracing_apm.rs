// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! APM client that reports through `tracing`.
//!
//! Transactions are `apm.transaction` spans. Segments and outbound calls are
//! `apm.segment` and `apm.external` spans parented to their transaction, so any subscriber
//! (a fmt layer, an OpenTelemetry bridge) sees the full request tree.
//!
//! Request attributes (`request.method`, `request.uri`, `request.headers.host`,
//! `request.headers.userAgent`, `labels`) go through the `attributes` filter before they
//! are recorded on the transaction span.

use std::backtrace::Backtrace;
use std::env;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use http::{header, HeaderMap, HeaderValue, Method, StatusCode, Uri};
use rand::{thread_rng, Rng};
use tracing::{debug, field, info, info_span, warn, Span};

use crate::agent::{
    Apm, ApmConnector, InboundRequest, SegmentHandle, Transaction, TransactionHandle,
};
use crate::config::{InstrumentationConfig, UtilizationConfig};
use crate::error::ApmError;

/// Length of a valid license key.
pub const LICENSE_LENGTH: usize = 40;

pub const ATTR_REQUEST_METHOD: &str = "request.method";
pub const ATTR_REQUEST_URI: &str = "request.uri";
pub const ATTR_REQUEST_HOST: &str = "request.headers.host";
pub const ATTR_REQUEST_USER_AGENT: &str = "request.headers.userAgent";
pub const ATTR_LABELS: &str = "labels";

/// W3C trace context header, read on inbound requests and written on outbound calls.
pub const TRACEPARENT: &str = "traceparent";

#[derive(Debug, Clone)]
pub struct TracingApm {
    config: Arc<InstrumentationConfig>,
    utilization: Arc<Utilization>,
}

impl TracingApm {
    pub fn connect(config: &InstrumentationConfig) -> Result<Self, ApmError> {
        if config.license.len() != LICENSE_LENGTH {
            return Err(ApmError::AgentConstruction(format!(
                "license length is not {LICENSE_LENGTH}"
            )));
        }
        if config.app_name.is_empty() {
            return Err(ApmError::AgentConstruction(
                "application name is required".to_string(),
            ));
        }

        let utilization = Utilization::detect(
            &config.utilization,
            |var| env::var_os(var).is_some(),
            Path::new("/.dockerenv").exists(),
        );
        debug!(
            app = %config.app_name,
            vendors = ?utilization.vendors,
            billing_hostname = %utilization.billing_hostname,
            logical_processors = utilization.logical_processors,
            total_ram_mib = utilization.total_ram_mib,
            "tracing APM client connected"
        );

        Ok(Self {
            config: Arc::new(config.clone()),
            utilization: Arc::new(utilization),
        })
    }

    pub fn connector() -> ApmConnector {
        Arc::new(|config: &InstrumentationConfig| {
            Ok(Arc::new(Self::connect(config)?) as Arc<dyn Apm>)
        })
    }

    pub fn utilization(&self) -> &Utilization {
        &self.utilization
    }

    fn reported_uri(&self, uri: &Uri) -> String {
        if self.config.high_security {
            strip_query(uri)
        } else {
            uri.to_string()
        }
    }

    fn admits(&self, attribute: &str) -> bool {
        self.config.attributes.admits(attribute)
    }
}

fn strip_query(uri: &Uri) -> String {
    let mut stripped = String::new();
    if let Some(scheme) = uri.scheme_str() {
        stripped.push_str(scheme);
        stripped.push_str("://");
    }
    if let Some(authority) = uri.authority() {
        stripped.push_str(authority.as_str());
    }
    stripped.push_str(uri.path());
    stripped
}

/// What the host looks like, as far as the enabled detections can tell.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Utilization {
    pub vendors: Vec<&'static str>,
    pub billing_hostname: String,
    pub logical_processors: u32,
    /// Zero when unknown.
    pub total_ram_mib: u64,
}

impl Utilization {
    fn detect(
        config: &UtilizationConfig,
        has_env: impl Fn(&str) -> bool,
        in_docker: bool,
    ) -> Self {
        let any_env = |vars: &[&str]| vars.iter().any(|&var| has_env(var));
        let detections = [
            (config.detect_aws, "aws", any_env(&["AWS_EXECUTION_ENV", "AWS_REGION"])),
            (
                config.detect_azure,
                "azure",
                any_env(&["WEBSITE_SITE_NAME", "FUNCTIONS_WORKER_RUNTIME"]),
            ),
            (
                config.detect_gcp,
                "gcp",
                any_env(&["K_SERVICE", "FUNCTION_TARGET", "GOOGLE_CLOUD_PROJECT"]),
            ),
            (config.detect_pcf, "pcf", any_env(&["VCAP_APPLICATION"])),
            (config.detect_docker, "docker", in_docker),
            (
                config.detect_kubernetes,
                "kubernetes",
                any_env(&["KUBERNETES_SERVICE_HOST"]),
            ),
        ];

        let logical_processors = match config.logical_processors {
            0 => std::thread::available_parallelism()
                .map(|n| u32::try_from(n.get()).unwrap_or(u32::MAX))
                .unwrap_or(0),
            n => n,
        };

        Self {
            vendors: detections
                .into_iter()
                .filter(|(enabled, _, detected)| *enabled && *detected)
                .map(|(_, vendor, _)| vendor)
                .collect(),
            billing_hostname: config.billing_hostname.clone(),
            logical_processors,
            total_ram_mib: config.total_ram_mib,
        }
    }
}

/// Trace identity shared with upstream and downstream services.
#[derive(Debug, Clone, PartialEq)]
struct TraceContext {
    trace_id: String,
}

impl TraceContext {
    fn new_root() -> Self {
        Self {
            trace_id: format!("{:032x}", thread_rng().gen::<u128>()),
        }
    }

    /// `00-<trace id>-<parent id>-<flags>`; anything else starts a new trace.
    fn from_headers(headers: &HeaderMap) -> Option<Self> {
        let value = headers.get(TRACEPARENT)?.to_str().ok()?;
        let mut parts = value.trim().split('-');
        let (version, trace_id, parent_id, flags) =
            (parts.next()?, parts.next()?, parts.next()?, parts.next()?);
        if parts.next().is_some() && version == "00" {
            return None;
        }

        let is_hex = |s: &str, len: usize| {
            s.len() == len && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
        };
        let valid = is_hex(version, 2)
            && version != "ff"
            && is_hex(trace_id, 32)
            && trace_id.bytes().any(|b| b != b'0')
            && is_hex(parent_id, 16)
            && parent_id.bytes().any(|b| b != b'0')
            && is_hex(flags, 2);

        valid.then(|| Self {
            trace_id: trace_id.to_string(),
        })
    }

    fn traceparent(&self) -> Option<HeaderValue> {
        let span_id = thread_rng().gen_range(1..=u64::MAX);
        HeaderValue::from_str(&format!("00-{}-{span_id:016x}-01", self.trace_id)).ok()
    }
}

impl Apm for TracingApm {
    fn start_transaction(&self, name: &str, request: InboundRequest<'_>) -> Transaction {
        let trace = self.config.distributed_tracer.enabled.then(|| {
            TraceContext::from_headers(request.headers).unwrap_or_else(TraceContext::new_root)
        });

        let span = info_span!(
            "apm.transaction",
            app = %self.config.app_name,
            transaction = %name,
            display_host = %self.config.host_display_name,
            method = field::Empty,
            uri = field::Empty,
            host = field::Empty,
            user_agent = field::Empty,
            labels = field::Empty,
            trace_id = field::Empty,
            status = field::Empty,
            error = field::Empty,
        );

        if self.admits(ATTR_REQUEST_METHOD) {
            span.record("method", field::display(request.method));
        }
        if self.admits(ATTR_REQUEST_URI) {
            span.record("uri", field::display(self.reported_uri(request.uri)));
        }
        let header_value = |name: header::HeaderName| {
            request
                .headers
                .get(name)
                .and_then(|value| value.to_str().ok())
        };
        if let Some(host) =
            header_value(header::HOST).filter(|_| self.admits(ATTR_REQUEST_HOST))
        {
            span.record("host", field::display(host));
        }
        if let Some(agent) =
            header_value(header::USER_AGENT).filter(|_| self.admits(ATTR_REQUEST_USER_AGENT))
        {
            span.record("user_agent", field::display(agent));
        }
        if !self.config.labels.is_empty() && self.admits(ATTR_LABELS) {
            span.record("labels", field::debug(&self.config.labels));
        }
        if let Some(trace) = &trace {
            span.record("trace_id", field::display(&trace.trace_id));
        }

        if self.config.debug {
            debug!(parent: &span, transaction = %name, "transaction started");
        }

        Transaction::new(TracingTransaction {
            apm: self.clone(),
            span,
            trace,
            name: Mutex::new(name.to_string()),
            status: Mutex::new(None),
            started: Instant::now(),
            ended: AtomicBool::new(false),
        })
    }
}

#[derive(Debug)]
struct TracingTransaction {
    apm: TracingApm,
    span: Span,
    trace: Option<TraceContext>,
    name: Mutex<String>,
    status: Mutex<Option<StatusCode>>,
    started: Instant,
    ended: AtomicBool,
}

impl TracingTransaction {
    fn config(&self) -> &InstrumentationConfig {
        &self.apm.config
    }

    fn segment(&self, span: Span, name: String) -> Box<dyn SegmentHandle> {
        let config = self.config();
        if config.debug {
            debug!(parent: &span, segment = %name, "segment started");
        }

        let tracer = &config.transaction_tracer;
        let when_tracing = |threshold: Option<Duration>| threshold.filter(|_| tracer.enabled);
        Box::new(TracingSegment {
            span,
            name,
            started: Instant::now(),
            debug: config.debug,
            slow_threshold: when_tracing(tracer.segment_threshold),
            stack_trace_threshold: when_tracing(tracer.stack_trace_threshold),
        })
    }
}

impl TransactionHandle for TracingTransaction {
    fn set_name(&self, name: &str) {
        self.span.record("transaction", field::display(name));
        *self.name.lock().unwrap_or_else(PoisonError::into_inner) = name.to_string();
    }

    fn start_segment(&self, name: &str) -> Box<dyn SegmentHandle> {
        let span = info_span!(parent: &self.span, "apm.segment", segment = %name);
        self.segment(span, name.to_string())
    }

    fn start_external_segment(&self, method: &Method, uri: &Uri) -> Box<dyn SegmentHandle> {
        let uri = self.apm.reported_uri(uri);
        let span = info_span!(parent: &self.span, "apm.external", method = %method, uri = %uri);
        self.segment(span, format!("{method} {uri}"))
    }

    fn set_response_status(&self, status: StatusCode) {
        self.span.record("status", status.as_u16());
        *self.status.lock().unwrap_or_else(PoisonError::into_inner) = Some(status);
    }

    fn outbound_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Some(traceparent) = self.trace.as_ref().and_then(TraceContext::traceparent) {
            headers.insert(TRACEPARENT, traceparent);
        }
        headers
    }

    fn end(&self) {
        if self.ended.swap(true, Ordering::AcqRel) {
            return;
        }

        let config = self.config();
        let elapsed = self.started.elapsed();
        let name = self
            .name
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let status = *self.status.lock().unwrap_or_else(PoisonError::into_inner);

        let is_error = status.is_some_and(|status| config.error_collector.is_error(status.as_u16()));
        if is_error {
            self.span.record("error", true);
            if config.error_collector.capture_events {
                warn!(
                    parent: &self.span,
                    transaction = %name,
                    status = status.map(|s| s.as_u16()),
                    "transaction error"
                );
            }
        }

        let tracer = &config.transaction_tracer;
        if let Some(threshold) = tracer.threshold.filter(|_| tracer.enabled) {
            if elapsed > threshold {
                info!(
                    parent: &self.span,
                    transaction = %name,
                    elapsed_ms = elapsed.as_millis() as u64,
                    threshold_ms = threshold.as_millis() as u64,
                    "slow transaction"
                );
            }
        }

        if config.transaction_events.enabled {
            info!(
                parent: &self.span,
                transaction = %name,
                status = status.map(|s| s.as_u16()),
                duration_ms = elapsed.as_millis() as u64,
                error = is_error,
                "transaction event"
            );
        }

        if config.debug {
            debug!(
                parent: &self.span,
                transaction = %name,
                elapsed_ms = elapsed.as_millis() as u64,
                "transaction ended"
            );
        }
    }
}

struct TracingSegment {
    span: Span,
    name: String,
    started: Instant,
    debug: bool,
    slow_threshold: Option<Duration>,
    stack_trace_threshold: Option<Duration>,
}

impl SegmentHandle for TracingSegment {
    fn end(self: Box<Self>) {
        let elapsed = self.started.elapsed();

        if let Some(threshold) = self.slow_threshold.filter(|t| elapsed > *t) {
            info!(
                parent: &self.span,
                segment = %self.name,
                elapsed_ms = elapsed.as_millis() as u64,
                threshold_ms = threshold.as_millis() as u64,
                "slow segment"
            );
        }
        if self.stack_trace_threshold.is_some_and(|t| elapsed > t) {
            debug!(
                parent: &self.span,
                segment = %self.name,
                backtrace = %Backtrace::force_capture(),
                "segment stack trace"
            );
        }

        if self.debug {
            debug!(
                parent: &self.span,
                segment = %self.name,
                elapsed_ms = elapsed.as_millis() as u64,
                "segment ended"
            );
        }
    }
}
