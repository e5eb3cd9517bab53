// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Recording APM client shared by the unit tests.

#![cfg(test)]

use std::sync::{Arc, Mutex};

use http::{HeaderMap, HeaderValue, Method, StatusCode, Uri};

use crate::agent::{
    Agent, Apm, ApmConnector, InboundRequest, SegmentHandle, Transaction, TransactionHandle,
};
use crate::config::InstrumentationConfig;

/// Header every recorded transaction asks outbound calls to carry.
pub(crate) const TRACE_HEADER: &str = "x-recorded-trace";

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Recorded {
    TransactionStarted(String),
    Renamed(String),
    SegmentStarted(String),
    SegmentEnded(String),
    ExternalStarted(String),
    ExternalEnded(String),
    Status(u16),
    TransactionEnded,
}

/// Records every call made through the APM contract, in order.
#[derive(Debug, Clone, Default)]
pub(crate) struct RecordingApm {
    log: Arc<Mutex<Vec<Recorded>>>,
}

impl RecordingApm {
    pub(crate) fn recorded(&self) -> Vec<Recorded> {
        self.log.lock().unwrap().clone()
    }

    /// A transaction that did not go through the router.
    pub(crate) fn transaction(&self) -> Transaction {
        Transaction::new(RecordingTransaction {
            log: self.log.clone(),
        })
    }

    pub(crate) fn started_transactions(&self) -> usize {
        self.count(|r| matches!(r, Recorded::TransactionStarted(_)))
    }

    pub(crate) fn started_segments(&self, name: &str) -> usize {
        self.count(|r| matches!(r, Recorded::SegmentStarted(n) if n == name))
    }

    pub(crate) fn ended_segments(&self, name: &str) -> usize {
        self.count(|r| matches!(r, Recorded::SegmentEnded(n) if n == name))
    }

    pub(crate) fn count(&self, predicate: impl Fn(&Recorded) -> bool) -> usize {
        self.log.lock().unwrap().iter().filter(|r| predicate(r)).count()
    }

    fn push(log: &Mutex<Vec<Recorded>>, recorded: Recorded) {
        log.lock().unwrap().push(recorded);
    }
}

impl Apm for RecordingApm {
    fn start_transaction(&self, name: &str, _request: InboundRequest<'_>) -> Transaction {
        Self::push(&self.log, Recorded::TransactionStarted(name.to_string()));
        self.transaction()
    }
}

#[derive(Debug)]
struct RecordingTransaction {
    log: Arc<Mutex<Vec<Recorded>>>,
}

impl TransactionHandle for RecordingTransaction {
    fn set_name(&self, name: &str) {
        RecordingApm::push(&self.log, Recorded::Renamed(name.to_string()));
    }

    fn start_segment(&self, name: &str) -> Box<dyn SegmentHandle> {
        RecordingApm::push(&self.log, Recorded::SegmentStarted(name.to_string()));
        Box::new(RecordingSegment {
            log: self.log.clone(),
            ended: Recorded::SegmentEnded(name.to_string()),
        })
    }

    fn start_external_segment(&self, method: &Method, uri: &Uri) -> Box<dyn SegmentHandle> {
        let call = format!("{method} {uri}");
        RecordingApm::push(&self.log, Recorded::ExternalStarted(call.clone()));
        Box::new(RecordingSegment {
            log: self.log.clone(),
            ended: Recorded::ExternalEnded(call),
        })
    }

    fn set_response_status(&self, status: StatusCode) {
        RecordingApm::push(&self.log, Recorded::Status(status.as_u16()));
    }

    fn outbound_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(TRACE_HEADER, HeaderValue::from_static("recorded"));
        headers
    }

    fn end(&self) {
        RecordingApm::push(&self.log, Recorded::TransactionEnded);
    }
}

struct RecordingSegment {
    log: Arc<Mutex<Vec<Recorded>>>,
    ended: Recorded,
}

impl SegmentHandle for RecordingSegment {
    fn end(self: Box<Self>) {
        let RecordingSegment { log, ended } = *self;
        RecordingApm::push(&log, ended);
    }
}

pub(crate) fn recording_connector(apm: RecordingApm) -> ApmConnector {
    Arc::new(move |_config: &InstrumentationConfig| Ok(Arc::new(apm.clone()) as Arc<dyn Apm>))
}

/// An agent backed by `apm` with the given instrumentation rate.
pub(crate) fn recording_agent(apm: &RecordingApm, rate: u8) -> Arc<Agent> {
    let config = InstrumentationConfig {
        license: "1234567890123456789012345678901234567890".into(),
        app_name: "test".into(),
        instrumentation_rate: rate,
        ..Default::default()
    };
    Arc::new(Agent::new(config, Arc::new(apm.clone())))
}
