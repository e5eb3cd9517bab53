// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use rand::{thread_rng, Rng};

use crate::config::MAX_INSTRUMENTATION_RATE;

/// Per-request decision of whether a request gets a transaction.
///
/// Draws use the thread-local generator, so concurrent requests never contend on a
/// shared source.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Sampler {
    Never,
    Always,
    /// Instrument when a uniform draw in `[0, 1)` is at most this ratio.
    Ratio(f64),
}

impl Sampler {
    pub fn from_rate(rate_percent: u8) -> Self {
        match rate_percent {
            0 => Sampler::Never,
            r if r >= MAX_INSTRUMENTATION_RATE => Sampler::Always,
            r => Sampler::Ratio(f64::from(r) / f64::from(MAX_INSTRUMENTATION_RATE)),
        }
    }

    pub fn sample(&self) -> bool {
        match self {
            Sampler::Never => false,
            Sampler::Always => true,
            Sampler::Ratio(ratio) => thread_rng().gen::<f64>() <= *ratio,
        }
    }

    pub fn is_disabled(&self) -> bool {
        matches!(self, Sampler::Never)
    }
}
