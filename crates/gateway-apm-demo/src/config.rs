// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::env;
use std::path::PathBuf;

use anyhow::{bail, Context as _};
use gateway_apm::ExtraConfig;

const DEFAULT_PORT: u16 = 8080;
const DEFAULT_UPSTREAM: &str = "http://127.0.0.1:9000";
const DEFAULT_ENDPOINT: &str = "/api";

/// Settings of the demo gateway
#[derive(Debug, Clone, PartialEq)]
pub struct DemoConfig {
    /// Port the gateway listens on
    pub port: u16,
    /// Base URL the single backend forwards to
    pub upstream: String,
    /// JSON file holding the gateway's extra config
    pub extra_config_path: Option<PathBuf>,
    /// Route of the single endpoint
    pub endpoint: String,
    pub log_level: String,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            upstream: DEFAULT_UPSTREAM.to_string(),
            extra_config_path: None,
            endpoint: DEFAULT_ENDPOINT.to_string(),
            log_level: "info".to_string(),
        }
    }
}

impl DemoConfig {
    /// Create configuration from environment variables
    pub fn from_env() -> anyhow::Result<Self> {
        let port = match env::var("GATEWAY_APM_PORT") {
            Ok(port) => port
                .parse::<u16>()
                .with_context(|| format!("invalid GATEWAY_APM_PORT: {port}"))?,
            Err(_) => DEFAULT_PORT,
        };
        let upstream =
            env::var("GATEWAY_APM_UPSTREAM").unwrap_or_else(|_| DEFAULT_UPSTREAM.to_string());
        let extra_config_path = env::var("GATEWAY_APM_CONFIG").ok().map(PathBuf::from);
        let endpoint =
            env::var("GATEWAY_APM_ENDPOINT").unwrap_or_else(|_| DEFAULT_ENDPOINT.to_string());
        let log_level = env::var("GATEWAY_APM_LOG_LEVEL")
            .map(|val| val.to_lowercase())
            .unwrap_or_else(|_| "info".to_string());

        let config = Self {
            port,
            upstream: upstream.trim_end_matches('/').to_string(),
            extra_config_path,
            endpoint,
            log_level,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.port == 0 {
            bail!("GATEWAY_APM_PORT must be greater than 0");
        }
        if !self.endpoint.starts_with('/') {
            bail!("GATEWAY_APM_ENDPOINT must start with '/', got: {}", self.endpoint);
        }
        if self.upstream.parse::<http::Uri>().is_err() {
            bail!("GATEWAY_APM_UPSTREAM is not a valid URL: {}", self.upstream);
        }
        Ok(())
    }

    /// Reads the extra config document. Without a file the document is empty, which leaves
    /// instrumentation off.
    pub fn load_extra_config(&self) -> anyhow::Result<ExtraConfig> {
        let Some(path) = &self.extra_config_path else {
            return Ok(ExtraConfig::new());
        };
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("unable to read {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("unable to parse {}", path.display()))
    }
}
