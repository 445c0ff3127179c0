// Copyright 2023-, Edge & Node, GraphOps, and Semiotic Labs.
// SPDX-License-Identifier: Apache-2.0

use std::{
    collections::BTreeMap,
    env, fmt,
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    path::PathBuf,
    time::Duration,
};

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use regex::Regex;
use serde::Deserialize;
use serde_with::{serde_as, DurationMilliSeconds, DurationSecondsWithFrac};
use url::Url;

const ENV_PREFIX: &str = "SUBGRAPH_PROXY_";

/// Placeholder in an endpoint URL template that is replaced by the
/// provider-side id of a subgraph.
pub const SUBGRAPH_ID_PLACEHOLDER: &str = "<sg-id>";

#[derive(Debug, Deserialize)]
#[cfg_attr(test, derive(PartialEq))]
pub struct Config {
    pub service: ServiceConfig,
    pub metrics: MetricsConfig,
    pub proxy: ProxyConfig,
    pub subgraphs: SubgraphsConfig,
    pub endpoints: Vec<EndpointConfig>,
    #[serde(default)]
    pub chains: BTreeMap<String, Url>,
    pub notifications: NotificationsConfig,
}

// Newtype wrapping Config to be able use serde_ignored with Figment
#[derive(Debug)]
#[cfg_attr(test, derive(PartialEq))]
pub struct ConfigWrapper(pub Config);

// Custom Deserializer for ConfigWrapper
// This is needed to warn about unknown fields
impl<'de> Deserialize<'de> for ConfigWrapper {
    fn deserialize<D>(deserializer: D) -> Result<ConfigWrapper, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let config: Config = serde_ignored::deserialize(deserializer, |path| {
            tracing::warn!("Ignoring unknown configuration field: {}", path);
        })?;

        Ok(ConfigWrapper(config))
    }
}

impl Config {
    pub fn parse(filename: Option<&PathBuf>) -> Result<Self, String> {
        let config_defaults = include_str!("../default_values.toml");

        let mut figment_config = Figment::new().merge(Toml::string(config_defaults));

        if let Some(path) = filename {
            let mut config_content = std::fs::read_to_string(path)
                .map_err(|e| format!("Failed to read config file: {e}"))?;
            config_content = Self::substitute_env_vars(config_content)?;
            figment_config = figment_config.merge(Toml::string(&config_content));
        }

        let config: ConfigWrapper = figment_config
            .merge(Self::from_env_ignore_empty(ENV_PREFIX))
            .extract()
            .map_err(|e| e.to_string())?;

        config.0.validate()?;
        Ok(config.0)
    }

    fn from_env_ignore_empty(prefix: &str) -> Env {
        let prefixed_env = Env::prefixed(prefix).split("__");
        let ignore_prefixed: Vec<_> = prefixed_env
            .iter()
            .filter_map(|(key, value)| {
                if value.is_empty() {
                    Some(key.into_string())
                } else {
                    None
                }
            })
            .collect();
        let ref_ignore = ignore_prefixed
            .iter()
            .map(|k| k.as_str())
            .collect::<Vec<_>>();
        prefixed_env.ignore(&ref_ignore)
    }

    fn substitute_env_vars(content: String) -> Result<String, String> {
        let reg = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").map_err(|e| e.to_string())?;
        let mut missing_vars = Vec::new();
        let mut result = String::new();

        for line in content.lines() {
            if !line.trim_start().starts_with('#') {
                let processed_line = reg.replace_all(line, |caps: &regex::Captures| {
                    let var_name = &caps[1];
                    match env::var(var_name) {
                        Ok(value) => value,
                        Err(_) => {
                            missing_vars.push(var_name.to_string());
                            format!("${{{var_name}}}")
                        }
                    }
                });
                result.push_str(&processed_line);
                result.push('\n');
            }
        }

        if !missing_vars.is_empty() {
            return Err(format!(
                "Missing environment variables: {}",
                missing_vars.join(", ")
            ));
        }

        Ok(result.trim_end().to_string())
    }

    // custom validation of the values
    fn validate(&self) -> Result<(), String> {
        if self.endpoints.is_empty() {
            return Err("No endpoints configured. Add at least one `[[endpoints]]` entry.".into());
        }
        if self.subgraphs.enabled.is_empty() {
            return Err("No subgraphs enabled. Set `subgraphs.enabled`.".into());
        }
        if self.proxy.max_attempts == 0 {
            return Err("`proxy.max_attempts` must be greater than 0".into());
        }
        if self.service.status_check_max_utilization < 0.0 {
            return Err("`service.status_check_max_utilization` must not be negative".into());
        }

        for (index, endpoint) in self.endpoints.iter().enumerate() {
            if !endpoint.url.contains(SUBGRAPH_ID_PLACEHOLDER) {
                return Err(format!(
                    "`endpoints[{index}].url` must contain the `{SUBGRAPH_ID_PLACEHOLDER}` placeholder"
                ));
            }
            if !(0.0..=1.0).contains(&endpoint.utilization_preference) {
                return Err(format!(
                    "`endpoints[{index}].utilization_preference` must be between 0 and 1"
                ));
            }
            let RateLimitConfig {
                requests_per_interval,
                interval_ms,
                burst_capacity,
            } = &endpoint.rate_limit;
            if *requests_per_interval == 0 || interval_ms.is_zero() || *burst_capacity == 0 {
                return Err(format!(
                    "`endpoints[{index}].rate_limit` values must all be greater than 0"
                ));
            }
            if endpoint.provider == ProviderKind::Graph && endpoint.status_url.is_none() {
                return Err(format!(
                    "`endpoints[{index}]` uses the `graph` provider and requires a `status_url`"
                ));
            }
            for subgraph in endpoint.served_subgraphs() {
                if !self.subgraphs.enabled.iter().any(|s| s == subgraph) {
                    tracing::warn!(
                        "`endpoints[{index}]` maps subgraph `{subgraph}` which is not enabled. \
                        It will not be served."
                    );
                }
                if endpoint.query_url(subgraph).is_none() {
                    return Err(format!(
                        "`endpoints[{index}]` produces an invalid URL for subgraph `{subgraph}`"
                    ));
                }
            }
        }

        for subgraph in &self.subgraphs.enabled {
            if !self.endpoints.iter().any(|e| e.serves(subgraph)) {
                return Err(format!(
                    "Subgraph `{subgraph}` is enabled but no endpoint serves it"
                ));
            }
        }

        if self.chains.is_empty() {
            tracing::warn!(
                "No `chains` configured. Endpoints can never be considered in sync \
                without a chain head source."
            );
        }

        Ok(())
    }
}

#[serde_as]
#[derive(Debug, Deserialize, Clone)]
#[cfg_attr(test, derive(PartialEq))]
pub struct ServiceConfig {
    pub host_and_port: SocketAddr,
    /// Accept responses from endpoints that are not in sync with the chain
    pub allow_unsyncd: bool,
    /// Background status checks only run for endpoints at or below this utilization
    pub status_check_max_utilization: f64,
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub request_timeout_secs: Duration,
}

#[derive(Debug, Deserialize, Clone)]
#[cfg_attr(test, derive(PartialEq))]
pub struct MetricsConfig {
    pub port: u16,
}

impl MetricsConfig {
    pub fn get_socket_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(0, 0, 0, 0), self.port))
    }
}

#[serde_as]
#[derive(Debug, Deserialize, Clone)]
#[cfg_attr(test, derive(PartialEq))]
pub struct ProxyConfig {
    /// Upper bound on backend calls made for a single request
    pub max_attempts: usize,
    /// Pause applied once every eligible endpoint has been tried
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub retry_delay_ms: Duration,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub chain_head_ttl_ms: Duration,
}

#[derive(Debug, Deserialize, Clone)]
#[cfg_attr(test, derive(PartialEq))]
pub struct SubgraphsConfig {
    pub enabled: Vec<String>,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Alchemy,
    Graph,
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Alchemy => f.write_str("alchemy"),
            Self::Graph => f.write_str("graph"),
        }
    }
}

/// Whether an endpoint's rate limit is shared by all of its subgraphs or
/// applied to each subgraph separately.
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum RateLimitScope {
    #[default]
    Shared,
    PerSubgraph,
}

#[serde_as]
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub requests_per_interval: u32,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub interval_ms: Duration,
    pub burst_capacity: u32,
}

#[derive(Debug, Deserialize, Clone)]
#[cfg_attr(test, derive(PartialEq))]
pub struct EndpointConfig {
    /// Query URL template, `<sg-id>` is replaced by the provider-side subgraph id
    pub url: String,
    pub provider: ProviderKind,
    #[serde(default)]
    pub status_url: Option<Url>,
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub rate_limit_scope: RateLimitScope,
    pub utilization_preference: f64,
    /// Subgraph name to provider-side id. Subgraphs missing here, or mapped to
    /// an empty id, are not served by this endpoint.
    #[serde(default)]
    pub subgraph_ids: BTreeMap<String, String>,
}

impl EndpointConfig {
    pub fn serves(&self, subgraph: &str) -> bool {
        self.subgraph_ids
            .get(subgraph)
            .is_some_and(|id| !id.is_empty())
    }

    pub fn served_subgraphs(&self) -> impl Iterator<Item = &str> {
        self.subgraph_ids
            .iter()
            .filter(|(_, id)| !id.is_empty())
            .map(|(name, _)| name.as_str())
    }

    pub fn query_url(&self, subgraph: &str) -> Option<Url> {
        let id = self.subgraph_ids.get(subgraph).filter(|id| !id.is_empty())?;
        Url::parse(&self.url.replace(SUBGRAPH_ID_PLACEHOLDER, id)).ok()
    }

    /// Where fatal indexing errors for `subgraph` are reported.
    ///
    /// Alchemy exposes status next to the query URL (`/api` becomes `/status`),
    /// the graph provider uses the configured index-node status URL.
    pub fn status_url(&self, subgraph: &str) -> Option<Url> {
        match self.provider {
            ProviderKind::Alchemy => {
                let query_url = self.query_url(subgraph)?;
                Url::parse(&query_url.as_str().replacen("/api", "/status", 1)).ok()
            }
            ProviderKind::Graph => self.status_url.clone(),
        }
    }
}

#[serde_as]
#[derive(Debug, Deserialize, Clone)]
#[cfg_attr(test, derive(PartialEq))]
pub struct NotificationsConfig {
    #[serde(default)]
    pub webhook_urls: Vec<Url>,
    /// Included in every message, e.g. `prod`
    pub environment: String,
    #[serde(default)]
    pub message_prefix: String,
    /// Minimum spacing between non-priority messages
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub min_interval_secs: Duration,
}
