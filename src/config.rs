use std::fs;
use std::path::Path;

use anyhow::Context;
use anyhow::Result;
use serde::Deserialize;
use tracing::info;

use crate::error::ConfigError;
use crate::rewriter::{AlbNameMatcher, DEFAULT_ALB_REGION};
use crate::table::{AffinityTable, OverlapPolicy};

#[derive(Debug, Clone, Deserialize)]
pub struct AffinityConfig {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub settings: GlobalSettings,
    /// Subnet to availability zone directives, one per entry.
    #[serde(default)]
    pub subnets: Vec<SubnetZone>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GlobalSettings {
    /// UDP listen address. Defaults to an unprivileged port.
    #[serde(default = "default_bind_udp")]
    pub bind_udp: String,
    #[serde(default = "default_bind_tcp")]
    pub bind_tcp: String,
    /// Next hop for every request, tagged or not.
    #[serde(default = "default_upstream")]
    pub upstream: String,
    #[serde(default = "default_upstream_timeout_ms")]
    pub upstream_timeout_ms: u64,
    /// Region segment of the internal ALB names eligible for tagging.
    #[serde(default = "default_alb_region")]
    pub alb_region: String,
    #[serde(default)]
    pub overlap_policy: OverlapPolicy,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            bind_udp: default_bind_udp(),
            bind_tcp: default_bind_tcp(),
            upstream: default_upstream(),
            upstream_timeout_ms: default_upstream_timeout_ms(),
            alb_region: default_alb_region(),
            overlap_policy: OverlapPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubnetZone {
    pub subnet: String,
    /// A missing zone deserializes as empty and is rejected when the table is built.
    #[serde(default)]
    pub zone: String,
}

impl AffinityConfig {
    pub fn build_table(&self) -> Result<AffinityTable, ConfigError> {
        let table = AffinityTable::from_pairs(
            self.subnets
                .iter()
                .map(|entry| (entry.subnet.as_str(), entry.zone.as_str())),
        )?;
        Ok(table.with_overlap_policy(self.settings.overlap_policy))
    }

    pub fn build_matcher(&self) -> Result<AlbNameMatcher, ConfigError> {
        AlbNameMatcher::for_region(&self.settings.alb_region)
    }
}

pub fn load_config(path: &Path) -> Result<AffinityConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("read config file: {}", path.display()))?;
    let cfg: AffinityConfig = serde_json::from_str(&raw)
        .with_context(|| format!("parse config file: {}", path.display()))?;

    if let Some(version) = cfg.version.as_ref() {
        info!(target = "config", version = %version, "config loaded");
    }

    // Reject bad subnets and zones now rather than per request.
    cfg.build_table()
        .with_context(|| format!("validate subnets: {}", path.display()))?;
    cfg.build_matcher()
        .with_context(|| format!("validate alb_region: {}", path.display()))?;

    Ok(cfg)
}

fn default_bind_udp() -> String {
    "0.0.0.0:5353".to_string()
}

fn default_bind_tcp() -> String {
    "0.0.0.0:5353".to_string()
}

fn default_upstream() -> String {
    "1.1.1.1:53".to_string()
}

fn default_upstream_timeout_ms() -> u64 {
    2000
}

fn default_alb_region() -> String {
    DEFAULT_ALB_REGION.to_string()
}
