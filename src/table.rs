use std::collections::HashMap;
use std::net::IpAddr;

use ipnet::IpNet;
use serde::Deserialize;

use crate::error::ConfigError;

/// How a lookup picks between overlapping subnets that all contain the client.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OverlapPolicy {
    /// First containing subnet in the table's iteration order. That order is
    /// unspecified, but it does not change for the lifetime of a table.
    #[default]
    FirstMatch,
    /// Most specific containing subnet wins.
    LongestPrefix,
}

/// Subnet to zone mapping. Read-only once built.
#[derive(Debug, Clone, Default)]
pub struct AffinityTable {
    entries: HashMap<IpNet, String>,
    policy: OverlapPolicy,
}

impl AffinityTable {
    /// Build from `(subnet, zone)` pairs. The first bad entry aborts the whole build.
    pub fn from_pairs<I, S, Z>(pairs: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (S, Z)>,
        S: AsRef<str>,
        Z: Into<String>,
    {
        let mut entries = HashMap::new();
        for (subnet, zone) in pairs {
            let subnet = subnet.as_ref();
            let net: IpNet = subnet.parse().map_err(|source| ConfigError::InvalidSubnet {
                value: subnet.to_string(),
                source,
            })?;
            let zone = zone.into();
            if zone.is_empty() {
                return Err(ConfigError::EmptyZone {
                    subnet: subnet.to_string(),
                });
            }
            // Duplicate subnets: last one configured wins.
            entries.insert(net, zone);
        }
        Ok(Self {
            entries,
            policy: OverlapPolicy::default(),
        })
    }

    pub fn with_overlap_policy(mut self, policy: OverlapPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn overlap_policy(&self) -> OverlapPolicy {
        self.policy
    }

    #[inline]
    pub fn lookup(&self, ip: IpAddr) -> Option<&str> {
        let mut containing = self.entries.iter().filter(|(net, _)| net.contains(&ip));
        let hit = match self.policy {
            OverlapPolicy::FirstMatch => containing.next(),
            OverlapPolicy::LongestPrefix => containing.max_by_key(|(net, _)| net.prefix_len()),
        };
        hit.map(|(_, zone)| zone.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
