// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 shmbus contributors
//
// Broker configuration: pool tiers, access groups, discovery timing, and
// port pool capacities. Parsed from TOML; every field has a default so a
// minimal file only names its pools.

use serde::{Deserialize, Serialize};

use crate::error::SegmentError;

/// One fixed-size pool tier.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PoolEntry {
    /// Block size in bytes (rounded up to 8-byte granularity at layout).
    pub size: u64,
    /// Number of blocks.
    pub count: u32,
    /// Segment this pool is placed in; one shared segment is created per
    /// distinct access group.
    #[serde(default = "default_access_group")]
    pub access_group: String,
}

fn default_access_group() -> String {
    "default".to_owned()
}

/// Everything the broker reads at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Domain name separating unrelated deployments on one machine.
    #[serde(default = "default_domain")]
    pub domain: String,
    pub pools: Vec<PoolEntry>,
    #[serde(default = "default_discovery_interval_ms")]
    pub discovery_interval_ms: u64,
    #[serde(default = "default_keep_alive_threshold_ms")]
    pub keep_alive_threshold_ms: u64,
    #[serde(default = "default_max_publishers")]
    pub max_publishers: u32,
    #[serde(default = "default_max_subscribers")]
    pub max_subscribers: u32,
}

fn default_domain() -> String {
    "default".to_owned()
}
fn default_discovery_interval_ms() -> u64 {
    100
}
fn default_keep_alive_threshold_ms() -> u64 {
    1000
}
fn default_max_publishers() -> u32 {
    64
}
fn default_max_subscribers() -> u32 {
    256
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            domain: default_domain(),
            pools: vec![
                PoolEntry {
                    size: 128,
                    count: 64,
                    access_group: default_access_group(),
                },
                PoolEntry {
                    size: 1024,
                    count: 32,
                    access_group: default_access_group(),
                },
                PoolEntry {
                    size: 16 * 1024,
                    count: 16,
                    access_group: default_access_group(),
                },
            ],
            discovery_interval_ms: default_discovery_interval_ms(),
            keep_alive_threshold_ms: default_keep_alive_threshold_ms(),
            max_publishers: default_max_publishers(),
            max_subscribers: default_max_subscribers(),
        }
    }
}

impl BrokerConfig {
    /// Parse from TOML text.
    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Validate and normalise: no empty pool list, no zero-sized entries,
    /// tiers sorted ascending, same-size tiers within one access group
    /// merged.
    pub fn validate(mut self) -> Result<Self, SegmentError> {
        if self.pools.is_empty() {
            return Err(SegmentError::NoPools);
        }
        for p in &self.pools {
            if p.size == 0 {
                return Err(SegmentError::ZeroSized { what: "block size" });
            }
            if p.count == 0 {
                return Err(SegmentError::ZeroSized { what: "block count" });
            }
        }
        self.pools
            .sort_by(|a, b| (&a.access_group, a.size).cmp(&(&b.access_group, b.size)));
        self.pools.dedup_by(|b, a| {
            if a.access_group == b.access_group && a.size == b.size {
                a.count += b.count;
                true
            } else {
                false
            }
        });
        Ok(self)
    }

    /// Distinct access groups, in pool order.
    pub fn access_groups(&self) -> Vec<String> {
        let mut groups = Vec::new();
        for p in &self.pools {
            if !groups.contains(&p.access_group) {
                groups.push(p.access_group.clone());
            }
        }
        groups
    }

    /// The pool tiers of one access group, ascending by size.
    pub fn pools_of(&self, access_group: &str) -> Vec<&PoolEntry> {
        self.pools
            .iter()
            .filter(|p| p.access_group == access_group)
            .collect()
    }
}
