//! Configuration scopes: one record per virtual host plus a default.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use super::record::{LimitsConfig, LimitsRecord};
use super::sampler::LoadSource;
use crate::config::LimitsServiceConfig;
use crate::error::Result;

/// Records for every configured scope.
///
/// The table is built once from configuration. A reload builds a new table
/// rather than merging into the old one.
#[derive(Debug)]
pub struct ScopeTable {
    default: Arc<LimitsRecord>,
    vhosts: HashMap<String, Arc<LimitsRecord>>,
}

/// Serializable view of one scope, used by `--check-config`.
#[derive(Debug, Serialize)]
pub struct ScopeSummary<'a> {
    pub scope: &'a str,
    pub limits: &'a LimitsConfig,
}

impl ScopeTable {
    /// Build all scopes, taking an initial load sample for each.
    pub fn from_config(
        config: &LimitsServiceConfig,
        source: &dyn LoadSource,
        now: u64,
    ) -> Result<Self> {
        let default_limits = config.default_limits()?;
        warn_unenforced("default", &default_limits);
        let default = Arc::new(LimitsRecord::new(default_limits, source, now));

        let mut vhosts = HashMap::with_capacity(config.virtual_hosts.len());
        for vhost in &config.virtual_hosts {
            let limits = vhost.limits()?;
            warn_unenforced(&vhost.name, &limits);
            vhosts.insert(vhost.name.clone(), Arc::new(LimitsRecord::new(limits, source, now)));
        }

        info!(vhost_scopes = vhosts.len(), "Limit scopes loaded");
        Ok(Self { default, vhosts })
    }

    /// A table with only a default scope.
    pub fn single(record: LimitsRecord) -> Self {
        Self {
            default: Arc::new(record),
            vhosts: HashMap::new(),
        }
    }

    /// Add or replace the scope for `vhost`.
    pub fn with_vhost(mut self, vhost: impl Into<String>, record: LimitsRecord) -> Self {
        self.vhosts.insert(vhost.into(), Arc::new(record));
        self
    }

    /// The record governing requests for `vhost`.
    pub fn resolve(&self, vhost: &str) -> Arc<LimitsRecord> {
        self.vhosts
            .get(vhost)
            .cloned()
            .unwrap_or_else(|| self.default.clone())
    }

    /// Summaries of every scope, default first, then vhosts by name.
    pub fn summaries(&self) -> Vec<ScopeSummary<'_>> {
        let mut names: Vec<&String> = self.vhosts.keys().collect();
        names.sort();

        std::iter::once(ScopeSummary {
            scope: "default",
            limits: self.default.config(),
        })
        .chain(names.into_iter().map(|name| ScopeSummary {
            scope: name,
            limits: self.vhosts[name].config(),
        }))
        .collect()
    }
}

fn warn_unenforced(scope: &str, limits: &LimitsConfig) {
    if limits.per_user_limit > 0 {
        warn!(
            scope = scope,
            limit = limits.per_user_limit,
            "LimitMaxConnsPerUid is accepted but not enforced: the census carries no user identifier"
        );
    }
}
