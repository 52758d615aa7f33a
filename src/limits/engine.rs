//! The admission decision engine.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, info};

use super::census::{Census, CensusEntry};
use super::record::LimitsRecord;
use super::sampler::LoadSource;

/// Status code returned for every rejected request.
pub const SERVICE_UNAVAILABLE: u16 = 503;

/// Environment key set on rejected requests.
pub const LIMITED_ENV_KEY: &str = "LIMITED";

/// Value stored under [`LIMITED_ENV_KEY`].
pub const LIMITED_ENV_VALUE: &str = "1";

/// The request being considered for admission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    /// Address of the requesting client
    pub client_address: String,
    /// Canonical name of the target virtual host
    pub virtual_host: String,
    /// False for internally generated sub-requests
    pub top_level: bool,
}

impl RequestContext {
    /// A top-level request.
    pub fn new(client_address: impl Into<String>, virtual_host: impl Into<String>) -> Self {
        Self {
            client_address: client_address.into(),
            virtual_host: virtual_host.into(),
            top_level: true,
        }
    }

    /// A sub-request generated on behalf of another request.
    pub fn subrequest(client_address: impl Into<String>, virtual_host: impl Into<String>) -> Self {
        Self {
            top_level: false,
            ..Self::new(client_address, virtual_host)
        }
    }
}

/// Outcome of an admission check for a top-level request.
///
/// Rejections carry the observed value and the configured threshold.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Verdict {
    Admit,
    RejectLoad { load: f64, limit: f64 },
    RejectIpLimit { count: u32, limit: u32 },
    RejectVhostLimit { count: u32, limit: u32 },
}

impl Verdict {
    pub fn is_rejected(&self) -> bool {
        !matches!(self, Verdict::Admit)
    }

    /// HTTP status the caller should answer with, `None` to pass through.
    pub fn http_status(&self) -> Option<u16> {
        self.is_rejected().then_some(SERVICE_UNAVAILABLE)
    }

    /// Environment annotation the caller should attach to the request.
    pub fn annotation(&self) -> Option<(&'static str, &'static str)> {
        self.is_rejected()
            .then_some((LIMITED_ENV_KEY, LIMITED_ENV_VALUE))
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Admit => write!(f, "admit"),
            Verdict::RejectLoad { load, limit } => {
                write!(f, "current load {:.2} > {:.2}", load, limit)
            }
            Verdict::RejectIpLimit { count, limit } => {
                write!(f, "client exceeded connection limit ({} > {})", count, limit)
            }
            Verdict::RejectVhostLimit { count, limit } => {
                write!(f, "client exceeded vhost connection limit ({} > {})", count, limit)
            }
        }
    }
}

/// Result of running the engine on a request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Decision {
    /// Sub-request; the caller passes it through untouched.
    NotApplicable,
    Decided(Verdict),
}

impl Decision {
    /// The verdict, if the engine reached one.
    pub fn verdict(&self) -> Option<Verdict> {
        match self {
            Decision::NotApplicable => None,
            Decision::Decided(verdict) => Some(*verdict),
        }
    }

    pub fn is_rejected(&self) -> bool {
        self.verdict().is_some_and(|v| v.is_rejected())
    }
}

/// Decides whether a request may proceed.
///
/// The engine holds no per-request state; everything mutable lives in the
/// record's load cache.
#[derive(Clone)]
pub struct AdmissionEngine {
    load: Arc<dyn LoadSource>,
}

impl AdmissionEngine {
    pub fn new(load: Arc<dyn LoadSource>) -> Self {
        Self { load }
    }

    /// The load source used to refresh samples.
    pub fn load_source(&self) -> &dyn LoadSource {
        self.load.as_ref()
    }

    /// Decide on `request` against the limits in `record`.
    ///
    /// The load check runs first and never looks at the census. The census is
    /// only snapshotted when a connection limit is configured.
    pub fn decide(
        &self,
        record: &LimitsRecord,
        request: &RequestContext,
        census: &dyn Census,
        now: u64,
    ) -> Decision {
        if !request.top_level {
            return Decision::NotApplicable;
        }

        let limits = record.config();
        let sample = record.sample();
        debug!(
            ip = limits.per_ip_limit,
            uid = limits.per_user_limit,
            vhost = limits.per_vhost_limit,
            load = limits.load_limit,
            current_load = sample.value,
            sampled_at = sample.sampled_at,
            "Current limits"
        );

        if limits.limits_load() {
            let load = record.maybe_refresh(self.load.as_ref(), now);
            if load > limits.load_limit {
                let verdict = Verdict::RejectLoad {
                    load,
                    limit: limits.load_limit,
                };
                info!(client = %request.client_address, "Client rejected because {}", verdict);
                return Decision::Decided(verdict);
            }
        }

        if !limits.limits_connections() {
            return Decision::Decided(Verdict::Admit);
        }

        let verdict = scan(record, request, &census.snapshot());
        match verdict {
            Verdict::Admit => {}
            rejected => {
                info!(
                    client = %request.client_address,
                    vhost = %request.virtual_host,
                    "Client rejected because {}",
                    rejected
                );
            }
        }
        Decision::Decided(verdict)
    }
}

/// Count matching census entries, stopping at the first exceeded limit.
///
/// Within one entry the address is checked before the virtual host.
fn scan(record: &LimitsRecord, request: &RequestContext, entries: &[CensusEntry]) -> Verdict {
    let limits = record.config();
    let mut ip_count: u32 = 0;
    let mut vhost_count: u32 = 0;

    for entry in entries {
        if limits.per_ip_limit > 0 && entry.client_address == request.client_address {
            ip_count += 1;
            if ip_count > limits.per_ip_limit {
                return Verdict::RejectIpLimit {
                    count: ip_count,
                    limit: limits.per_ip_limit,
                };
            }
        }

        if limits.per_vhost_limit > 0 && entry.virtual_host == request.virtual_host {
            vhost_count += 1;
            if vhost_count > limits.per_vhost_limit {
                return Verdict::RejectVhostLimit {
                    count: vhost_count,
                    limit: limits.per_vhost_limit,
                };
            }
        }
    }

    debug!(
        client = %request.client_address,
        connections = ip_count,
        vhost_connections = vhost_count,
        "Connection count"
    );
    Verdict::Admit
}
