//! Admission decisions and the state they depend on.

mod admission;
mod backend;
mod census;
mod directive;
mod engine;
mod record;
mod sampler;
mod scopes;

pub use admission::LocalAdmission;
pub use backend::{Admission, AdmissionBackend};
pub use census::{Census, CensusEntry};
pub use directive::{parse_directives, Directive};
pub use engine::{
    AdmissionEngine, Decision, RequestContext, Verdict, LIMITED_ENV_KEY, LIMITED_ENV_VALUE,
    SERVICE_UNAVAILABLE,
};
pub use record::{LimitsConfig, LimitsRecord, LoadSample, DEFAULT_REFRESH_INTERVAL_SECS};
pub use sampler::{Clock, LoadError, LoadSource, SystemClock, SystemLoad};
pub use scopes::{ScopeSummary, ScopeTable};
