//! Admission backend trait used by the gRPC service.

use async_trait::async_trait;

use super::engine::{Decision, RequestContext};
use crate::error::Result;
use crate::scoreboard::SlotId;

/// Result of an admission request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Admission {
    pub decision: Decision,
    /// Slot held on behalf of an admitted request
    pub slot: Option<SlotId>,
}

/// Trait for admission backends.
///
/// This lets the gRPC service run against the local scoreboard or against a
/// test double.
#[async_trait]
pub trait AdmissionBackend: Send + Sync {
    /// Decide on a request; an admitted top-level request keeps a slot until
    /// it is released.
    async fn admit(&self, request: &RequestContext) -> Result<Admission>;

    /// Release a slot obtained from [`admit`](Self::admit).
    async fn release(&self, slot: SlotId) -> bool;
}
