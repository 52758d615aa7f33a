//! Local admission backed by the in-process scoreboard.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, trace};

use super::backend::{Admission, AdmissionBackend};
use super::engine::{AdmissionEngine, Decision, RequestContext};
use super::sampler::{Clock, SystemClock};
use super::scopes::ScopeTable;
use crate::error::Result;
use crate::scoreboard::{Scoreboard, SlotId};

/// Admission control for requests served by this host.
///
/// Each admitted request occupies a scoreboard slot, so it is counted by
/// every later decision until it is released.
pub struct LocalAdmission {
    engine: AdmissionEngine,
    scoreboard: Arc<Scoreboard>,
    scopes: RwLock<Arc<ScopeTable>>,
    clock: Arc<dyn Clock>,
}

impl LocalAdmission {
    pub fn new(engine: AdmissionEngine, scoreboard: Arc<Scoreboard>, scopes: ScopeTable) -> Self {
        Self::with_clock(engine, scoreboard, scopes, Arc::new(SystemClock))
    }

    pub fn with_clock(
        engine: AdmissionEngine,
        scoreboard: Arc<Scoreboard>,
        scopes: ScopeTable,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            engine,
            scoreboard,
            scopes: RwLock::new(Arc::new(scopes)),
            clock,
        }
    }

    /// Swap in a freshly built scope table.
    ///
    /// Requests already being decided finish against the old table.
    pub fn replace_scopes(&self, scopes: ScopeTable) {
        let mut current = self.scopes.write();
        *current = Arc::new(scopes);
    }

    /// The current scope table.
    pub fn scopes(&self) -> Arc<ScopeTable> {
        self.scopes.read().clone()
    }

    pub fn engine(&self) -> &AdmissionEngine {
        &self.engine
    }

    pub fn scoreboard(&self) -> &Arc<Scoreboard> {
        &self.scoreboard
    }

    /// Decide on a request, holding a slot for it if it is admitted.
    pub fn check(&self, request: &RequestContext) -> Result<Admission> {
        if !request.top_level {
            trace!(client = %request.client_address, "Declining sub-request");
            return Ok(Admission {
                decision: Decision::NotApplicable,
                slot: None,
            });
        }

        let record = self.scopes().resolve(&request.virtual_host);

        // The request counts itself, so it goes on the board before the scan
        let slot = self
            .scoreboard
            .occupy(&request.client_address, &request.virtual_host)?;

        let decision = self
            .engine
            .decide(&record, request, self.scoreboard.as_ref(), self.clock.now());

        if decision.is_rejected() {
            self.scoreboard.release(slot);
            return Ok(Admission { decision, slot: None });
        }

        debug!(client = %request.client_address, slot = %slot, "Request admitted");
        Ok(Admission {
            decision,
            slot: Some(slot),
        })
    }
}

#[async_trait]
impl AdmissionBackend for LocalAdmission {
    async fn admit(&self, request: &RequestContext) -> Result<Admission> {
        self.check(request)
    }

    async fn release(&self, slot: SlotId) -> bool {
        self.scoreboard.release(slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LimitsError;
    use crate::limits::engine::Verdict;
    use crate::limits::record::{LimitsConfig, LimitsRecord, LoadSample};
    use crate::limits::sampler::{LoadError, LoadSource};
    use crate::scoreboard::{ScoreboardConfig, ScoreboardError};

    struct FixedLoad(f64);

    impl LoadSource for FixedLoad {
        fn one_minute(&self) -> std::result::Result<f64, LoadError> {
            Ok(self.0)
        }
    }

    struct FixedClock(u64);

    impl Clock for FixedClock {
        fn now(&self) -> u64 {
            self.0
        }
    }

    fn record(config: LimitsConfig) -> LimitsRecord {
        LimitsRecord::with_sample(config, LoadSample { value: 0.2, sampled_at: 100 })
    }

    fn admission(scopes: ScopeTable, slots: u32) -> LocalAdmission {
        let scoreboard = Scoreboard::new(ScoreboardConfig {
            server_limit: 1,
            thread_limit: slots,
            ..ScoreboardConfig::default()
        })
        .unwrap();
        LocalAdmission::with_clock(
            AdmissionEngine::new(Arc::new(FixedLoad(0.2))),
            Arc::new(scoreboard),
            scopes,
            Arc::new(FixedClock(101)),
        )
    }

    fn per_ip(limit: u32) -> ScopeTable {
        ScopeTable::single(record(LimitsConfig {
            per_ip_limit: limit,
            ..LimitsConfig::default()
        }))
    }

    #[tokio::test]
    async fn test_admitted_request_holds_slot() {
        let admission = admission(per_ip(2), 8);
        let request = RequestContext::new("10.0.0.5", "www.example.com");

        let result = admission.admit(&request).await.unwrap();

        assert_eq!(result.decision, Decision::Decided(Verdict::Admit));
        assert!(result.slot.is_some());
        assert_eq!(admission.scoreboard().busy(), 1);
    }

    #[tokio::test]
    async fn test_request_counts_itself() {
        let admission = admission(per_ip(2), 8);
        let request = RequestContext::new("10.0.0.5", "www.example.com");

        admission.admit(&request).await.unwrap();
        admission.admit(&request).await.unwrap();
        let third = admission.admit(&request).await.unwrap();

        assert_eq!(
            third.decision,
            Decision::Decided(Verdict::RejectIpLimit { count: 3, limit: 2 })
        );
        assert_eq!(third.slot, None);
        // The rejected request gave its slot back
        assert_eq!(admission.scoreboard().busy(), 2);

        // Other clients are unaffected
        let other = RequestContext::new("10.0.0.6", "www.example.com");
        let result = admission.admit(&other).await.unwrap();
        assert_eq!(result.decision, Decision::Decided(Verdict::Admit));
    }

    #[tokio::test]
    async fn test_release_makes_room() {
        let admission = admission(per_ip(1), 8);
        let request = RequestContext::new("10.0.0.5", "www.example.com");

        let first = admission.admit(&request).await.unwrap();
        assert!(admission.admit(&request).await.unwrap().decision.is_rejected());

        assert!(admission.release(first.slot.unwrap()).await);
        let again = admission.admit(&request).await.unwrap();
        assert_eq!(again.decision, Decision::Decided(Verdict::Admit));
    }

    #[tokio::test]
    async fn test_late_release_does_not_free_reused_slot() {
        let admission = admission(per_ip(1), 4);
        let a = RequestContext::new("10.0.0.1", "www.example.com");
        let b = RequestContext::new("10.0.0.2", "www.example.com");

        let first = admission.admit(&a).await.unwrap().slot.unwrap();
        assert!(admission.release(first).await);

        let held = admission.admit(&b).await.unwrap().slot.unwrap();
        assert_eq!((held.server, held.thread), (first.server, first.thread));

        // A duplicate release for the earlier request leaves b's slot alone
        assert!(!admission.release(first).await);

        let again = admission.admit(&b).await.unwrap();
        assert_eq!(
            again.decision,
            Decision::Decided(Verdict::RejectIpLimit { count: 2, limit: 1 })
        );
    }

    #[tokio::test]
    async fn test_subrequest_takes_no_slot() {
        let admission = admission(per_ip(1), 8);
        let request = RequestContext::subrequest("10.0.0.5", "www.example.com");

        let result = admission.admit(&request).await.unwrap();

        assert_eq!(result.decision, Decision::NotApplicable);
        assert_eq!(result.slot, None);
        assert_eq!(admission.scoreboard().busy(), 0);
    }

    #[tokio::test]
    async fn test_vhost_scope_applies() {
        let scopes = ScopeTable::single(record(LimitsConfig::default())).with_vhost(
            "busy.example.com",
            record(LimitsConfig {
                per_vhost_limit: 1,
                ..LimitsConfig::default()
            }),
        );
        let admission = admission(scopes, 8);

        let busy = RequestContext::new("10.0.0.1", "busy.example.com");
        admission.admit(&busy).await.unwrap();
        let busy_again = RequestContext::new("10.0.0.2", "busy.example.com");
        let result = admission.admit(&busy_again).await.unwrap();
        assert_eq!(
            result.decision,
            Decision::Decided(Verdict::RejectVhostLimit { count: 2, limit: 1 })
        );

        // The default scope has no limits at all
        let quiet = RequestContext::new("10.0.0.2", "quiet.example.com");
        let result = admission.admit(&quiet).await.unwrap();
        assert_eq!(result.decision, Decision::Decided(Verdict::Admit));
    }

    #[tokio::test]
    async fn test_replace_scopes() {
        let admission = admission(per_ip(1), 8);
        let request = RequestContext::new("10.0.0.5", "www.example.com");
        admission.admit(&request).await.unwrap();
        assert!(admission.admit(&request).await.unwrap().decision.is_rejected());

        admission.replace_scopes(per_ip(5));
        let result = admission.admit(&request).await.unwrap();
        assert_eq!(result.decision, Decision::Decided(Verdict::Admit));
    }

    #[tokio::test]
    async fn test_full_scoreboard_is_an_error() {
        let admission = admission(per_ip(0), 1);
        admission
            .admit(&RequestContext::new("10.0.0.1", "v"))
            .await
            .unwrap();

        let err = admission
            .admit(&RequestContext::new("10.0.0.2", "v"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            LimitsError::Scoreboard(ScoreboardError::Full(1))
        ));
    }
}
