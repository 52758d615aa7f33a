//! Admission service implementation.

use std::sync::Arc;
use tonic::{Request, Response, Status};
use tracing::{debug, instrument, warn};

use super::proto::limits::v1::{
    admission_service_server::AdmissionService, AdmitRequest, AdmitResponse, ReleaseRequest,
    ReleaseResponse, Slot, Verdict as ProtoVerdict,
};

use crate::error::LimitsError;
use crate::limits::{Admission, AdmissionBackend, Decision, RequestContext, Verdict};
use crate::scoreboard::SlotId;

/// Implementation of the `limits.v1.AdmissionService` gRPC interface.
pub struct AdmissionServiceImpl<B: AdmissionBackend> {
    /// The admission backend
    backend: Arc<B>,
}

impl<B: AdmissionBackend> AdmissionServiceImpl<B> {
    /// Create a new AdmissionServiceImpl with the given backend.
    pub fn new(backend: Arc<B>) -> Self {
        Self { backend }
    }
}

#[tonic::async_trait]
impl<B: AdmissionBackend + 'static> AdmissionService for AdmissionServiceImpl<B> {
    /// Decide whether a request may be served.
    ///
    /// Rejections are normal responses carrying a 503 status for the front
    /// end; only malformed requests and a full scoreboard are RPC errors.
    #[instrument(
        skip(self, request),
        fields(
            client = %request.get_ref().client_address,
            vhost = %request.get_ref().virtual_host,
            subrequest = request.get_ref().subrequest
        )
    )]
    async fn admit(
        &self,
        request: Request<AdmitRequest>,
    ) -> Result<Response<AdmitResponse>, Status> {
        let req = request.into_inner();

        if !req.subrequest && req.client_address.is_empty() {
            warn!("Received admission request with empty client address");
            return Err(Status::invalid_argument("client_address is required"));
        }

        let context = RequestContext {
            client_address: req.client_address,
            virtual_host: req.virtual_host,
            top_level: !req.subrequest,
        };

        let admission = self.backend.admit(&context).await.map_err(|e| match e {
            LimitsError::Scoreboard(err) => Status::resource_exhausted(err.to_string()),
            other => Status::internal(other.to_string()),
        })?;

        let response = to_response(&admission);
        debug!(verdict = ?response.verdict(), slot = ?response.slot, "Admission decision made");

        Ok(Response::new(response))
    }

    /// Free the slot held by a finished request.
    async fn release(
        &self,
        request: Request<ReleaseRequest>,
    ) -> Result<Response<ReleaseResponse>, Status> {
        let slot = request
            .into_inner()
            .slot
            .ok_or_else(|| Status::invalid_argument("slot is required"))?;

        let released = self
            .backend
            .release(SlotId {
                server: slot.server,
                thread: slot.thread,
                generation: slot.generation,
            })
            .await;

        if !released {
            debug!(
                server = slot.server,
                thread = slot.thread,
                generation = slot.generation,
                "Release of a slot not held"
            );
        }

        Ok(Response::new(ReleaseResponse { released }))
    }
}

fn to_response(admission: &Admission) -> AdmitResponse {
    let mut response = AdmitResponse {
        slot: admission.slot.map(|s| Slot {
            server: s.server,
            thread: s.thread,
            generation: s.generation,
        }),
        ..Default::default()
    };

    let verdict = match admission.decision {
        Decision::NotApplicable => {
            response.set_verdict(ProtoVerdict::NotApplicable);
            return response;
        }
        Decision::Decided(verdict) => verdict,
    };

    let (code, observed, limit) = match verdict {
        Verdict::Admit => (ProtoVerdict::Admit, 0.0, 0.0),
        Verdict::RejectLoad { load, limit } => (ProtoVerdict::RejectLoad, load, limit),
        Verdict::RejectIpLimit { count, limit } => {
            (ProtoVerdict::RejectIpLimit, f64::from(count), f64::from(limit))
        }
        Verdict::RejectVhostLimit { count, limit } => {
            (ProtoVerdict::RejectVhostLimit, f64::from(count), f64::from(limit))
        }
    };

    response.set_verdict(code);
    response.observed = observed;
    response.limit = limit;
    response.http_status = verdict.http_status().map(u32::from).unwrap_or(0);
    if let Some((key, value)) = verdict.annotation() {
        response.env.insert(key.to_string(), value.to_string());
    }

    response
}
