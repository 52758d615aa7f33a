//! gRPC server implementation.

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;
use tracing::{error, info};

use super::proto::limits::v1::admission_service_server::AdmissionServiceServer;
use super::service::AdmissionServiceImpl;
use crate::error::{LimitsError, Result};
use crate::limits::AdmissionBackend;

/// gRPC server for the admission service.
pub struct GrpcServer<B: AdmissionBackend + 'static> {
    /// Address to bind to
    addr: SocketAddr,
    /// The admission backend
    backend: Arc<B>,
}

impl<B: AdmissionBackend + 'static> GrpcServer<B> {
    /// Create a new gRPC server.
    pub fn new(addr: SocketAddr, backend: Arc<B>) -> Self {
        Self { addr, backend }
    }

    /// Start the gRPC server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send,
    {
        let service = AdmissionServiceImpl::new(self.backend);

        info!(
            addr = %self.addr,
            "Starting gRPC server for AdmissionService with graceful shutdown"
        );

        Server::builder()
            .add_service(AdmissionServiceServer::new(service))
            .serve_with_shutdown(self.addr, signal)
            .await
            .map_err(|e| {
                error!(error = %e, "gRPC server failed");
                LimitsError::Grpc(e)
            })
    }

    /// Serve on an already bound listener until `signal` resolves.
    ///
    /// The configured address is ignored.
    pub async fn serve_listener_with_shutdown<F>(self, listener: TcpListener, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send,
    {
        let service = AdmissionServiceImpl::new(self.backend);
        let local_addr = listener.local_addr()?;

        info!(addr = %local_addr, "Starting gRPC server for AdmissionService on bound listener");

        Server::builder()
            .add_service(AdmissionServiceServer::new(service))
            .serve_with_incoming_shutdown(TcpListenerStream::new(listener), signal)
            .await
            .map_err(|e| {
                error!(error = %e, "gRPC server failed");
                LimitsError::Grpc(e)
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grpc::proto::limits::v1::Verdict;
    use crate::grpc::{AdmissionServiceClient, AdmitRequest, ReleaseRequest};
    use crate::limits::{
        AdmissionEngine, LimitsConfig, LimitsRecord, LoadError, LoadSample, LoadSource,
        LocalAdmission, ScopeTable,
    };
    use crate::scoreboard::{Scoreboard, ScoreboardConfig};
    use tokio::sync::oneshot;

    struct FixedLoad;

    impl LoadSource for FixedLoad {
        fn one_minute(&self) -> std::result::Result<f64, LoadError> {
            Ok(0.0)
        }
    }

    fn backend(per_ip_limit: u32) -> Arc<LocalAdmission> {
        let record = LimitsRecord::with_sample(
            LimitsConfig {
                per_ip_limit,
                ..LimitsConfig::default()
            },
            LoadSample::default(),
        );
        let scoreboard = Scoreboard::new(ScoreboardConfig::default()).unwrap();
        Arc::new(LocalAdmission::new(
            AdmissionEngine::new(Arc::new(FixedLoad)),
            Arc::new(scoreboard),
            ScopeTable::single(record),
        ))
    }

    #[test]
    fn test_server_creation() {
        let addr: SocketAddr = "127.0.0.1:8082".parse().unwrap();
        let _server = GrpcServer::new(addr, backend(0));
    }

    #[tokio::test]
    async fn test_admit_and_release_over_the_wire() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let server = GrpcServer::new(addr, backend(2));
        let handle = tokio::spawn(server.serve_listener_with_shutdown(listener, async move {
            let _ = shutdown_rx.await;
        }));

        let mut client = AdmissionServiceClient::connect(format!("http://{}", addr))
            .await
            .unwrap();

        let request = || AdmitRequest {
            client_address: "10.0.0.5".to_string(),
            virtual_host: "www.example.com".to_string(),
            subrequest: false,
        };

        let first = client.admit(request()).await.unwrap().into_inner();
        let second = client.admit(request()).await.unwrap().into_inner();
        let third = client.admit(request()).await.unwrap().into_inner();

        assert_eq!(first.verdict(), Verdict::Admit);
        assert_eq!(second.verdict(), Verdict::Admit);
        assert_eq!(third.verdict(), Verdict::RejectIpLimit);
        assert_eq!(third.http_status, 503);

        let released = client
            .release(ReleaseRequest { slot: first.slot })
            .await
            .unwrap()
            .into_inner();
        assert!(released.released);

        let fourth = client.admit(request()).await.unwrap().into_inner();
        assert_eq!(fourth.verdict(), Verdict::Admit);

        shutdown_tx.send(()).unwrap();
        handle.await.unwrap().unwrap();
    }
}
