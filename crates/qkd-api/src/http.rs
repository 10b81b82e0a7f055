use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use qkd_model::{ControllerState, ErrorCorrectionSnapshot, LinkSnapshot, ProcessStateSnapshot};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{error::ApiError, handler::ApiHandler};

/// HTTP API service builder.
pub struct HttpApi<H> {
    handler: Arc<H>,
    #[cfg(feature = "metrics")]
    metrics: Option<(qkd_prometheus::LinkMetrics, qkd_core::StatusBoard)>,
}

impl<H> HttpApi<H>
where
    H: ApiHandler,
{
    pub fn new(handler: Arc<H>) -> Self {
        Self {
            handler,
            #[cfg(feature = "metrics")]
            metrics: None,
        }
    }

    /// Also serve `GET /metrics`, refreshed from `board` on every scrape.
    #[cfg(feature = "metrics")]
    pub fn with_metrics(mut self, metrics: qkd_prometheus::LinkMetrics, board: qkd_core::StatusBoard) -> Self {
        self.metrics = Some((metrics, board));
        self
    }

    /// Build axum router with mounted endpoints.
    ///
    /// Routes:
    /// - GET /api/v1/processes - Running flag per subsystem
    /// - GET /api/v1/link - Connection, role, controller state and timing
    /// - GET /api/v1/error-correction - QBER servo and key statistics
    /// - POST /api/v1/keygen/start - Negotiate and start key generation
    /// - POST /api/v1/keygen/stop - Stop key generation on both nodes
    /// - POST /api/v1/service/start - Negotiate and start service mode
    pub fn router(self) -> Router {
        let api = Router::new()
            .route("/api/v1/processes", get(processes::<H>))
            .route("/api/v1/link", get(link::<H>))
            .route("/api/v1/error-correction", get(error_correction::<H>))
            .route("/api/v1/keygen/start", post(start_key_gen::<H>))
            .route("/api/v1/keygen/stop", post(stop_key_gen::<H>))
            .route("/api/v1/service/start", post(start_service_mode::<H>))
            .with_state(self.handler);

        #[cfg(feature = "metrics")]
        if let Some(state) = self.metrics {
            return api.merge(
                Router::new()
                    .route("/metrics", get(metrics))
                    .with_state(Arc::new(state)),
            );
        }
        api
    }
}

// ============================================================================
// Response types
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
struct CommandResponse {
    state: ControllerState,
}

// ============================================================================
// Handlers
// ============================================================================

/// GET /api/v1/processes
async fn processes<H>(State(handler): State<Arc<H>>) -> Json<ProcessStateSnapshot>
where
    H: ApiHandler,
{
    Json(handler.processes())
}

/// GET /api/v1/link
async fn link<H>(State(handler): State<Arc<H>>) -> Json<LinkSnapshot>
where
    H: ApiHandler,
{
    Json(handler.link())
}

/// GET /api/v1/error-correction
async fn error_correction<H>(State(handler): State<Arc<H>>) -> Json<ErrorCorrectionSnapshot>
where
    H: ApiHandler,
{
    Json(handler.error_correction())
}

/// POST /api/v1/keygen/start
async fn start_key_gen<H>(State(handler): State<Arc<H>>) -> Result<impl IntoResponse, ApiError>
where
    H: ApiHandler,
{
    info!(target: "qkd.api.http", "key generation requested");
    handler.start_key_gen().await?;
    Ok((StatusCode::ACCEPTED, Json(command_response(handler.as_ref()))))
}

/// POST /api/v1/keygen/stop
async fn stop_key_gen<H>(State(handler): State<Arc<H>>) -> Result<impl IntoResponse, ApiError>
where
    H: ApiHandler,
{
    info!(target: "qkd.api.http", "stop requested");
    handler.stop_key_gen().await?;
    Ok(Json(command_response(handler.as_ref())))
}

/// POST /api/v1/service/start
async fn start_service_mode<H>(State(handler): State<Arc<H>>) -> Result<impl IntoResponse, ApiError>
where
    H: ApiHandler,
{
    info!(target: "qkd.api.http", "service mode requested");
    handler.start_service_mode().await?;
    Ok((StatusCode::ACCEPTED, Json(command_response(handler.as_ref()))))
}

fn command_response<H: ApiHandler>(handler: &H) -> CommandResponse {
    let state = handler.link().state;
    debug!(target: "qkd.api.http", ?state, "command accepted");
    CommandResponse { state }
}

/// GET /metrics
#[cfg(feature = "metrics")]
async fn metrics(
    State(state): State<Arc<(qkd_prometheus::LinkMetrics, qkd_core::StatusBoard)>>,
) -> Result<impl IntoResponse, ApiError> {
    use qkd_prometheus::{Encoder, TextEncoder};

    let (metrics, board) = state.as_ref();
    metrics.observe(board);
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&metrics.gather(), &mut buffer)
        .map_err(|e| ApiError::Internal(format!("metrics encoding: {e}")))?;
    Ok(([(axum::http::header::CONTENT_TYPE, encoder.format_type().to_string())], buffer))
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use qkd_core::CoreError;
    use qkd_model::{ConnectionStatus, Subsystem};
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::{TcpListener, TcpStream},
    };

    use super::*;

    #[derive(Default)]
    struct FakeHandler {
        link: Mutex<LinkSnapshot>,
    }

    #[async_trait]
    impl ApiHandler for FakeHandler {
        fn processes(&self) -> ProcessStateSnapshot {
            let mut snap = ProcessStateSnapshot::new();
            snap.set(Subsystem::Transfer, true);
            snap
        }

        fn link(&self) -> LinkSnapshot {
            self.link.lock().unwrap().clone()
        }

        fn error_correction(&self) -> ErrorCorrectionSnapshot {
            ErrorCorrectionSnapshot {
                servoed_qber: 0.05,
                ..Default::default()
            }
        }

        async fn start_key_gen(&self) -> Result<(), ApiError> {
            let mut link = self.link.lock().unwrap();
            if !link.connection.is_connected() {
                return Err(CoreError::NotConnected.into());
            }
            link.state = ControllerState::Negotiating;
            Ok(())
        }

        async fn stop_key_gen(&self) -> Result<(), ApiError> {
            self.link.lock().unwrap().state = ControllerState::Communicating;
            Ok(())
        }

        async fn start_service_mode(&self) -> Result<(), ApiError> {
            Err(ApiError::Internal("boom".into()))
        }
    }

    async fn serve(handler: Arc<FakeHandler>) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let router = HttpApi::new(handler).router();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        addr
    }

    /// Minimal HTTP/1.1 exchange; returns (status, body).
    async fn request(addr: std::net::SocketAddr, method: &str, path: &str) -> (u16, String) {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let req = format!("{method} {path} HTTP/1.1\r\nHost: localhost\r\nContent-Length: 0\r\nConnection: close\r\n\r\n");
        stream.write_all(req.as_bytes()).await.unwrap();
        let mut raw = String::new();
        stream.read_to_string(&mut raw).await.unwrap();

        let status = raw.split_whitespace().nth(1).unwrap().parse().unwrap();
        let body = raw.split_once("\r\n\r\n").map(|(_, b)| b.to_string()).unwrap_or_default();
        (status, body)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn snapshots_are_served_as_json() {
        let addr = serve(Arc::new(FakeHandler::default())).await;

        let (status, body) = request(addr, "GET", "/api/v1/processes").await;
        assert_eq!(status, 200);
        assert!(body.contains(r#""transfer":true"#));

        let (status, body) = request(addr, "GET", "/api/v1/error-correction").await;
        assert_eq!(status, 200);
        assert!(body.contains(r#""servoedQber":0.05"#));

        let (status, body) = request(addr, "GET", "/api/v1/link").await;
        assert_eq!(status, 200);
        assert!(body.contains(r#""state":"idle""#));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn commands_report_controller_state_or_errors() {
        let handler = Arc::new(FakeHandler::default());
        let addr = serve(Arc::clone(&handler)).await;

        let (status, body) = request(addr, "POST", "/api/v1/keygen/start").await;
        assert_eq!(status, 409);
        assert!(body.contains("not connected"));

        handler.link.lock().unwrap().connection = ConnectionStatus::Connected;
        let (status, body) = request(addr, "POST", "/api/v1/keygen/start").await;
        assert_eq!(status, 202);
        assert!(body.contains(r#""state":"negotiating""#));

        let (status, body) = request(addr, "POST", "/api/v1/keygen/stop").await;
        assert_eq!(status, 200);
        assert!(body.contains(r#""state":"communicating""#));

        let (status, _) = request(addr, "POST", "/api/v1/service/start").await;
        assert_eq!(status, 500);

        let (status, _) = request(addr, "GET", "/api/v1/keygen/start").await;
        assert_eq!(status, 405);
    }
}
