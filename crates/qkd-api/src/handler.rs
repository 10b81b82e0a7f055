use async_trait::async_trait;
use qkd_model::{ErrorCorrectionSnapshot, LinkSnapshot, ProcessStateSnapshot};

use crate::error::ApiError;

/// Status-query and operator-command backend of the HTTP API.
///
/// [`ControllerAdapter`](crate::ControllerAdapter) is the production implementation; tests and
/// embedders may supply their own.
#[async_trait]
pub trait ApiHandler: Send + Sync + 'static {
    fn processes(&self) -> ProcessStateSnapshot;

    fn link(&self) -> LinkSnapshot;

    fn error_correction(&self) -> ErrorCorrectionSnapshot;

    /// Negotiate roles with the partner and run the key-generation handshake.
    async fn start_key_gen(&self) -> Result<(), ApiError>;

    async fn stop_key_gen(&self) -> Result<(), ApiError>;

    async fn start_service_mode(&self) -> Result<(), ApiError>;
}
