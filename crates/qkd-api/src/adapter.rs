use std::sync::Arc;

use async_trait::async_trait;
use qkd_core::{Controller, StatusBoard};
use qkd_model::{ErrorCorrectionSnapshot, LinkSnapshot, ProcessStateSnapshot};

use crate::error::ApiError;
use crate::handler::ApiHandler;

/// Serves snapshots from the status board and forwards commands to the controller.
pub struct ControllerAdapter {
    controller: Arc<Controller>,
    board: StatusBoard,
}

impl ControllerAdapter {
    pub fn new(controller: Arc<Controller>, board: StatusBoard) -> Self {
        Self { controller, board }
    }
}

#[async_trait]
impl ApiHandler for ControllerAdapter {
    fn processes(&self) -> ProcessStateSnapshot {
        self.board.processes()
    }

    fn link(&self) -> LinkSnapshot {
        self.board.link()
    }

    fn error_correction(&self) -> ErrorCorrectionSnapshot {
        self.board.error_correction()
    }

    async fn start_key_gen(&self) -> Result<(), ApiError> {
        self.controller.start_key_gen().await.map_err(ApiError::from)
    }

    async fn stop_key_gen(&self) -> Result<(), ApiError> {
        self.controller.stop_key_gen().await.map_err(ApiError::from)
    }

    async fn start_service_mode(&self) -> Result<(), ApiError> {
        self.controller.start_service_mode().await.map_err(ApiError::from)
    }
}
