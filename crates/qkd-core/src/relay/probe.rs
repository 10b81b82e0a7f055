use std::time::Duration;

use async_trait::async_trait;
use qkd_exec::run_to_completion;
use qkd_model::Rate;
use tracing::debug;

use crate::error::{CoreError, CoreResult};

/// Source of the local detection rate used during negotiation.
#[async_trait]
pub trait RateProbe: Send + Sync + 'static {
    async fn measure(&self) -> CoreResult<Rate>;
}

/// Runs a one-shot program and reads the rate from the first numeric token of its output.
pub struct CommandRateProbe {
    argv: Vec<String>,
    limit: Duration,
}

impl CommandRateProbe {
    pub fn new(argv: Vec<String>, limit: Duration) -> Self {
        Self { argv, limit }
    }
}

#[async_trait]
impl RateProbe for CommandRateProbe {
    async fn measure(&self) -> CoreResult<Rate> {
        let Some((program, args)) = self.argv.split_first() else {
            return Err(CoreError::Exec(qkd_exec::ExecError::MissingProgram));
        };
        let out = run_to_completion(program, args, self.limit).await?;
        let rate = parse_rate(&out).ok_or_else(|| CoreError::BadOutput {
            program: program.clone(),
            output: out.trim().to_string(),
        })?;
        debug!(target: "qkd.core.relay", rate, "local rate measured");
        Ok(rate)
    }
}

fn parse_rate(out: &str) -> Option<Rate> {
    out.split_whitespace()
        .find_map(|tok| tok.parse::<f64>().ok())
        .filter(|r| r.is_finite() && *r >= 0.0)
        .map(|r| r.round() as Rate)
}
