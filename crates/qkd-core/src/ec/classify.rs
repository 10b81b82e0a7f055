use std::{path::Path, time::Duration};

use async_trait::async_trait;
use qkd_exec::run_to_completion;

use crate::error::{CoreError, CoreResult};

/// What the diagnosis program reports about one raw key file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawKeyInfo {
    pub file_type: u32,
    pub bits: u64,
}

#[async_trait]
pub trait RawKeyClassifier: Send + Sync + 'static {
    async fn classify(&self, path: &Path) -> CoreResult<RawKeyInfo>;
}

/// Classifies files by running the external diagnosis program on them.
pub struct DiagnosisClassifier {
    program: String,
    limit: Duration,
}

impl DiagnosisClassifier {
    pub fn new(program: impl Into<String>, limit: Duration) -> Self {
        Self {
            program: program.into(),
            limit,
        }
    }
}

#[async_trait]
impl RawKeyClassifier for DiagnosisClassifier {
    async fn classify(&self, path: &Path) -> CoreResult<RawKeyInfo> {
        let args = vec!["-q".to_string(), path.display().to_string()];
        let out = run_to_completion(&self.program, &args, self.limit)
            .await
            .map_err(|e| CoreError::Classification(format!("{}: {e}", path.display())))?;
        parse_diagnosis(&out).ok_or_else(|| CoreError::BadOutput {
            program: self.program.clone(),
            output: out.trim().to_string(),
        })
    }
}

/// Parse `<type> <bits>`.
pub fn parse_diagnosis(out: &str) -> Option<RawKeyInfo> {
    let mut it = out.split_whitespace();
    let file_type = it.next()?.parse().ok()?;
    let bits = it.next()?.parse().ok()?;
    Some(RawKeyInfo { file_type, bits })
}
