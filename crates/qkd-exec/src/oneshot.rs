use std::{process::Stdio, time::Duration};

use tokio::time::timeout;
use tracing::trace;

use crate::{
    error::{ExecError, ExecResult},
    util::cmd_program,
};

/// Run a short-lived program and return its stdout.
///
/// The child is killed if it outlives `limit`.
pub async fn run_to_completion(program: &str, args: &[String], limit: Duration) -> ExecResult<String> {
    if program.trim().is_empty() {
        return Err(ExecError::MissingProgram);
    }
    let mut cmd = cmd_program(program, args);
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    trace!(target: "qkd.exec.oneshot", %program, ?args, "run");
    let child = cmd
        .spawn()
        .map_err(|e| ExecError::Spawn(format!("{program}: {e}")))?;

    let out = match timeout(limit, child.wait_with_output()).await {
        Ok(res) => res?,
        Err(_) => {
            return Err(ExecError::Timeout {
                program: program.to_string(),
                after_ms: limit.as_millis(),
            });
        }
    };

    match out.status.code() {
        Some(0) => Ok(String::from_utf8_lossy(&out.stdout).into_owned()),
        Some(code) => Err(ExecError::NonZeroExit { code }),
        None => Err(ExecError::KilledBySignal),
    }
}
