//! Wrappers around the external key-generation programs.
//!
//! Each stage owns one [`qkd_exec::ManagedProcess`], the readers on the FIFOs it writes,
//! and the health checks that turn misbehaviour into a restart request.
mod capture;
pub use capture::Capture;

mod chopper;
pub use chopper::{ChopperHigh, ChopperLow};

mod error_correction;
pub use error_correction::ErrorCorrection;

mod health;
pub use health::{Heartbeat, PairRatioMonitor, RestartTrigger, ZeroCountMonitor, spawn_silence_watch};

mod matcher;
pub use matcher::{Matcher, MatcherReport};

mod pipeline;
pub use pipeline::StagePipeline;

mod runtime;
pub use runtime::{StageContext, parse_epoch_count};

mod splicer;
pub use splicer::Splicer;

#[cfg(test)]
pub(crate) mod testing {
    use std::{fs, os::unix::fs::PermissionsExt, path::Path, sync::Arc};

    use qkd_model::{Epoch, LinkConfig, LinkEvent};
    use tokio::sync::mpsc;

    use super::StageContext;
    use crate::{layout::DataRoot, policy::FaultPolicy, relay::RelayTaps, state::StatusBoard};

    pub(crate) struct TestBed {
        pub ctx: StageContext,
        pub events: mpsc::UnboundedReceiver<LinkEvent>,
        pub outgoing: mpsc::UnboundedReceiver<Epoch>,
    }

    impl Drop for TestBed {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(self.ctx.layout.root());
        }
    }

    /// Fresh data root plus a config tuned for fast tests.
    pub(crate) fn test_bed(tune: impl FnOnce(&mut LinkConfig)) -> TestBed {
        let root = DataRoot::new(std::env::temp_dir().join(format!("qkd-stage-{}", uuid::Uuid::new_v4())));
        root.prepare().unwrap();

        let mut cfg = LinkConfig::default();
        cfg.data_root = root.root().to_path_buf();
        cfg.health.pipe_poll_ms = 20;
        cfg.health.monitor_grace_ms = 100;
        cfg.health.monitor_interval_ms = 50;
        cfg.health.stop_timeout_ms = 500;
        cfg.error_correction.enabled = false;
        for program in [
            &mut cfg.programs.capture,
            &mut cfg.programs.chopper_low,
            &mut cfg.programs.chopper_high,
            &mut cfg.programs.splicer,
            &mut cfg.programs.matcher,
            &mut cfg.programs.error_correction,
        ] {
            *program = script(root.root(), "idle", "exec sleep 30");
        }
        tune(&mut cfg);

        let (events_tx, events) = mpsc::unbounded_channel();
        let (taps, outgoing) = RelayTaps::new();
        TestBed {
            ctx: StageContext {
                cfg: Arc::new(cfg),
                layout: root,
                events: events_tx,
                taps,
                board: StatusBoard::default(),
                policy: FaultPolicy::default(),
            },
            events,
            outgoing,
        }
    }

    /// Executable shell script; `$log` holds the value of the `-l` argument.
    pub(crate) fn script(dir: &Path, name: &str, body: &str) -> String {
        let path = dir.join(format!("{name}.sh"));
        let text = format!(
            "#!/bin/sh\nwhile [ $# -gt 0 ]; do\n  if [ \"$1\" = \"-l\" ]; then log=\"$2\"; fi\n  shift\ndone\n{body}\n"
        );
        fs::write(&path, text).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path.display().to_string()
    }
}
