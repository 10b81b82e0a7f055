//! Network session with the partner node.
//!
//! Wraps the transfer program and multiplexes its channels: partner messages,
//! received-file log, outgoing-file commands and connection status on stdout.
mod dispatch;
pub use dispatch::{Dispatcher, MessageSink, RelayHandle, RelayInput, RelayStatus};
#[cfg(test)]
pub(crate) use dispatch::fixture;

mod probe;
pub use probe::{CommandRateProbe, RateProbe};

mod taps;
pub use taps::RelayTaps;

use std::{sync::Arc, time::Duration};

use qkd_exec::prelude::*;
use qkd_model::{ConnectionStatus, Epoch, LinkConfig, LinkEvent, Message};
use tokio::{
    sync::{Notify, mpsc},
    task::JoinHandle,
    time::sleep,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::{
    error::CoreResult,
    layout::{DataRoot, Fifo, KeyDir},
};

const RESTART_BACKOFF: Duration = Duration::from_secs(2);

pub struct Relay {
    handle: RelayHandle,
    liveness: Liveness,
    channels: Vec<PipeChannel>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Relay {
    /// Open the relay's pipes, start the dispatcher and keep the transfer program running.
    pub async fn start(
        cfg: &LinkConfig,
        layout: &DataRoot,
        probe: Arc<dyn RateProbe>,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> CoreResult<Self> {
        let poll = Duration::from_millis(cfg.health.pipe_poll_ms);
        let cancel = CancellationToken::new();
        let (taps, outgoing) = RelayTaps::new();
        let (inputs, inputs_rx) = mpsc::unbounded_channel();

        let sink = LineWriter::new(open_fifo_writer(&layout.fifo(Fifo::MsgIn))?);
        let (dispatcher, status) = Dispatcher::new(Box::new(sink), probe, events);
        let handle = RelayHandle::new(inputs.clone(), status, taps.clone());

        let mut channels = Vec::new();

        let partner_inputs = inputs.clone();
        channels.push(PipeChannel::read(
            open_fifo_reader(&layout.fifo(Fifo::MsgOut))?,
            "msgout",
            poll,
            Liveness::new(false),
            true,
            move |line| match line.parse::<Message>() {
                Ok(msg) => {
                    let _ = partner_inputs.send(RelayInput::Partner(msg));
                }
                Err(e) => debug!(target: "qkd.core.relay", %line, error = %e, "unparsable partner message"),
            },
        ));

        let received = taps.clone();
        channels.push(PipeChannel::read(
            open_fifo_reader(&layout.fifo(Fifo::TransferLog))?,
            "transferlog",
            poll,
            Liveness::new(false),
            true,
            move |line| match line.parse::<Epoch>() {
                Ok(epoch) => received.publish_received(epoch),
                Err(e) => trace!(target: "qkd.core.relay", %line, error = %e, "ignoring transfer log line"),
            },
        ));

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(dispatcher.run(inputs_rx, cancel.clone())));

        let cmd = LineWriter::new(open_fifo_writer(&layout.fifo(Fifo::TransferCmd))?);
        tasks.push(tokio::spawn(forward_outgoing(outgoing, cmd, cancel.clone())));

        let process = ManagedProcess::new("transfer").with_monitor_config(MonitorConfig {
            grace: Duration::from_millis(cfg.health.monitor_grace_ms),
            interval: Duration::from_millis(cfg.health.monitor_interval_ms),
        });
        let liveness = process.liveness();
        let keeper = TransferKeeper {
            process,
            program: cfg.programs.transfer.clone(),
            args: transfer_args(cfg, layout),
            inputs,
            poll,
            stop_timeout: Duration::from_millis(cfg.health.stop_timeout_ms),
        };
        tasks.push(tokio::spawn(keeper.run(cancel.clone())));

        info!(target: "qkd.core.relay", partner = %cfg.network.target_ip, port = cfg.network.port, "relay started");
        Ok(Self {
            handle,
            liveness,
            channels,
            cancel,
            tasks,
        })
    }

    pub fn handle(&self) -> RelayHandle {
        self.handle.clone()
    }

    /// `true` while the transfer program is expected to run.
    pub fn liveness(&self) -> Liveness {
        self.liveness.clone()
    }

    pub async fn stop(&mut self) {
        self.cancel.cancel();
        for ch in &mut self.channels {
            ch.stop().await;
        }
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
        info!(target: "qkd.core.relay", "relay stopped");
    }
}

/// Restarts the transfer program whenever it exits.
struct TransferKeeper {
    process: ManagedProcess,
    program: String,
    args: Vec<String>,
    inputs: mpsc::UnboundedSender<RelayInput>,
    poll: Duration,
    stop_timeout: Duration,
}

impl TransferKeeper {
    async fn run(mut self, cancel: CancellationToken) {
        loop {
            let exited = Arc::new(Notify::new());
            let notify = Arc::clone(&exited);
            let on_exit_inputs = self.inputs.clone();
            let on_exit: ExitCallback = Arc::new(move |_code| {
                let _ = on_exit_inputs.send(RelayInput::Connection(ConnectionStatus::Disconnected));
                notify.notify_one();
            });

            let spec = ProcessSpec::new(self.program.clone(), self.args.clone())
                .stdin(StdioTarget::Null)
                .stdout(StdioTarget::Piped);
            match self.process.start(spec, Some(on_exit)).await {
                Ok(io) => {
                    let mut stdout = io.stdout.map(|out| {
                        let status_inputs = self.inputs.clone();
                        PipeChannel::read(out, "transfer-stdout", self.poll, self.process.liveness(), false, move |line| {
                            if let Some(status) = parse_connection(line) {
                                let _ = status_inputs.send(RelayInput::Connection(status));
                            }
                        })
                    });
                    let stopping = tokio::select! {
                        _ = cancel.cancelled() => true,
                        _ = exited.notified() => false,
                    };
                    if let Some(ch) = stdout.as_mut() {
                        ch.stop().await;
                    }
                    if stopping {
                        break;
                    }
                    warn!(target: "qkd.core.relay", "transfer program exited; restarting");
                }
                Err(e) => warn!(target: "qkd.core.relay", error = %e, "transfer program failed to start"),
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep(RESTART_BACKOFF) => {}
            }
        }
        self.process.stop(self.stop_timeout).await;
        let _ = self.inputs.send(RelayInput::Connection(ConnectionStatus::Disconnected));
    }
}

async fn forward_outgoing<W>(
    mut outgoing: mpsc::UnboundedReceiver<Epoch>,
    mut writer: LineWriter<W>,
    cancel: CancellationToken,
) where
    W: tokio::io::AsyncWrite + Unpin + Send,
{
    loop {
        let epoch = tokio::select! {
            _ = cancel.cancelled() => break,
            next = outgoing.recv() => match next {
                Some(epoch) => epoch,
                None => break,
            },
        };
        if let Err(e) = writer.send_line(&epoch.to_string()).await {
            warn!(target: "qkd.core.relay", %epoch, error = %e, "could not queue epoch for transfer");
        }
    }
}

fn transfer_args(cfg: &LinkConfig, layout: &DataRoot) -> Vec<String> {
    let path = |p: std::path::PathBuf| p.display().to_string();
    vec![
        "-d".into(),
        path(layout.dir(KeyDir::Send)),
        "-c".into(),
        path(layout.fifo(Fifo::TransferCmd)),
        "-t".into(),
        cfg.network.target_ip.clone(),
        "-p".into(),
        cfg.network.port.to_string(),
        "-D".into(),
        path(layout.dir(KeyDir::Receive)),
        "-l".into(),
        path(layout.fifo(Fifo::TransferLog)),
        "-m".into(),
        path(layout.fifo(Fifo::MsgIn)),
        "-M".into(),
        path(layout.fifo(Fifo::MsgOut)),
        "-e".into(),
        path(layout.fifo(Fifo::EcSend)),
        "-E".into(),
        path(layout.fifo(Fifo::EcReceive)),
        "-k".into(),
    ]
}

/// Connection status announced by the transfer program on stdout.
fn parse_connection(line: &str) -> Option<ConnectionStatus> {
    let line = line.trim().to_ascii_lowercase();
    if line.contains("disconnected") {
        Some(ConnectionStatus::Disconnected)
    } else if line.contains("connected") {
        Some(ConnectionStatus::Connected)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_lines() {
        assert_eq!(parse_connection("connected"), Some(ConnectionStatus::Connected));
        assert_eq!(parse_connection("Disconnected\r"), Some(ConnectionStatus::Disconnected));
        assert_eq!(parse_connection("  connected to 10.0.0.2"), Some(ConnectionStatus::Connected));
        assert_eq!(parse_connection("waiting"), None);
    }

    #[test]
    fn transfer_arguments_point_into_the_data_root() {
        let cfg = LinkConfig::default();
        let layout = DataRoot::new("/q");
        let args = transfer_args(&cfg, &layout);
        let after = |flag: &str| {
            let i = args.iter().position(|a| a == flag).unwrap();
            args[i + 1].clone()
        };
        assert_eq!(after("-m"), "/q/msgin");
        assert_eq!(after("-M"), "/q/msgout");
        assert_eq!(after("-t"), "127.0.0.1");
        assert_eq!(after("-p"), "4852");
    }

    #[tokio::test]
    async fn relay_delivers_partner_messages_and_received_epochs() {
        let root = DataRoot::new(std::env::temp_dir().join(format!("qkd-relay-{}", uuid::Uuid::new_v4())));
        root.prepare().unwrap();

        let mut cfg = LinkConfig::default();
        cfg.programs.transfer = "sh".into();
        cfg.health.pipe_poll_ms = 20;

        let (events_tx, mut events) = mpsc::unbounded_channel();
        let probe: Arc<dyn RateProbe> = Arc::new(CommandRateProbe::new(
            vec!["sh".into(), "-c".into(), "echo 1".into()],
            Duration::from_secs(1),
        ));
        let mut relay = Relay::start(&cfg, &root, probe, events_tx).await.unwrap();
        let handle = relay.handle();
        let first = handle.taps().first_received();

        let mut msgout = LineWriter::new(open_fifo_writer(&root.fifo(Fifo::MsgOut)).unwrap());
        msgout.send_line("st2").await.unwrap();
        let mut log = LineWriter::new(open_fifo_writer(&root.fifo(Fifo::TransferLog)).unwrap());
        log.send_line("0000abcd").await.unwrap();

        let ev = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let Some(LinkEvent::Message(m)) = events.recv().await {
                    break m;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(ev, Message::St2);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(*first.borrow(), Some(Epoch::new(0xabcd)));

        relay.stop().await;
        let _ = std::fs::remove_dir_all(root.root());
    }
}
