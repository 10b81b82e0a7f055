use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use qkd_exec::LineWriter;
use qkd_model::{ConnectionStatus, LinkEvent, Message, NegotiationState, Role};
use tokio::{
    io::AsyncWrite,
    sync::{mpsc, watch},
    time::timeout,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::{probe::RateProbe, taps::RelayTaps};
use crate::{
    error::{CoreError, CoreResult},
    negotiation::{Negotiator, Step},
};

/// Outbound half of the messaging channel.
#[async_trait]
pub trait MessageSink: Send + 'static {
    async fn send(&mut self, msg: &Message) -> CoreResult<()>;
}

#[async_trait]
impl<W> MessageSink for LineWriter<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    async fn send(&mut self, msg: &Message) -> CoreResult<()> {
        self.send_line(&msg.to_string()).await?;
        Ok(())
    }
}

/// Link state owned by the dispatcher.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStatus {
    pub connection: ConnectionStatus,
    pub negotiation: NegotiationState,
    pub role: Role,
    /// Incremented whenever a negotiation ends, successfully or not.
    pub round: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RelayInput {
    Partner(Message),
    Connection(ConnectionStatus),
    Send(Message),
    Negotiate,
    ResetNegotiation,
}

/// Single owner of the negotiator and the outbound message channel.
pub struct Dispatcher {
    negotiator: Negotiator,
    sink: Box<dyn MessageSink>,
    probe: Arc<dyn RateProbe>,
    status: watch::Sender<RelayStatus>,
    events: mpsc::UnboundedSender<LinkEvent>,
}

impl Dispatcher {
    pub fn new(
        sink: Box<dyn MessageSink>,
        probe: Arc<dyn RateProbe>,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> (Self, watch::Receiver<RelayStatus>) {
        let (status, rx) = watch::channel(RelayStatus::default());
        (
            Self {
                negotiator: Negotiator::new(),
                sink,
                probe,
                status,
                events,
            },
            rx,
        )
    }

    pub async fn run(mut self, mut inputs: mpsc::UnboundedReceiver<RelayInput>, cancel: CancellationToken) {
        loop {
            let input = tokio::select! {
                _ = cancel.cancelled() => break,
                input = inputs.recv() => match input {
                    Some(input) => input,
                    None => break,
                },
            };
            self.handle(input).await;
        }
        debug!(target: "qkd.core.relay", "dispatcher stopped");
    }

    async fn handle(&mut self, input: RelayInput) {
        match input {
            RelayInput::Connection(status) => self.on_connection(status),
            RelayInput::Partner(msg) if msg.is_negotiation() => self.on_negotiation(msg).await,
            RelayInput::Partner(msg) => {
                trace!(target: "qkd.core.relay", tag = msg.tag(), "message from partner");
                self.emit(LinkEvent::Message(msg));
            }
            RelayInput::Send(msg) => self.send(&msg).await,
            RelayInput::Negotiate => match self.probe.measure().await {
                Ok(rate) => {
                    let ne1 = self.negotiator.begin(rate);
                    self.publish(false);
                    self.send(&ne1).await;
                }
                Err(e) => self.mismatch(format!("rate probe failed: {e}")),
            },
            RelayInput::ResetNegotiation => {
                self.negotiator.reset();
                self.publish(false);
            }
        }
    }

    fn on_connection(&mut self, connection: ConnectionStatus) {
        let changed = self.status.send_if_modified(|s| {
            if s.connection == connection {
                return false;
            }
            s.connection = connection;
            true
        });
        if !changed {
            return;
        }
        info!(target: "qkd.core.relay", connected = connection.is_connected(), "partner connection changed");
        if !connection.is_connected() {
            self.negotiator.reset();
            self.publish(false);
        }
        self.emit(LinkEvent::ConnectionChanged(connection));
    }

    async fn on_negotiation(&mut self, msg: Message) {
        let step = match msg {
            Message::Ne1 { rate } => {
                let local = match self.negotiator.pending_rate() {
                    Some(local) => local,
                    None => match self.probe.measure().await {
                        Ok(local) => local,
                        Err(e) => return self.mismatch(format!("rate probe failed: {e}")),
                    },
                };
                self.negotiator.on_ne1(local, rate)
            }
            Message::Ne2 { rate, echo } => self.negotiator.on_ne2(rate, echo),
            Message::Ne3 { rate, echo } => self.negotiator.on_ne3(rate, echo),
            _ => return,
        };

        match step {
            Step::Reply(reply) => {
                self.publish(false);
                self.send(&reply).await;
            }
            Step::ReplyAndFinish(reply, role) => {
                self.send(&reply).await;
                self.finish(role);
            }
            Step::Finished(role) => self.finish(role),
            Step::Mismatch(reason) => self.mismatch(reason),
        }
    }

    fn finish(&mut self, role: Role) {
        info!(target: "qkd.core.relay", role = role.as_str(), "negotiation finished");
        self.publish(true);
        self.emit(LinkEvent::NegotiationFinished { role });
    }

    fn mismatch(&mut self, reason: String) {
        warn!(target: "qkd.core.relay", %reason, "negotiation reset");
        self.negotiator.reset();
        self.publish(true);
        self.emit(LinkEvent::NegotiationMismatch { reason });
    }

    async fn send(&mut self, msg: &Message) {
        trace!(target: "qkd.core.relay", tag = msg.tag(), "message to partner");
        if let Err(e) = self.sink.send(msg).await {
            warn!(target: "qkd.core.relay", tag = msg.tag(), error = %e, "send failed");
        }
    }

    fn publish(&self, round_ended: bool) {
        let (negotiation, role) = (self.negotiator.state(), self.negotiator.role());
        self.status.send_modify(|s| {
            s.negotiation = negotiation;
            s.role = role;
            if round_ended {
                s.round += 1;
            }
        });
    }

    fn emit(&self, event: LinkEvent) {
        if self.events.send(event).is_err() {
            trace!(target: "qkd.core.relay", "event receiver gone");
        }
    }
}

/// Cloneable front door to a running relay.
#[derive(Clone)]
pub struct RelayHandle {
    inputs: mpsc::UnboundedSender<RelayInput>,
    status: watch::Receiver<RelayStatus>,
    taps: RelayTaps,
}

impl RelayHandle {
    pub fn new(
        inputs: mpsc::UnboundedSender<RelayInput>,
        status: watch::Receiver<RelayStatus>,
        taps: RelayTaps,
    ) -> Self {
        Self {
            inputs,
            status,
            taps,
        }
    }

    pub fn status(&self) -> RelayStatus {
        *self.status.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<RelayStatus> {
        self.status.clone()
    }

    pub fn taps(&self) -> &RelayTaps {
        &self.taps
    }

    pub fn send(&self, msg: Message) -> CoreResult<()> {
        self.push(RelayInput::Send(msg))
    }

    pub fn reset_negotiation(&self) -> CoreResult<()> {
        self.push(RelayInput::ResetNegotiation)
    }

    /// Start a negotiation and wait for its outcome.
    pub async fn negotiate(&self, limit: Duration) -> CoreResult<Role> {
        let mut rx = self.status.clone();
        let start = rx.borrow_and_update().round;
        self.push(RelayInput::Negotiate)?;

        let outcome = match timeout(limit, rx.wait_for(|s| s.round > start)).await {
            Ok(Ok(s)) => Ok((s.negotiation, s.role)),
            Ok(Err(_)) => Err(CoreError::ChannelClosed),
            Err(_) => Err(CoreError::NegotiationTimeout(limit.as_millis())),
        };
        match outcome {
            Ok((NegotiationState::Finished, role)) if role.is_determined() => Ok(role),
            Ok(_) => Err(CoreError::NegotiationMismatch(
                "partner rejected the exchanged rates".to_string(),
            )),
            Err(e) => {
                let _ = self.reset_negotiation();
                Err(e)
            }
        }
    }

    pub(crate) fn push(&self, input: RelayInput) -> CoreResult<()> {
        self.inputs.send(input).map_err(|_| CoreError::ChannelClosed)
    }
}
