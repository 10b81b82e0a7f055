//! Top-level link state machine.
//!
//! Events from the relay, the stages and the watchdog arrive on one channel and are handled in order.
//! Operator commands (`start_key_gen`, `stop_key_gen`, `start_service_mode`) share the same state lock.
mod table;
pub use table::{Action, Transition, transition};

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use qkd_model::{
    ConnectionStatus, ControllerState, LinkEvent, Message, NegotiationState, ProcessStateSnapshot, ProtocolMode,
    RestartReason, Role, Subsystem,
};
use tokio::{
    sync::{Mutex, mpsc},
    time::sleep,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::{
    error::{CoreError, CoreResult},
    policy::{FaultKind, FaultPolicy, Reaction},
    relay::RelayHandle,
    state::StatusBoard,
    subscriber::EventBus,
};

const RETRY_BACKOFF: Duration = Duration::from_secs(2);

/// The local key-generation stages as seen by the controller.
#[async_trait]
pub trait Pipeline: Send + Sync + 'static {
    async fn clear_transfer_dirs(&self) -> CoreResult<()>;

    async fn start_low_side(&self, mode: ProtocolMode) -> CoreResult<()>;

    /// Start the high-count side, including epoch synchronization.
    async fn start_high_side(&self, mode: ProtocolMode) -> CoreResult<()>;

    /// Stop every key-generation stage and drain their pipes. Idempotent.
    async fn stop_key_gen(&self);

    /// Interrupt a start that is still in progress.
    fn abort(&self);

    fn processes(&self) -> ProcessStateSnapshot;
}

/// The partner session as seen by the controller.
#[async_trait]
pub trait PartnerLink: Send + Sync + 'static {
    fn send(&self, msg: Message) -> CoreResult<()>;

    fn connection(&self) -> ConnectionStatus;

    fn role(&self) -> Role;

    async fn negotiate(&self, limit: Duration) -> CoreResult<Role>;

    fn reset_negotiation(&self) -> CoreResult<()>;
}

#[async_trait]
impl PartnerLink for RelayHandle {
    fn send(&self, msg: Message) -> CoreResult<()> {
        RelayHandle::send(self, msg)
    }

    fn connection(&self) -> ConnectionStatus {
        self.status().connection
    }

    fn role(&self) -> Role {
        self.status().role
    }

    async fn negotiate(&self, limit: Duration) -> CoreResult<Role> {
        RelayHandle::negotiate(self, limit).await
    }

    fn reset_negotiation(&self) -> CoreResult<()> {
        RelayHandle::reset_negotiation(self)
    }
}

struct Inner {
    state: ControllerState,
    /// Pipeline the operator asked for; `None` after a stop.
    mode: Option<ProtocolMode>,
    restarts: u64,
}

pub struct Controller {
    pipeline: Arc<dyn Pipeline>,
    link: Arc<dyn PartnerLink>,
    policy: FaultPolicy,
    board: StatusBoard,
    bus: Arc<EventBus>,
    events: mpsc::UnboundedSender<LinkEvent>,
    negotiation_timeout: Duration,
    retry_backoff: Duration,
    inner: Mutex<Inner>,
}

impl Controller {
    /// `events` must feed the channel later passed to [`Controller::run`]; failed restarts are retried through it.
    pub fn new(
        pipeline: Arc<dyn Pipeline>,
        link: Arc<dyn PartnerLink>,
        board: StatusBoard,
        bus: Arc<EventBus>,
        events: mpsc::UnboundedSender<LinkEvent>,
        negotiation_timeout: Duration,
    ) -> Self {
        Self {
            pipeline,
            link,
            policy: FaultPolicy::default(),
            board,
            bus,
            events,
            negotiation_timeout,
            retry_backoff: RETRY_BACKOFF,
            inner: Mutex::new(Inner {
                state: ControllerState::Idle,
                mode: None,
                restarts: 0,
            }),
        }
    }

    pub fn with_policy(mut self, policy: FaultPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub async fn state(&self) -> ControllerState {
        self.inner.lock().await.state
    }

    pub async fn restarts(&self) -> u64 {
        self.inner.lock().await.restarts
    }

    pub async fn run(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<LinkEvent>, cancel: CancellationToken) {
        info!(target: "qkd.core.controller", "controller started");
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                next = events.recv() => match next {
                    Some(ev) => ev,
                    None => break,
                },
            };
            self.handle(event).await;
        }
        info!(target: "qkd.core.controller", "controller stopped");
    }

    pub async fn handle(&self, event: LinkEvent) {
        self.bus.publish(&event);
        match event {
            LinkEvent::ConnectionChanged(status) => self.on_connection(status).await,
            LinkEvent::Message(msg) => {
                let mut inner = self.inner.lock().await;
                self.apply(&mut inner, &msg).await;
            }
            LinkEvent::RestartRequested { subsystem, reason } => self.on_restart(subsystem, reason).await,
            LinkEvent::NegotiationFinished { role } => self.board.update_link(|l| {
                l.role = role;
                l.negotiation = NegotiationState::Finished;
            }),
            LinkEvent::NegotiationMismatch { .. } => self.board.update_link(|l| {
                l.role = Role::Undetermined;
                l.negotiation = NegotiationState::NotDone;
            }),
            LinkEvent::StateChanged { .. } | LinkEvent::ProcessEdge { .. } => {}
        }
    }

    pub async fn start_key_gen(&self) -> CoreResult<()> {
        self.start(ProtocolMode::Keygen).await
    }

    pub async fn start_service_mode(&self) -> CoreResult<()> {
        self.start(ProtocolMode::Service).await
    }

    /// Tear down key generation locally and tell the partner to do the same.
    pub async fn stop_key_gen(&self) -> CoreResult<()> {
        self.pipeline.abort();
        let mut inner = self.inner.lock().await;
        self.pipeline.stop_key_gen().await;
        if self.link.connection().is_connected() {
            self.link.send(Message::StopKeyGen)?;
        }
        inner.mode = None;
        if inner.state != ControllerState::Idle {
            self.set_state(&mut inner, ControllerState::Communicating);
        }
        Ok(())
    }

    /// Stop everything before the process exits.
    pub async fn shutdown(&self) {
        self.pipeline.abort();
        let mut inner = self.inner.lock().await;
        self.pipeline.stop_key_gen().await;
        inner.mode = None;
        self.set_state(&mut inner, ControllerState::Idle);
        drop(inner);
        self.bus.shutdown().await;
    }

    async fn start(&self, mode: ProtocolMode) -> CoreResult<()> {
        let mut inner = self.inner.lock().await;
        if !self.link.connection().is_connected() {
            return Err(CoreError::NotConnected);
        }
        if inner.state.is_pipeline_active() || inner.mode.is_some() {
            self.pipeline.stop_key_gen().await;
            self.link.send(Message::StopKeyGen)?;
        }
        if let Err(e) = self.open(&mut inner, mode).await {
            inner.mode = None;
            self.set_state(&mut inner, ControllerState::Communicating);
            return Err(e);
        }
        Ok(())
    }

    /// Negotiate roles and send the opening message of `mode`'s handshake.
    async fn open(&self, inner: &mut Inner, mode: ProtocolMode) -> CoreResult<()> {
        inner.mode = Some(mode);
        self.set_state(inner, ControllerState::Negotiating);
        let role = match self.link.negotiate(self.negotiation_timeout).await {
            Ok(role) => role,
            Err(e) => {
                self.set_state(inner, ControllerState::Communicating);
                return Err(e);
            }
        };
        let session = Uuid::new_v4().to_string();
        info!(target: "qkd.core.controller", role = role.as_str(), ?mode, %session, "link session opened");
        self.board.update_link(|l| {
            l.role = role;
            l.negotiation = NegotiationState::Finished;
            l.session = Some(session);
        });
        match mode {
            ProtocolMode::Keygen => self.link.send(Message::St1)?,
            ProtocolMode::Service => self.apply(inner, &Message::StartServiceMode).await,
        }
        Ok(())
    }

    async fn apply(&self, inner: &mut Inner, msg: &Message) {
        let role = self.link.role();
        let t = transition(inner.state, role, msg);
        if t.actions.is_empty() && t.next == inner.state {
            trace!(target: "qkd.core.controller", tag = msg.tag(), state = ?inner.state, role = role.as_str(), "message ignored");
            return;
        }
        debug!(target: "qkd.core.controller", tag = msg.tag(), actions = ?t.actions, next = ?t.next, "transition");

        for action in t.actions {
            let subsystem = failing_subsystem(&action);
            if let Err(e) = self.execute(inner, action).await {
                match e {
                    CoreError::Cancelled => debug!(target: "qkd.core.controller", "start interrupted"),
                    e => {
                        let reason = match e {
                            CoreError::Sync(s) => RestartReason::SyncFailed(s),
                            other => RestartReason::StartFailed(other.to_string()),
                        };
                        warn!(target: "qkd.core.controller", %subsystem, %reason, "handshake action failed");
                        self.request_restart(subsystem, reason);
                    }
                }
                return;
            }
        }
        self.set_state(inner, t.next);
    }

    async fn execute(&self, inner: &mut Inner, action: Action) -> CoreResult<()> {
        match action {
            Action::ClearTransferDirs => self.pipeline.clear_transfer_dirs().await,
            Action::StartLowSide(mode) => {
                inner.mode = Some(mode);
                self.pipeline.start_low_side(mode).await
            }
            Action::StartHighSide(mode) => {
                inner.mode = Some(mode);
                self.pipeline.start_high_side(mode).await
            }
            Action::StopKeyGen => {
                inner.mode = None;
                self.pipeline.stop_key_gen().await;
                Ok(())
            }
            Action::Send(msg) => self.link.send(msg),
        }
    }

    async fn on_connection(&self, status: ConnectionStatus) {
        self.board.update_link(|l| l.connection = status);
        let mut inner = self.inner.lock().await;
        match status {
            ConnectionStatus::Connected => {
                if inner.state == ControllerState::Idle {
                    self.set_state(&mut inner, ControllerState::Communicating);
                }
            }
            ConnectionStatus::Disconnected => {
                if inner.state == ControllerState::Idle {
                    return;
                }
                if self.policy.reaction(FaultKind::LinkLost) != Reaction::LocalReset {
                    self.pipeline.stop_key_gen().await;
                }
                inner.mode = None;
                self.board.update_link(|l| {
                    l.role = Role::Undetermined;
                    l.negotiation = NegotiationState::NotDone;
                    l.session = None;
                });
                self.set_state(&mut inner, ControllerState::Idle);
            }
        }
    }

    async fn on_restart(&self, subsystem: Subsystem, reason: RestartReason) {
        let mut inner = self.inner.lock().await;
        if inner.mode.is_none() {
            debug!(target: "qkd.core.controller", %subsystem, %reason, "no pipeline requested; restart ignored");
            return;
        }
        match self.policy.reaction_for(&reason) {
            Reaction::LocalReset => {
                info!(target: "qkd.core.controller", %subsystem, %reason, "fault handled by the subsystem")
            }
            Reaction::Teardown => {
                self.pipeline.stop_key_gen().await;
                inner.mode = None;
                self.set_state(&mut inner, ControllerState::Communicating);
            }
            Reaction::LinkRestart => self.restart(&mut inner, subsystem, reason).await,
        }
    }

    /// Stop both sides, renegotiate and rerun the handshake of the current mode.
    async fn restart(&self, inner: &mut Inner, subsystem: Subsystem, reason: RestartReason) {
        let mode = inner.mode.unwrap_or_default();
        inner.restarts += 1;
        warn!(target: "qkd.core.controller", %subsystem, %reason, restarts = inner.restarts, "restarting link");

        self.pipeline.stop_key_gen().await;
        if !self.link.connection().is_connected() {
            inner.mode = None;
            return;
        }
        if let Err(e) = self.link.send(Message::StopKeyGen) {
            warn!(target: "qkd.core.controller", error = %e, "could not tell the partner to stop");
        }
        if let Err(e) = self.link.reset_negotiation() {
            warn!(target: "qkd.core.controller", error = %e, "could not reset negotiation");
        }
        self.set_state(inner, ControllerState::Communicating);

        if let Err(e) = self.open(inner, mode).await {
            warn!(target: "qkd.core.controller", error = %e, backoff_ms = self.retry_backoff.as_millis() as u64, "restart failed; will retry");
            self.schedule_retry(subsystem, RestartReason::StartFailed(e.to_string()));
        }
    }

    fn request_restart(&self, subsystem: Subsystem, reason: RestartReason) {
        let _ = self.events.send(LinkEvent::RestartRequested { subsystem, reason });
    }

    fn schedule_retry(&self, subsystem: Subsystem, reason: RestartReason) {
        let events = self.events.clone();
        let backoff = self.retry_backoff;
        tokio::spawn(async move {
            sleep(backoff).await;
            let _ = events.send(LinkEvent::RestartRequested { subsystem, reason });
        });
    }

    fn set_state(&self, inner: &mut Inner, next: ControllerState) {
        let mode = inner.mode;
        self.board.update_link(|l| {
            l.state = next;
            l.mode = mode;
        });
        if inner.state == next {
            return;
        }
        let from = std::mem::replace(&mut inner.state, next);
        info!(target: "qkd.core.controller", ?from, to = ?next, "state changed");
        self.bus.publish(&LinkEvent::StateChanged { from, to: next });
    }
}

fn failing_subsystem(action: &Action) -> Subsystem {
    match action {
        Action::StartLowSide(_) => Subsystem::ChopperLow,
        Action::StartHighSide(_) => Subsystem::Matcher,
        Action::ClearTransferDirs | Action::StopKeyGen | Action::Send(_) => Subsystem::Transfer,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use super::*;
    use crate::{
        relay::{RelayInput, fixture::{Node, linked}},
        subscriber::Subscribe,
    };

    #[derive(Default)]
    struct FakePipeline {
        calls: StdMutex<Vec<String>>,
        fail_high: StdMutex<Option<CoreError>>,
    }

    impl FakePipeline {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: impl Into<String>) {
            self.calls.lock().unwrap().push(call.into());
        }
    }

    #[async_trait]
    impl Pipeline for FakePipeline {
        async fn clear_transfer_dirs(&self) -> CoreResult<()> {
            self.record("clear");
            Ok(())
        }

        async fn start_low_side(&self, mode: ProtocolMode) -> CoreResult<()> {
            self.record(format!("low:{mode:?}"));
            Ok(())
        }

        async fn start_high_side(&self, mode: ProtocolMode) -> CoreResult<()> {
            self.record(format!("high:{mode:?}"));
            match self.fail_high.lock().unwrap().take() {
                Some(e) => Err(e),
                None => Ok(()),
            }
        }

        async fn stop_key_gen(&self) {
            self.record("stop");
        }

        fn abort(&self) {}

        fn processes(&self) -> ProcessStateSnapshot {
            ProcessStateSnapshot::new()
        }
    }

    struct FakeLink {
        connection: StdMutex<ConnectionStatus>,
        role: StdMutex<Role>,
        sent: StdMutex<Vec<Message>>,
        /// Refuse the next `send`.
        drop_next: StdMutex<bool>,
    }

    impl FakeLink {
        fn new(role: Role) -> Self {
            Self {
                connection: StdMutex::new(ConnectionStatus::Connected),
                role: StdMutex::new(role),
                sent: StdMutex::new(Vec::new()),
                drop_next: StdMutex::new(false),
            }
        }

        fn sent(&self) -> Vec<Message> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PartnerLink for FakeLink {
        fn send(&self, msg: Message) -> CoreResult<()> {
            if std::mem::take(&mut *self.drop_next.lock().unwrap()) {
                return Err(CoreError::ChannelClosed);
            }
            self.sent.lock().unwrap().push(msg);
            Ok(())
        }

        fn connection(&self) -> ConnectionStatus {
            *self.connection.lock().unwrap()
        }

        fn role(&self) -> Role {
            *self.role.lock().unwrap()
        }

        async fn negotiate(&self, limit: Duration) -> CoreResult<Role> {
            let role = self.role();
            if role.is_determined() {
                Ok(role)
            } else {
                Err(CoreError::NegotiationTimeout(limit.as_millis()))
            }
        }

        fn reset_negotiation(&self) -> CoreResult<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct Recorder(StdMutex<Vec<LinkEvent>>);

    #[async_trait]
    impl Subscribe for Recorder {
        async fn on_event(&self, event: &LinkEvent) {
            self.0.lock().unwrap().push(event.clone());
        }

        fn name(&self) -> &'static str {
            "recorder"
        }
    }

    struct Harness {
        controller: Controller,
        pipeline: Arc<FakePipeline>,
        link: Arc<FakeLink>,
        events: mpsc::UnboundedReceiver<LinkEvent>,
        board: StatusBoard,
    }

    async fn harness(role: Role) -> Harness {
        let pipeline = Arc::new(FakePipeline::default());
        let link = Arc::new(FakeLink::new(role));
        let board = StatusBoard::new("test");
        let (tx, events) = mpsc::unbounded_channel();
        let controller = Controller::new(
            pipeline.clone(),
            link.clone(),
            board.clone(),
            Arc::new(EventBus::default()),
            tx,
            Duration::from_millis(100),
        )
        .with_retry_backoff(Duration::from_millis(10));
        controller
            .handle(LinkEvent::ConnectionChanged(ConnectionStatus::Connected))
            .await;
        Harness {
            controller,
            pipeline,
            link,
            events,
            board,
        }
    }

    #[tokio::test]
    async fn connection_drives_idle_and_communicating() {
        let h = harness(Role::LowCountSide).await;
        assert_eq!(h.controller.state().await, ControllerState::Communicating);

        h.controller
            .handle(LinkEvent::ConnectionChanged(ConnectionStatus::Disconnected))
            .await;
        assert_eq!(h.controller.state().await, ControllerState::Idle);
        assert_eq!(h.pipeline.calls(), vec!["stop"]);
        assert_eq!(h.board.link().connection, ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn start_requires_a_connection() {
        let h = harness(Role::LowCountSide).await;
        *h.link.connection.lock().unwrap() = ConnectionStatus::Disconnected;
        assert!(matches!(h.controller.start_key_gen().await, Err(CoreError::NotConnected)));
    }

    #[tokio::test]
    async fn low_initiator_runs_the_handshake() {
        let h = harness(Role::LowCountSide).await;
        h.controller.start_key_gen().await.unwrap();
        assert_eq!(h.link.sent(), vec![Message::St1]);
        assert_eq!(h.controller.state().await, ControllerState::Negotiating);
        assert!(h.board.link().session.is_some());

        h.controller.handle(LinkEvent::Message(Message::St2)).await;
        assert_eq!(h.pipeline.calls(), vec!["clear", "low:Keygen"]);
        assert_eq!(h.link.sent(), vec![Message::St1, Message::St3]);
        assert_eq!(h.controller.state().await, ControllerState::KeyGeneration);
        assert_eq!(h.board.link().mode, Some(ProtocolMode::Keygen));
    }

    #[tokio::test]
    async fn high_responder_starts_on_st3() {
        let h = harness(Role::HighCountSide).await;
        h.controller.handle(LinkEvent::Message(Message::St1)).await;
        assert_eq!(h.link.sent(), vec![Message::St2]);
        assert!(h.pipeline.calls().is_empty());

        h.controller.handle(LinkEvent::Message(Message::St3)).await;
        assert_eq!(h.pipeline.calls(), vec!["high:Keygen"]);
        assert_eq!(h.controller.state().await, ControllerState::KeyGeneration);
    }

    #[tokio::test]
    async fn subsystem_fault_restarts_the_link() {
        let h = harness(Role::HighCountSide).await;
        h.controller.handle(LinkEvent::Message(Message::St3)).await;

        h.controller
            .handle(LinkEvent::RestartRequested {
                subsystem: Subsystem::Matcher,
                reason: RestartReason::ProcessExited { code: Some(1) },
            })
            .await;

        assert_eq!(h.pipeline.calls(), vec!["high:Keygen", "stop"]);
        assert_eq!(h.link.sent(), vec![Message::StopKeyGen, Message::St1]);
        assert_eq!(h.controller.restarts().await, 1);
        assert_eq!(h.controller.state().await, ControllerState::Negotiating);
    }

    #[tokio::test]
    async fn restart_survives_an_undeliverable_stop() {
        let h = harness(Role::HighCountSide).await;
        h.controller.handle(LinkEvent::Message(Message::St3)).await;
        *h.link.drop_next.lock().unwrap() = true;

        h.controller
            .handle(LinkEvent::RestartRequested {
                subsystem: Subsystem::Matcher,
                reason: RestartReason::ProcessExited { code: Some(1) },
            })
            .await;

        assert_eq!(h.link.sent(), vec![Message::St1]);
        assert_eq!(h.controller.restarts().await, 1);
        assert_eq!(h.controller.state().await, ControllerState::Negotiating);
    }

    #[tokio::test]
    async fn restart_without_requested_pipeline_is_ignored() {
        let h = harness(Role::LowCountSide).await;
        h.controller
            .handle(LinkEvent::RestartRequested {
                subsystem: Subsystem::Capture,
                reason: RestartReason::Silence { seconds: 40 },
            })
            .await;
        assert!(h.pipeline.calls().is_empty());
        assert_eq!(h.controller.restarts().await, 0);
    }

    #[tokio::test]
    async fn local_reset_policy_keeps_the_pipeline() {
        let mut h = harness(Role::HighCountSide).await;
        h.controller = h
            .controller
            .with_policy(FaultPolicy::default().with(FaultKind::Silence, Reaction::LocalReset));
        h.controller.handle(LinkEvent::Message(Message::St3)).await;
        h.controller
            .handle(LinkEvent::RestartRequested {
                subsystem: Subsystem::Matcher,
                reason: RestartReason::Silence { seconds: 40 },
            })
            .await;
        assert_eq!(h.pipeline.calls(), vec!["high:Keygen"]);
        assert_eq!(h.controller.state().await, ControllerState::KeyGeneration);
    }

    #[tokio::test]
    async fn sync_failure_requests_a_restart() {
        let mut h = harness(Role::HighCountSide).await;
        *h.pipeline.fail_high.lock().unwrap() = Some(CoreError::Sync("no overlap".into()));

        h.controller.handle(LinkEvent::Message(Message::St3)).await;
        assert_eq!(h.controller.state().await, ControllerState::Communicating);

        let ev = h.events.try_recv().unwrap();
        assert_eq!(
            ev,
            LinkEvent::RestartRequested {
                subsystem: Subsystem::Matcher,
                reason: RestartReason::SyncFailed("no overlap".into()),
            }
        );

        h.controller.handle(ev).await;
        assert_eq!(h.link.sent(), vec![Message::StopKeyGen, Message::St1]);
    }

    #[tokio::test]
    async fn failed_renegotiation_is_retried() {
        let mut h = harness(Role::HighCountSide).await;
        h.controller.handle(LinkEvent::Message(Message::St3)).await;
        *h.link.role.lock().unwrap() = Role::Undetermined;

        h.controller
            .handle(LinkEvent::RestartRequested {
                subsystem: Subsystem::Capture,
                reason: RestartReason::ZeroCounts { epochs: 5 },
            })
            .await;
        assert_eq!(h.controller.state().await, ControllerState::Communicating);

        let retry = tokio::time::timeout(Duration::from_secs(1), h.events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            retry,
            LinkEvent::RestartRequested {
                reason: RestartReason::StartFailed(_),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn stop_tears_down_and_tells_the_partner() {
        let h = harness(Role::LowCountSide).await;
        h.controller.handle(LinkEvent::Message(Message::St1)).await;
        assert_eq!(h.controller.state().await, ControllerState::KeyGeneration);

        h.controller.stop_key_gen().await.unwrap();
        assert_eq!(h.controller.state().await, ControllerState::Communicating);
        assert_eq!(h.pipeline.calls().last().map(String::as_str), Some("stop"));
        assert_eq!(h.link.sent().last(), Some(&Message::StopKeyGen));
        assert_eq!(h.board.link().mode, None);

        // A late fault report no longer restarts anything.
        h.controller
            .handle(LinkEvent::RestartRequested {
                subsystem: Subsystem::Splicer,
                reason: RestartReason::ProcessExited { code: None },
            })
            .await;
        assert_eq!(h.controller.restarts().await, 0);
    }

    #[tokio::test]
    async fn service_mode_on_the_low_side() {
        let h = harness(Role::LowCountSide).await;
        h.controller.start_service_mode().await.unwrap();
        assert_eq!(h.pipeline.calls(), vec!["clear", "low:Service"]);
        assert_eq!(h.link.sent(), vec![Message::StartServiceModeStep2]);
        assert_eq!(h.controller.state().await, ControllerState::ServiceMode);
    }

    #[tokio::test]
    async fn service_mode_on_the_high_side_bounces_the_request() {
        let h = harness(Role::HighCountSide).await;
        h.controller.start_service_mode().await.unwrap();
        assert_eq!(h.link.sent(), vec![Message::StartServiceMode]);
        assert_eq!(h.controller.state().await, ControllerState::Negotiating);

        h.controller
            .handle(LinkEvent::Message(Message::StartServiceModeStep2))
            .await;
        assert_eq!(h.pipeline.calls(), vec!["high:Service"]);
        assert_eq!(h.controller.state().await, ControllerState::ServiceMode);
    }

    #[tokio::test]
    async fn state_changes_reach_subscribers() {
        let rec = Arc::new(Recorder::default());
        let bus = Arc::new(EventBus::new(vec![rec.clone() as Arc<dyn Subscribe>]));
        let (tx, _rx) = mpsc::unbounded_channel();
        let controller = Controller::new(
            Arc::new(FakePipeline::default()),
            Arc::new(FakeLink::new(Role::LowCountSide)),
            StatusBoard::default(),
            bus,
            tx,
            Duration::from_millis(100),
        );

        controller
            .handle(LinkEvent::ConnectionChanged(ConnectionStatus::Connected))
            .await;
        controller.shutdown().await;

        let seen = rec.0.lock().unwrap();
        assert!(seen.contains(&LinkEvent::StateChanged {
            from: ControllerState::Idle,
            to: ControllerState::Communicating,
        }));
        assert!(seen.contains(&LinkEvent::ConnectionChanged(ConnectionStatus::Connected)));
    }

    /// Pipeline of one node in a two-node run; calls land in a log shared by both nodes.
    struct SharedPipeline {
        node: &'static str,
        log: Arc<StdMutex<Vec<String>>>,
    }

    impl SharedPipeline {
        fn record(&self, call: &str) {
            self.log.lock().unwrap().push(format!("{}:{call}", self.node));
        }
    }

    #[async_trait]
    impl Pipeline for SharedPipeline {
        async fn clear_transfer_dirs(&self) -> CoreResult<()> {
            self.record("clear");
            Ok(())
        }

        async fn start_low_side(&self, mode: ProtocolMode) -> CoreResult<()> {
            self.record(&format!("low:{mode:?}"));
            Ok(())
        }

        async fn start_high_side(&self, mode: ProtocolMode) -> CoreResult<()> {
            self.record(&format!("high:{mode:?}"));
            Ok(())
        }

        async fn stop_key_gen(&self) {
            self.record("stop");
        }

        fn abort(&self) {}

        fn processes(&self) -> ProcessStateSnapshot {
            ProcessStateSnapshot::new()
        }
    }

    fn spawn_node(
        name: &'static str,
        node: Node,
        log: &Arc<StdMutex<Vec<String>>>,
        cancel: &CancellationToken,
    ) -> (Arc<Controller>, RelayHandle) {
        let link = node.handle.clone();
        let controller = Arc::new(Controller::new(
            Arc::new(SharedPipeline {
                node: name,
                log: Arc::clone(log),
            }),
            Arc::new(link.clone()),
            StatusBoard::new(name),
            Arc::new(EventBus::default()),
            node.feed,
            Duration::from_secs(2),
        ));
        tokio::spawn(Arc::clone(&controller).run(node.events, cancel.clone()));
        link.push(RelayInput::Connection(ConnectionStatus::Connected)).unwrap();
        (controller, link)
    }

    async fn wait_for_state(controller: &Controller, want: ControllerState) {
        let reached = async {
            while controller.state().await != want {
                sleep(Duration::from_millis(10)).await;
            }
        };
        if tokio::time::timeout(Duration::from_secs(3), reached).await.is_err() {
            panic!("stuck in {:?}, expected {want:?}", controller.state().await);
        }
    }

    #[tokio::test]
    async fn two_nodes_sequence_key_generation() {
        let cancel = CancellationToken::new();
        let (a, b) = linked(1000, 2000, &cancel);
        let log = Arc::new(StdMutex::new(Vec::new()));
        let (ctrl_a, link_a) = spawn_node("a", a, &log, &cancel);
        let (ctrl_b, link_b) = spawn_node("b", b, &log, &cancel);
        wait_for_state(&ctrl_a, ControllerState::Communicating).await;
        wait_for_state(&ctrl_b, ControllerState::Communicating).await;

        ctrl_a.start_key_gen().await.unwrap();
        wait_for_state(&ctrl_a, ControllerState::KeyGeneration).await;
        wait_for_state(&ctrl_b, ControllerState::KeyGeneration).await;

        assert_eq!(link_a.status().role, Role::LowCountSide);
        assert_eq!(link_b.status().role, Role::HighCountSide);

        let log = log.lock().unwrap().clone();
        let at = |entry: &str| {
            log.iter()
                .position(|e| e == entry)
                .unwrap_or_else(|| panic!("{entry} missing from {log:?}"))
        };
        assert!(at("a:clear") < at("a:low:Keygen"));
        assert!(at("a:low:Keygen") < at("b:high:Keygen"));
        assert!(!log.iter().any(|e| e == "a:high:Keygen" || e == "b:low:Keygen"));
        cancel.cancel();
    }
}
