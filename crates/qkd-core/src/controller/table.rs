//! Start-up and service handshakes as one table keyed by (state, role, message).
use qkd_model::{ControllerState, Message, ProtocolMode, Role};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    ClearTransferDirs,
    StartLowSide(ProtocolMode),
    StartHighSide(ProtocolMode),
    StopKeyGen,
    Send(Message),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub actions: Vec<Action>,
    pub next: ControllerState,
}

impl Transition {
    fn stay(state: ControllerState) -> Self {
        Self {
            actions: Vec::new(),
            next: state,
        }
    }

    fn to(next: ControllerState, actions: Vec<Action>) -> Self {
        Self { actions, next }
    }
}

pub fn transition(state: ControllerState, role: Role, msg: &Message) -> Transition {
    use Action::*;
    use ControllerState as S;
    use ProtocolMode::{Keygen, Service};

    if state == S::Idle {
        return Transition::stay(state);
    }
    if *msg == Message::StopKeyGen {
        return Transition::to(S::Communicating, vec![StopKeyGen]);
    }

    // A fresh handshake supersedes whatever pipeline is running.
    let restart = |mut tail: Vec<Action>| {
        if state.is_pipeline_active() {
            tail.insert(0, StopKeyGen);
        }
        tail
    };
    let settled = if state.is_pipeline_active() { S::Communicating } else { state };

    match (role, msg) {
        (Role::Undetermined, _) => Transition::stay(state),

        (Role::LowCountSide, Message::St1) => Transition::to(
            S::KeyGeneration,
            restart(vec![ClearTransferDirs, StartLowSide(Keygen), Send(Message::St2)]),
        ),
        (Role::HighCountSide, Message::St1) => Transition::to(settled, restart(vec![Send(Message::St2)])),

        (Role::LowCountSide, Message::St2) => Transition::to(
            S::KeyGeneration,
            vec![ClearTransferDirs, StartLowSide(Keygen), Send(Message::St3)],
        ),
        (Role::HighCountSide, Message::St2) => Transition::to(S::KeyGeneration, vec![StartHighSide(Keygen)]),

        (Role::HighCountSide, Message::St3) => Transition::to(S::KeyGeneration, vec![StartHighSide(Keygen)]),

        (Role::LowCountSide, Message::StartServiceMode) => Transition::to(
            S::ServiceMode,
            restart(vec![
                ClearTransferDirs,
                StartLowSide(Service),
                Send(Message::StartServiceModeStep2),
            ]),
        ),
        (Role::HighCountSide, Message::StartServiceMode) => {
            Transition::to(settled, restart(vec![Send(Message::StartServiceMode)]))
        }

        (Role::HighCountSide, Message::StartServiceModeStep2) => {
            Transition::to(S::ServiceMode, vec![StartHighSide(Service)])
        }

        _ => Transition::stay(state),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use Action::*;
    use ControllerState as S;
    use ProtocolMode::{Keygen, Service};

    const LOW: Role = Role::LowCountSide;
    const HIGH: Role = Role::HighCountSide;

    #[test]
    fn idle_ignores_everything() {
        for msg in [Message::St1, Message::St2, Message::StopKeyGen, Message::StartServiceMode] {
            assert_eq!(transition(S::Idle, LOW, &msg), Transition::stay(S::Idle));
        }
    }

    #[test]
    fn undetermined_role_takes_no_action() {
        let t = transition(S::Negotiating, Role::Undetermined, &Message::St1);
        assert!(t.actions.is_empty());
        assert_eq!(t.next, S::Negotiating);
    }

    #[test]
    fn low_initiator_handshake() {
        // high answers st1 without starting anything
        let t = transition(S::Communicating, HIGH, &Message::St1);
        assert_eq!(t.actions, vec![Send(Message::St2)]);
        assert_eq!(t.next, S::Communicating);

        let t = transition(S::Negotiating, LOW, &Message::St2);
        assert_eq!(t.actions, vec![ClearTransferDirs, StartLowSide(Keygen), Send(Message::St3)]);
        assert_eq!(t.next, S::KeyGeneration);

        let t = transition(S::Communicating, HIGH, &Message::St3);
        assert_eq!(t.actions, vec![StartHighSide(Keygen)]);
        assert_eq!(t.next, S::KeyGeneration);
    }

    #[test]
    fn high_initiator_handshake() {
        let t = transition(S::Communicating, LOW, &Message::St1);
        assert_eq!(t.actions, vec![ClearTransferDirs, StartLowSide(Keygen), Send(Message::St2)]);
        assert_eq!(t.next, S::KeyGeneration);

        let t = transition(S::Negotiating, HIGH, &Message::St2);
        assert_eq!(t.actions, vec![StartHighSide(Keygen)]);
        assert_eq!(t.next, S::KeyGeneration);
    }

    #[test]
    fn st3_on_low_side_is_ignored() {
        let t = transition(S::KeyGeneration, LOW, &Message::St3);
        assert!(t.actions.is_empty());
        assert_eq!(t.next, S::KeyGeneration);
    }

    #[test]
    fn st1_during_key_generation_stops_first() {
        let t = transition(S::KeyGeneration, LOW, &Message::St1);
        assert_eq!(t.actions[0], StopKeyGen);
        assert_eq!(t.next, S::KeyGeneration);

        let t = transition(S::KeyGeneration, HIGH, &Message::St1);
        assert_eq!(t.actions, vec![StopKeyGen, Send(Message::St2)]);
        assert_eq!(t.next, S::Communicating);
    }

    #[test]
    fn stop_is_role_independent() {
        for role in [LOW, HIGH, Role::Undetermined] {
            let t = transition(S::ServiceMode, role, &Message::StopKeyGen);
            assert_eq!(t.actions, vec![StopKeyGen]);
            assert_eq!(t.next, S::Communicating);
        }
    }

    #[test]
    fn service_handshake() {
        let t = transition(S::Negotiating, HIGH, &Message::StartServiceMode);
        assert_eq!(t.actions, vec![Send(Message::StartServiceMode)]);
        assert_eq!(t.next, S::Negotiating);

        let t = transition(S::Communicating, LOW, &Message::StartServiceMode);
        assert_eq!(
            t.actions,
            vec![ClearTransferDirs, StartLowSide(Service), Send(Message::StartServiceModeStep2)]
        );
        assert_eq!(t.next, S::ServiceMode);

        let t = transition(S::Negotiating, HIGH, &Message::StartServiceModeStep2);
        assert_eq!(t.actions, vec![StartHighSide(Service)]);
        assert_eq!(t.next, S::ServiceMode);

        let t = transition(S::ServiceMode, LOW, &Message::StartServiceModeStep2);
        assert!(t.actions.is_empty());
    }

    #[test]
    fn unknown_messages_are_ignored() {
        let t = transition(S::KeyGeneration, HIGH, &Message::Other("hello".into()));
        assert_eq!(t, Transition::stay(S::KeyGeneration));
    }
}
