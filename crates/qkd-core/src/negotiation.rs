//! Symmetry negotiation between the two nodes.
//!
//! Pure state machine: it never measures rates or talks to the network itself.
//! The relay feeds it parsed messages and sends whatever reply it returns.
use qkd_model::{Message, NegotiationState, Rate, Role};

/// Result of feeding one message to the [`Negotiator`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Send this message to the partner.
    Reply(Message),
    /// Send this message and report the decided role.
    ReplyAndFinish(Message, Role),
    /// Negotiation finished without a reply.
    Finished(Role),
    /// Echoed rates did not match; state was reset.
    Mismatch(String),
}

#[derive(Debug, Default, Clone)]
pub struct Negotiator {
    state: NegotiationState,
    role: Role,
    local_rate: Option<Rate>,
    remote_rate: Option<Rate>,
}

impl Negotiator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Local rate recorded by an in-flight negotiation, if any.
    pub fn pending_rate(&self) -> Option<Rate> {
        match self.state {
            NegotiationState::Pending => self.local_rate,
            _ => None,
        }
    }

    /// Open a negotiation; the returned `ne1` goes to the partner.
    pub fn begin(&mut self, local: Rate) -> Message {
        self.state = NegotiationState::Pending;
        self.role = Role::Undetermined;
        self.local_rate = Some(local);
        self.remote_rate = None;
        Message::Ne1 { rate: local }
    }

    /// Partner opened a negotiation.
    pub fn on_ne1(&mut self, local: Rate, remote: Rate) -> Step {
        self.state = NegotiationState::Pending;
        self.role = Role::Undetermined;
        self.local_rate = Some(local);
        self.remote_rate = Some(remote);
        Step::Reply(Message::Ne2 {
            rate: local,
            echo: remote,
        })
    }

    /// Partner answered our `ne1`.
    pub fn on_ne2(&mut self, remote: Rate, echo: Rate) -> Step {
        let Some(local) = self.local_rate else {
            return self.mismatch(format!("ne2 received without a local rate (echo {echo})"));
        };
        if echo != local {
            return self.mismatch(format!("ne2 echo {echo} does not match local rate {local}"));
        }
        self.remote_rate = Some(remote);
        self.role = if local <= remote {
            Role::LowCountSide
        } else {
            Role::HighCountSide
        };
        self.state = NegotiationState::Finished;
        Step::ReplyAndFinish(
            Message::Ne3 {
                rate: local,
                echo: remote,
            },
            self.role,
        )
    }

    /// Partner confirmed the rates we exchanged.
    pub fn on_ne3(&mut self, remote: Rate, echo: Rate) -> Step {
        let (Some(local), Some(known_remote)) = (self.local_rate, self.remote_rate) else {
            return self.mismatch("ne3 received before rates were exchanged".to_string());
        };
        if remote != known_remote || echo != local {
            return self.mismatch(format!(
                "ne3 rates {remote}/{echo} do not match recorded {known_remote}/{local}"
            ));
        }
        self.role = if local < remote {
            Role::LowCountSide
        } else {
            Role::HighCountSide
        };
        self.state = NegotiationState::Finished;
        Step::Finished(self.role)
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    fn mismatch(&mut self, reason: String) -> Step {
        self.reset();
        Step::Mismatch(reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Two nodes wired back to back; messages are delivered by the test.
    struct Pair {
        nodes: [Negotiator; 2],
        rates: [Rate; 2],
        inbox: [VecDeque<Message>; 2],
    }

    impl Pair {
        fn new(a: Rate, b: Rate) -> Self {
            Self {
                nodes: [Negotiator::new(), Negotiator::new()],
                rates: [a, b],
                inbox: [VecDeque::new(), VecDeque::new()],
            }
        }

        fn begin(&mut self, i: usize) {
            let msg = self.nodes[i].begin(self.rates[i]);
            self.inbox[1 - i].push_back(msg);
        }

        /// Deliver the oldest message queued for node `i`.
        fn deliver(&mut self, i: usize) -> bool {
            let Some(msg) = self.inbox[i].pop_front() else {
                return false;
            };
            let node = &mut self.nodes[i];
            let step = match msg {
                Message::Ne1 { rate } => {
                    let local = node.pending_rate().unwrap_or(self.rates[i]);
                    node.on_ne1(local, rate)
                }
                Message::Ne2 { rate, echo } => node.on_ne2(rate, echo),
                Message::Ne3 { rate, echo } => node.on_ne3(rate, echo),
                other => panic!("unexpected {other:?}"),
            };
            match step {
                Step::Reply(m) | Step::ReplyAndFinish(m, _) => self.inbox[1 - i].push_back(m),
                Step::Finished(_) => {}
                Step::Mismatch(r) => panic!("mismatch: {r}"),
            }
            true
        }

        fn drain(&mut self, order: &[usize]) {
            loop {
                let mut progressed = false;
                for &i in order {
                    progressed |= self.deliver(i);
                }
                if !progressed {
                    break;
                }
            }
        }

        fn roles(&self) -> [Role; 2] {
            [self.nodes[0].role(), self.nodes[1].role()]
        }

        fn finished(&self) -> bool {
            self.nodes.iter().all(|n| n.state() == NegotiationState::Finished)
        }
    }

    #[test]
    fn lower_rate_becomes_low_side() {
        let mut pair = Pair::new(1000, 2000);
        pair.begin(0);
        pair.drain(&[0, 1]);

        assert!(pair.finished());
        assert_eq!(pair.roles(), [Role::LowCountSide, Role::HighCountSide]);
    }

    #[test]
    fn role_is_independent_of_who_initiates() {
        for (a, b) in [(1000, 2000), (2000, 1000), (1, 999_999), (50_000, 49_999)] {
            for initiator in [0, 1] {
                let mut pair = Pair::new(a, b);
                pair.begin(initiator);
                pair.drain(&[0, 1]);
                assert!(pair.finished(), "rates {a}/{b} initiator {initiator}");

                let low = if a < b { 0 } else { 1 };
                assert_eq!(pair.roles()[low], Role::LowCountSide, "rates {a}/{b}");
                assert_eq!(pair.roles()[1 - low], Role::HighCountSide, "rates {a}/{b}");
            }
        }
    }

    #[test]
    fn simultaneous_initiation_in_any_delivery_order_agrees() {
        for (a, b) in [(1000, 2000), (2000, 1000)] {
            for order in [[0, 1], [1, 0]] {
                let mut pair = Pair::new(a, b);
                pair.begin(0);
                pair.begin(1);
                pair.drain(&order);

                assert!(pair.finished());
                let [ra, rb] = pair.roles();
                assert_ne!(ra, rb, "rates {a}/{b} order {order:?}");
                let expected_a = if a < b { Role::LowCountSide } else { Role::HighCountSide };
                assert_eq!(ra, expected_a);
            }
        }
    }

    #[test]
    fn equal_rates_with_single_initiator_still_split_roles() {
        let mut pair = Pair::new(1500, 1500);
        pair.begin(0);
        pair.drain(&[0, 1]);
        assert_eq!(pair.roles(), [Role::LowCountSide, Role::HighCountSide]);
    }

    #[test]
    fn ne2_with_wrong_echo_resets() {
        let mut n = Negotiator::new();
        n.begin(1000);
        let step = n.on_ne2(2000, 999);
        assert!(matches!(step, Step::Mismatch(_)));
        assert_eq!(n.state(), NegotiationState::NotDone);
        assert_eq!(n.role(), Role::Undetermined);
    }

    #[test]
    fn ne3_with_unexpected_rates_resets() {
        let mut n = Negotiator::new();
        n.on_ne1(2000, 1000);
        assert!(matches!(n.on_ne3(1001, 2000), Step::Mismatch(_)));
        assert_eq!(n.state(), NegotiationState::NotDone);
    }

    #[test]
    fn unsolicited_messages_are_rejected() {
        let mut n = Negotiator::new();
        assert!(matches!(n.on_ne2(1, 2), Step::Mismatch(_)));
        assert!(matches!(n.on_ne3(1, 2), Step::Mismatch(_)));
    }

    #[test]
    fn new_ne1_restarts_a_finished_negotiation() {
        let mut n = Negotiator::new();
        n.on_ne1(2000, 1000);
        n.on_ne3(1000, 2000);
        assert_eq!(n.state(), NegotiationState::Finished);

        let step = n.on_ne1(2100, 900);
        assert_eq!(step, Step::Reply(Message::Ne2 { rate: 2100, echo: 900 }));
        assert_eq!(n.state(), NegotiationState::Pending);
        assert_eq!(n.role(), Role::Undetermined);
    }
}
