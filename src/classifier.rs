//! Connection classifier
//!
//! Decides, on cable insertion, whether the far end is a USB host, a
//! dedicated charger, or nothing. A charger shorts the data lines, so
//! both read asserted in the single-ended sample; a host enumerates,
//! so a bus reset or setup packet shows up well inside a second. No
//! activity within the window means retrying with a fresh controller
//! reset, and once the retries run out the peer is assumed to be a
//! charger that will never enumerate.
//!
//! The classifier itself is a pure state machine: it reports what it
//! wants done through [`ClassifierAction`], and the driver owns the
//! hardware and collaborator effects.

/// `PORTSC1.LS` sample with both data lines asserted, the signature of
/// charger-style shorted wiring.
pub(crate) const LINE_STATE_CHARGER: u32 = 0b11;

/// How many silent timeout windows to retry before giving up on
/// enumeration.
pub(crate) const CLASSIFY_RETRIES: u8 = 3;

/// Handle for one armed classifier timer.
///
/// Tokens are generation-counted: every arm produces a fresh token, and
/// an expiry or cancellation carrying a stale token is ignored. That
/// makes cancellation idempotent without the timer and the classifier
/// agreeing on shared state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerToken(u32);

/// The classifier's verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Host,
    Charger,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ClassifierState {
    /// No cable, no opinion.
    Idle,
    /// Insertion seen; sampling the data lines.
    SamplingLines,
    /// Lines look host-like; waiting for protocol activity.
    AwaitingActivity { retries_left: u8, token: TimerToken },
    Host,
    Charger,
    Disconnected,
}

/// What the driver must do after feeding the classifier an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ClassifierAction {
    None,
    /// Arm the protocol-activity timer.
    ArmTimer(TimerToken),
    /// A host was detected; cancel the armed timer.
    HostDetected { cancel: TimerToken },
    /// Charger detected straight from the line sample.
    ChargerDetected,
    /// Window expired with retries left: re-reset the controller and
    /// re-arm with the new token.
    Retry { rearm: TimerToken },
    /// Retries exhausted: assume a charger.
    ChargerAssumed,
    /// Cable removed; cancel the armed timer if any.
    Removed { cancel: Option<TimerToken> },
}

pub(crate) struct Classifier {
    state: ClassifierState,
    generation: u32,
}

impl Classifier {
    pub const fn new() -> Self {
        Classifier {
            state: ClassifierState::Idle,
            generation: 0,
        }
    }

    pub fn state(&self) -> ClassifierState {
        self.state
    }

    pub fn classification(&self) -> Option<Classification> {
        match self.state {
            ClassifierState::Host => Some(Classification::Host),
            ClassifierState::Charger => Some(Classification::Charger),
            _ => None,
        }
    }

    fn fresh_token(&mut self) -> TimerToken {
        self.generation = self.generation.wrapping_add(1);
        TimerToken(self.generation)
    }

    /// Cable inserted; `line_state` is the current `PORTSC1.LS` sample.
    pub fn insertion(&mut self, line_state: u32) -> ClassifierAction {
        self.state = ClassifierState::SamplingLines;
        if line_state == LINE_STATE_CHARGER {
            self.state = ClassifierState::Charger;
            ClassifierAction::ChargerDetected
        } else {
            let token = self.fresh_token();
            self.state = ClassifierState::AwaitingActivity {
                retries_left: CLASSIFY_RETRIES,
                token,
            };
            ClassifierAction::ArmTimer(token)
        }
    }

    /// Protocol activity observed: a bus reset or a setup packet.
    /// Only meaningful while we're still waiting for it.
    pub fn activity(&mut self) -> ClassifierAction {
        match self.state {
            ClassifierState::AwaitingActivity { token, .. } => {
                self.state = ClassifierState::Host;
                ClassifierAction::HostDetected { cancel: token }
            }
            _ => ClassifierAction::None,
        }
    }

    /// The armed timer fired. Stale tokens are ignored.
    pub fn timeout(&mut self, token: TimerToken) -> ClassifierAction {
        match self.state {
            ClassifierState::AwaitingActivity {
                retries_left,
                token: armed,
            } if armed == token => {
                if retries_left > 1 {
                    let rearm = self.fresh_token();
                    self.state = ClassifierState::AwaitingActivity {
                        retries_left: retries_left - 1,
                        token: rearm,
                    };
                    ClassifierAction::Retry { rearm }
                } else {
                    self.state = ClassifierState::Charger;
                    ClassifierAction::ChargerAssumed
                }
            }
            _ => ClassifierAction::None,
        }
    }

    /// Cable removed. Idempotent; removal of an already-dead
    /// classifier is a no-op.
    pub fn removal(&mut self) -> ClassifierAction {
        let cancel = match self.state {
            ClassifierState::AwaitingActivity { token, .. } => Some(token),
            _ => None,
        };
        let was_dead = matches!(
            self.state,
            ClassifierState::Idle | ClassifierState::Disconnected
        );
        self.state = ClassifierState::Disconnected;
        if was_dead {
            ClassifierAction::None
        } else {
            ClassifierAction::Removed { cancel }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{
        Classifier, ClassifierAction, ClassifierState, Classification, CLASSIFY_RETRIES,
        LINE_STATE_CHARGER,
    };

    #[test]
    fn shorted_lines_classify_charger_immediately() {
        let mut classifier = Classifier::new();
        let action = classifier.insertion(LINE_STATE_CHARGER);
        assert_eq!(action, ClassifierAction::ChargerDetected);
        assert_eq!(classifier.classification(), Some(Classification::Charger));
    }

    #[test]
    fn activity_before_timeout_classifies_host() {
        let mut classifier = Classifier::new();
        let armed = match classifier.insertion(0b01) {
            ClassifierAction::ArmTimer(token) => token,
            other => panic!("expected timer arm, got {:?}", other),
        };

        let action = classifier.activity();
        assert_eq!(action, ClassifierAction::HostDetected { cancel: armed });
        assert_eq!(classifier.classification(), Some(Classification::Host));

        // late expiry of the cancelled timer changes nothing
        assert_eq!(classifier.timeout(armed), ClassifierAction::None);
    }

    #[test]
    fn silent_windows_retry_then_assume_charger() {
        let mut classifier = Classifier::new();
        let mut token = match classifier.insertion(0b01) {
            ClassifierAction::ArmTimer(token) => token,
            other => panic!("expected timer arm, got {:?}", other),
        };

        for _ in 1..CLASSIFY_RETRIES {
            token = match classifier.timeout(token) {
                ClassifierAction::Retry { rearm } => rearm,
                other => panic!("expected retry, got {:?}", other),
            };
        }

        assert_eq!(classifier.timeout(token), ClassifierAction::ChargerAssumed);
        assert_eq!(classifier.classification(), Some(Classification::Charger));
        // a very late expiry is ignored
        assert_eq!(classifier.timeout(token), ClassifierAction::None);
    }

    #[test]
    fn stale_token_is_ignored() {
        let mut classifier = Classifier::new();
        let first = match classifier.insertion(0b01) {
            ClassifierAction::ArmTimer(token) => token,
            other => panic!("expected timer arm, got {:?}", other),
        };
        let second = match classifier.timeout(first) {
            ClassifierAction::Retry { rearm } => rearm,
            other => panic!("expected retry, got {:?}", other),
        };
        assert_ne!(first, second);
        // the first window's timer fires again somehow; nothing happens
        assert_eq!(classifier.timeout(first), ClassifierAction::None);
        assert!(matches!(
            classifier.state(),
            ClassifierState::AwaitingActivity { .. }
        ));
        let _ = second;
    }

    #[test]
    fn removal_cancels_and_is_idempotent() {
        let mut classifier = Classifier::new();
        let token = match classifier.insertion(0b01) {
            ClassifierAction::ArmTimer(token) => token,
            other => panic!("expected timer arm, got {:?}", other),
        };

        assert_eq!(
            classifier.removal(),
            ClassifierAction::Removed {
                cancel: Some(token)
            }
        );
        assert_eq!(classifier.state(), ClassifierState::Disconnected);
        // removing again is a no-op
        assert_eq!(classifier.removal(), ClassifierAction::None);
    }
}
