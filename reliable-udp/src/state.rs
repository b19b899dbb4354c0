//! Connection finite-state machine (FSM) types.
//!
//! This module defines every state an agent can occupy, mirroring the TCP
//! state diagram adapted for our two fixed roles, plus the per-role table of
//! legal transitions.  The transitions themselves are *driven* by
//! [`crate::sender`] and [`crate::receiver`]; [`StateMachine::advance`] only
//! checks them, so a role can never wander into a state it was not designed
//! to reach.
//!
//! ```text
//!  Sender                                  Receiver
//!  INIT ─▶ OPEN ─SYN─▶ SYN_SENT            INIT ─▶ LISTEN ◀──────────┐
//!           ▲  timeout ┘   │ SYN+ACK                 │ SYN           │ give up
//!           └──────────────┘                         ▼               │
//!                          ▼                       SYN_RCVD ─────────┘
//!                     ESTABLISHED                    │ ACK
//!                          │ EOF + drained           ▼
//!                          ▼                     ESTABLISHED
//!                     FIN_WAIT_1 ◀─┐                 │ FIN
//!                          │ FIN   │ timeout         ▼
//!                          ▼       │              CLOSE_WAIT
//!                     FIN_WAIT_2 ──┘                 │ sink flushed
//!                          │ ACK                     ▼
//!                          ▼                      LAST_ACK
//!                     TIME_WAIT                      │ ACK of FIN
//!                          │ FIN+ACK                 ▼
//!                          ▼                       CLOSED
//!                       CLOSING
//!                          │ linger
//!                          ▼
//!                       CLOSED
//! ```

use crate::connection::AgentError;

/// All possible states of the connection FSM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    /// Fresh agent; sequence numbers not chosen yet.
    #[default]
    Init,
    /// Sender is about to (re)send its SYN.
    Open,
    /// Receiver waits for a SYN.
    Listen,
    /// SYN sent; waiting for SYN+ACK.
    SynSent,
    /// SYN received; SYN+ACK sent; waiting for ACK.
    SynRcvd,
    /// Three-way handshake complete; data transfer in progress.
    Established,
    /// Sender is about to (re)send its FIN.
    FinWait1,
    /// FIN sent; waiting for it to be acknowledged.
    FinWait2,
    /// Peer's FIN received; flushing delivered data to the application.
    CloseWait,
    /// Sender acknowledges the peer's FIN and lingers.
    Closing,
    /// Receiver's FIN+ACK sent; waiting for the final ACK.
    LastAck,
    /// Sender's FIN acknowledged; waiting for the peer's FIN.
    TimeWait,
    /// Connection torn down.
    Closed,
}

impl ConnectionState {
    /// Canonical upper-case name (`SYN_SENT`, `FIN_WAIT_1`, …).
    pub fn name(self) -> &'static str {
        match self {
            Self::Init => "INIT",
            Self::Open => "OPEN",
            Self::Listen => "LISTEN",
            Self::SynSent => "SYN_SENT",
            Self::SynRcvd => "SYN_RCVD",
            Self::Established => "ESTABLISHED",
            Self::FinWait1 => "FIN_WAIT_1",
            Self::FinWait2 => "FIN_WAIT_2",
            Self::CloseWait => "CLOSE_WAIT",
            Self::Closing => "CLOSING",
            Self::LastAck => "LAST_ACK",
            Self::TimeWait => "TIME_WAIT",
            Self::Closed => "CLOSED",
        }
    }

    /// States `role` may move to from `self`.
    pub fn successors(self, role: Role) -> &'static [ConnectionState] {
        use ConnectionState::*;

        match (role, self) {
            (Role::Sender, Init) => &[Open],
            (Role::Sender, Open) => &[SynSent],
            (Role::Sender, SynSent) => &[Open, Established],
            (Role::Sender, Established) => &[FinWait1],
            (Role::Sender, FinWait1) => &[FinWait2],
            (Role::Sender, FinWait2) => &[FinWait1, TimeWait, Closed],
            (Role::Sender, TimeWait) => &[Closing, Closed],
            (Role::Sender, Closing) => &[Closed],

            (Role::Receiver, Init) => &[Listen],
            (Role::Receiver, Listen) => &[SynRcvd],
            (Role::Receiver, SynRcvd) => &[Listen, Established],
            (Role::Receiver, Established) => &[CloseWait],
            (Role::Receiver, CloseWait) => &[LastAck],
            (Role::Receiver, LastAck) => &[Closed],

            _ => &[],
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Which end of the transfer an agent plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Sender,
    Receiver,
}

impl Role {
    /// Prefix used on every log line emitted by this role.
    pub fn log_prefix(self) -> &'static str {
        match self {
            Role::Sender => "[sender]",
            Role::Receiver => "[receiver]",
        }
    }
}

/// Current state of one agent plus the guard on its transitions.
#[derive(Debug)]
pub struct StateMachine {
    role: Role,
    state: ConnectionState,
}

impl StateMachine {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            state: ConnectionState::Init,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Move to `next`, refusing any transition outside the role's table.
    pub fn advance(&mut self, next: ConnectionState) -> Result<(), AgentError> {
        if !self.state.successors(self.role).contains(&next) {
            log::error!(
                "{} illegal transition {} -> {}",
                self.role.log_prefix(),
                self.state,
                next
            );
            return Err(AgentError::ProtocolViolation {
                state: self.state,
                reason: format!("{:?} may not move to {next}", self.role),
            });
        }
        log::info!("{} STATE: {} -> {}", self.role.log_prefix(), self.state, next);
        self.state = next;
        Ok(())
    }

    /// Build the error for reaching `self.state` on a role that has no
    /// business being there.
    pub fn unexpected(&self) -> AgentError {
        log::error!(
            "{} reached {} which {:?} never enters",
            self.role.log_prefix(),
            self.state,
            self.role
        );
        AgentError::ProtocolViolation {
            state: self.state,
            reason: format!("{:?} has no handler for this state", self.role),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectionState::*;

    #[test]
    fn default_is_init() {
        assert_eq!(ConnectionState::default(), Init);
    }

    #[test]
    fn sender_happy_path_is_legal() {
        let mut m = StateMachine::new(Role::Sender);
        for next in [Open, SynSent, Established, FinWait1, FinWait2, TimeWait, Closing, Closed] {
            m.advance(next).unwrap();
        }
        assert_eq!(m.state(), Closed);
    }

    #[test]
    fn receiver_happy_path_is_legal() {
        let mut m = StateMachine::new(Role::Receiver);
        for next in [Listen, SynRcvd, Established, CloseWait, LastAck, Closed] {
            m.advance(next).unwrap();
        }
        assert_eq!(m.state(), Closed);
    }

    #[test]
    fn sender_cannot_listen() {
        let mut m = StateMachine::new(Role::Sender);
        let err = m.advance(Listen).unwrap_err();
        assert!(matches!(err, AgentError::ProtocolViolation { state: Init, .. }));
        assert_eq!(m.state(), Init);
    }

    #[test]
    fn receiver_cannot_skip_handshake() {
        let mut m = StateMachine::new(Role::Receiver);
        m.advance(Listen).unwrap();
        assert!(m.advance(Established).is_err());
    }

    #[test]
    fn retry_edges_exist() {
        assert!(SynSent.successors(Role::Sender).contains(&Open));
        assert!(FinWait2.successors(Role::Sender).contains(&FinWait1));
        assert!(SynRcvd.successors(Role::Receiver).contains(&Listen));
    }

    #[test]
    fn closed_is_terminal_for_both_roles() {
        assert!(Closed.successors(Role::Sender).is_empty());
        assert!(Closed.successors(Role::Receiver).is_empty());
    }

    #[test]
    fn display_uses_wire_names() {
        assert_eq!(FinWait1.to_string(), "FIN_WAIT_1");
        assert_eq!(SynRcvd.to_string(), "SYN_RCVD");
    }
}
