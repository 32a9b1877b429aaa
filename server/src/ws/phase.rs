//! Per-connection protocol state of the gateway.
//!
//! `Connecting -> Authenticating -> Authorized -> Open -> Closed`. The
//! handler and actor feed events in; transitions are pure so they can be
//! checked without a socket.

use uuid::Uuid;

use tempest_chat_shared::protocol::{
    CLOSE_AUTHENTICATION_FAILED, CLOSE_FORBIDDEN, CLOSE_GOING_AWAY, CLOSE_INTERNAL_ERROR,
    CLOSE_SUPERSEDED,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayPhase {
    Connecting,
    Authenticating,
    Authorized { participant_id: Uuid },
    Open { participant_id: Uuid, connection_id: Uuid },
    Closed(CloseReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    AuthenticationFailed,
    Forbidden,
    StoreUnavailable,
    Superseded,
    PongTimeout,
    ChannelLost,
    ClientClosed,
}

impl CloseReason {
    /// Close code the gateway sends for this reason, if it initiates the close.
    pub fn close_code(&self) -> Option<u16> {
        match self {
            Self::AuthenticationFailed => Some(CLOSE_AUTHENTICATION_FAILED),
            Self::Forbidden => Some(CLOSE_FORBIDDEN),
            Self::StoreUnavailable => Some(CLOSE_INTERNAL_ERROR),
            Self::Superseded => Some(CLOSE_SUPERSEDED),
            Self::PongTimeout => Some(CLOSE_GOING_AWAY),
            Self::ChannelLost | Self::ClientClosed => None,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::AuthenticationFailed => "Authentication failed",
            Self::Forbidden => "Not a participant of this conversation",
            Self::StoreUnavailable => "Conversation store unavailable",
            Self::Superseded => "Superseded by a newer connection",
            Self::PongTimeout => "Pong timeout",
            Self::ChannelLost => "Channel lost",
            Self::ClientClosed => "Client closed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseEvent {
    HandshakeReceived,
    Authenticated(Uuid),
    AuthenticationRejected,
    MemberConfirmed,
    MembershipRejected,
    StoreUnavailable,
    Registered(Uuid),
    Closed(CloseReason),
}

impl GatewayPhase {
    /// Apply one event. Events that make no sense in the current phase
    /// leave it unchanged; `Closed` is absorbing.
    pub fn next(self, event: PhaseEvent) -> GatewayPhase {
        use GatewayPhase::*;
        match (self, event) {
            (Closed(reason), _) => Closed(reason),
            (Connecting, PhaseEvent::HandshakeReceived) => Authenticating,
            (Authenticating, PhaseEvent::Authenticated(participant_id)) => {
                Authorized { participant_id }
            }
            (Authenticating, PhaseEvent::AuthenticationRejected) => {
                Closed(CloseReason::AuthenticationFailed)
            }
            (Authorized { participant_id }, PhaseEvent::MemberConfirmed) => {
                Authorized { participant_id }
            }
            (Authorized { .. }, PhaseEvent::MembershipRejected) => Closed(CloseReason::Forbidden),
            (Authorized { .. }, PhaseEvent::StoreUnavailable) => {
                Closed(CloseReason::StoreUnavailable)
            }
            (Authorized { participant_id }, PhaseEvent::Registered(connection_id)) => Open {
                participant_id,
                connection_id,
            },
            (_, PhaseEvent::Closed(reason)) => Closed(reason),
            (phase, _) => phase,
        }
    }

    /// Advance in place, logging the transition.
    pub fn advance(&mut self, conversation_id: Uuid, event: PhaseEvent) {
        let next = self.next(event);
        if next != *self {
            tracing::debug!(
                conversation_id = %conversation_id,
                from = ?self,
                to = ?next,
                "Gateway phase transition"
            );
        }
        *self = next;
    }

    pub fn is_open(&self) -> bool {
        matches!(self, GatewayPhase::Open { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_reaches_open() {
        let user = Uuid::new_v4();
        let conn = Uuid::new_v4();
        let phase = GatewayPhase::Connecting
            .next(PhaseEvent::HandshakeReceived)
            .next(PhaseEvent::Authenticated(user))
            .next(PhaseEvent::MemberConfirmed)
            .next(PhaseEvent::Registered(conn));
        assert_eq!(
            phase,
            GatewayPhase::Open {
                participant_id: user,
                connection_id: conn
            }
        );
    }

    #[test]
    fn auth_failure_never_opens() {
        let phase = GatewayPhase::Connecting
            .next(PhaseEvent::HandshakeReceived)
            .next(PhaseEvent::AuthenticationRejected)
            .next(PhaseEvent::Registered(Uuid::new_v4()));
        assert_eq!(phase, GatewayPhase::Closed(CloseReason::AuthenticationFailed));
        assert!(!phase.is_open());
    }

    #[test]
    fn registration_requires_authorization() {
        let phase = GatewayPhase::Authenticating.next(PhaseEvent::Registered(Uuid::new_v4()));
        assert_eq!(phase, GatewayPhase::Authenticating);
    }

    #[test]
    fn non_member_is_forbidden() {
        let phase = GatewayPhase::Authorized {
            participant_id: Uuid::new_v4(),
        }
        .next(PhaseEvent::MembershipRejected);
        assert_eq!(phase, GatewayPhase::Closed(CloseReason::Forbidden));
        assert_eq!(CloseReason::Forbidden.close_code(), Some(CLOSE_FORBIDDEN));
    }

    #[test]
    fn open_connection_closes_on_channel_loss() {
        let phase = GatewayPhase::Open {
            participant_id: Uuid::new_v4(),
            connection_id: Uuid::new_v4(),
        }
        .next(PhaseEvent::Closed(CloseReason::ChannelLost))
        .next(PhaseEvent::HandshakeReceived);
        assert_eq!(phase, GatewayPhase::Closed(CloseReason::ChannelLost));
    }
}
