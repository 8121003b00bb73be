// 会话状态机
//
// IDLE → NEGOTIATING-MEDIA-SERVER → INVITING → EARLY → CONFIRMED → TERMINATING → TERMINATED
// 任一非终态都可能进入 FAILED(reason)

use crate::{ErrorKind, Gb28181Error, Result};
use serde::{Serialize, Serializer};
use std::fmt;

/// 失败原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailReason {
    MediaServer,
    Timeout,
    Transport,
    /// 设备返回的错误码
    Device(u16),
    Persistence,
    Parse,
    /// 媒体流断开
    MediaLost,
}

impl FailReason {
    pub fn from_error(err: &Gb28181Error) -> Self {
        match err {
            Gb28181Error::Device { code, .. } => FailReason::Device(*code),
            e => match e.kind() {
                ErrorKind::MediaServer => FailReason::MediaServer,
                ErrorKind::Timeout => FailReason::Timeout,
                ErrorKind::Persistence => FailReason::Persistence,
                ErrorKind::Parse => FailReason::Parse,
                _ => FailReason::Transport,
            },
        }
    }
}

impl fmt::Display for FailReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailReason::MediaServer => f.write_str("media-server"),
            FailReason::Timeout => f.write_str("timeout"),
            FailReason::Transport => f.write_str("transport"),
            FailReason::Device(code) => write!(f, "device-{}", code),
            FailReason::Persistence => f.write_str("persistence"),
            FailReason::Parse => f.write_str("parse"),
            FailReason::MediaLost => f.write_str("media-lost"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    NegotiatingMediaServer,
    Inviting,
    Early,
    Confirmed,
    Terminating,
    Terminated,
    Failed(FailReason),
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Terminated | SessionState::Failed(_))
    }

    /// 仍在建立中（可被 CANCEL）
    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            SessionState::Idle
                | SessionState::NegotiatingMediaServer
                | SessionState::Inviting
                | SessionState::Early
        )
    }

    pub fn can_transition(&self, to: SessionState) -> bool {
        use SessionState::*;
        match (*self, to) {
            (from, _) if from.is_terminal() => false,
            (_, Failed(_)) => true,
            (Idle, NegotiatingMediaServer) => true,
            (NegotiatingMediaServer, Inviting) => true,
            (Inviting, Early) | (Early, Early) => true,
            (Inviting, Confirmed) | (Early, Confirmed) => true,
            (from, Terminating) => from != Terminating,
            (Terminating, Terminated) => true,
            _ => false,
        }
    }

    /// 校验并切换状态
    pub fn advance(&mut self, to: SessionState) -> Result<()> {
        if !self.can_transition(to) {
            return Err(Gb28181Error::State(format!("cannot move from {} to {}", self, to)));
        }
        *self = to;
        Ok(())
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Idle => f.write_str("IDLE"),
            SessionState::NegotiatingMediaServer => f.write_str("NEGOTIATING-MEDIA-SERVER"),
            SessionState::Inviting => f.write_str("INVITING"),
            SessionState::Early => f.write_str("EARLY"),
            SessionState::Confirmed => f.write_str("CONFIRMED"),
            SessionState::Terminating => f.write_str("TERMINATING"),
            SessionState::Terminated => f.write_str("TERMINATED"),
            SessionState::Failed(reason) => write!(f, "FAILED({})", reason),
        }
    }
}

impl Serialize for SessionState {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let mut s = SessionState::Idle;
        for next in [
            SessionState::NegotiatingMediaServer,
            SessionState::Inviting,
            SessionState::Early,
            SessionState::Confirmed,
            SessionState::Terminating,
            SessionState::Terminated,
        ] {
            s.advance(next).unwrap();
        }
        assert!(s.is_terminal());
        assert!(s.advance(SessionState::Failed(FailReason::Timeout)).is_err());
    }

    #[test]
    fn test_invalid_transitions() {
        let mut s = SessionState::Idle;
        assert_eq!(s.advance(SessionState::Confirmed).unwrap_err().kind(), ErrorKind::State);
        s.advance(SessionState::Failed(FailReason::MediaServer)).unwrap();
        assert_eq!(s.to_string(), "FAILED(media-server)");
        assert!(!SessionState::Terminating.can_transition(SessionState::Terminating));
    }

    #[test]
    fn test_fail_reason_from_error() {
        let e = Gb28181Error::Device { code: 486, reason: "Busy".to_string() };
        assert_eq!(FailReason::from_error(&e), FailReason::Device(486));
        assert_eq!(FailReason::from_error(&Gb28181Error::Timeout("x".into())), FailReason::Timeout);
        assert_eq!(
            serde_json::to_string(&SessionState::Failed(FailReason::Timeout)).unwrap(),
            "\"FAILED(timeout)\""
        );
    }
}
