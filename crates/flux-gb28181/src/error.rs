use std::fmt;
use thiserror::Error;

/// 对外暴露的错误类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Parse,
    Transport,
    Timeout,
    Auth,
    NotFound,
    Duplicate,
    MediaServer,
    Device,
    State,
    Persistence,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Parse => "parse",
            ErrorKind::Transport => "transport",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Auth => "auth",
            ErrorKind::NotFound => "not-found",
            ErrorKind::Duplicate => "duplicate",
            ErrorKind::MediaServer => "media-server",
            ErrorKind::Device => "device",
            ErrorKind::State => "state",
            ErrorKind::Persistence => "persistence",
        }
    }

    /// 运维接口使用的错误码，0 保留给成功
    pub fn code(&self) -> i32 {
        match self {
            ErrorKind::Parse => 1001,
            ErrorKind::Transport => 1002,
            ErrorKind::Timeout => 1003,
            ErrorKind::Auth => 1004,
            ErrorKind::NotFound => 1005,
            ErrorKind::Duplicate => 1006,
            ErrorKind::MediaServer => 1007,
            ErrorKind::Device => 1008,
            ErrorKind::State => 1009,
            ErrorKind::Persistence => 1010,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum Gb28181Error {
    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Auth error: {0}")]
    Auth(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Duplicate: {0}")]
    Duplicate(String),

    #[error("Media server error: {0}")]
    MediaServer(String),

    #[error("Device responded {code} {reason}")]
    Device { code: u16, reason: String },

    #[error("Invalid state: {0}")]
    State(String),

    #[error("Persistence error: {0}")]
    Persistence(#[from] sea_orm::DbErr),
}

impl Gb28181Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Gb28181Error::Parse(_) => ErrorKind::Parse,
            Gb28181Error::Transport(_) => ErrorKind::Transport,
            Gb28181Error::Timeout(_) => ErrorKind::Timeout,
            Gb28181Error::Auth(_) => ErrorKind::Auth,
            Gb28181Error::NotFound(_) => ErrorKind::NotFound,
            Gb28181Error::Duplicate(_) => ErrorKind::Duplicate,
            Gb28181Error::MediaServer(_) => ErrorKind::MediaServer,
            Gb28181Error::Device { .. } => ErrorKind::Device,
            Gb28181Error::State(_) => ErrorKind::State,
            Gb28181Error::Persistence(_) => ErrorKind::Persistence,
        }
    }

    pub fn code(&self) -> i32 {
        self.kind().code()
    }
}

impl From<std::io::Error> for Gb28181Error {
    fn from(err: std::io::Error) -> Self {
        Gb28181Error::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for Gb28181Error {
    fn from(err: serde_json::Error) -> Self {
        Gb28181Error::Parse(err.to_string())
    }
}

impl From<quick_xml::DeError> for Gb28181Error {
    fn from(err: quick_xml::DeError) -> Self {
        Gb28181Error::Parse(err.to_string())
    }
}

impl From<reqwest::Error> for Gb28181Error {
    fn from(err: reqwest::Error) -> Self {
        Gb28181Error::MediaServer(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Gb28181Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_and_code() {
        let err = Gb28181Error::Device {
            code: 486,
            reason: "Busy Here".to_string(),
        };
        assert_eq!(err.kind(), ErrorKind::Device);
        assert_eq!(err.kind().as_str(), "device");
        assert_ne!(err.code(), 0);
        assert_eq!(err.to_string(), "Device responded 486 Busy Here");
    }

    #[test]
    fn test_io_error_maps_to_transport() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let err: Gb28181Error = io.into();
        assert_eq!(err.kind(), ErrorKind::Transport);
    }
}
