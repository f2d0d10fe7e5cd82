pub mod events;
pub mod exec;
pub mod ring;
pub mod session;
mod shell;

pub use events::SessionEvent;
pub use exec::{run_command, ExecRequest, ExecResult};
pub use ring::OutputRing;
pub use session::{
    LogSlice, SessionConfig, SessionLog, SessionManager, SessionPage, SessionRequest,
    SessionSnapshot, SessionStatus, StreamSelector,
};

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("session is not running: {0}")]
    NotRunning(String),

    #[error("session stdin is closed: {0}")]
    StdinClosed(String),

    #[error("unknown key: {0}")]
    UnknownKey(String),

    #[error("unknown stream: {0}")]
    UnknownStream(String),

    #[error("signals are not supported on this platform")]
    SignalsUnsupported,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
