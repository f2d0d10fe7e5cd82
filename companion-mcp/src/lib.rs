pub mod protocol;
pub mod supervisor;
pub mod transport;

pub use protocol::{ToolDescriptor, PROTOCOL_VERSION};
pub use supervisor::{
    ServerStatus, ServerSummary, TaggedTool, ToolCallOutcome, ToolServerSupervisor,
};
pub use transport::{NotificationHandler, StdioTransport};

#[derive(Debug, thiserror::Error)]
pub enum ToolServerError {
    #[error("tool server rpc error {code}: {message}")]
    Rpc {
        code: i64,
        message: String,
        data: Option<serde_json::Value>,
    },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("transport closed")]
    Closed,

    #[error("timed out waiting for tool server response")]
    Timeout,

    #[error("server spawn failed: {0}")]
    SpawnFailed(String),

    #[error("unknown tool server: {0}")]
    ServerNotFound(String),

    #[error("tool server '{0}' is already starting")]
    AlreadyStarting(String),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}
