#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    /// Workspace rule violation. The HTTP layer maps this to 403 with
    /// `code: "permission_policy_violation"`.
    #[error("permission policy violation: {0}")]
    Violation(String),

    /// Requested working directory is missing or not a directory (HTTP 400).
    #[error("invalid working directory: {0}")]
    InvalidCwd(String),

    /// Policy input failed strict normalization (HTTP 400).
    #[error("invalid permission policy: {0}")]
    InvalidPolicy(String),
}

impl PolicyError {
    pub fn is_violation(&self) -> bool {
        matches!(self, PolicyError::Violation(_))
    }
}
