//! Error types for kindling runs

use thiserror::Error;

/// Main error type for kindling operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Keypair generation or encoding failed. Fatal, nothing to retry.
    #[error("crypto error: {0}")]
    Crypto(String),

    /// Infrastructure apply failed, or the reported addresses never
    /// converged to valid IPv4 within the retry budget.
    #[error("provisioning error: {0}")]
    Provisioning(String),

    /// A remote command returned non-zero or the transport failed.
    ///
    /// Carries which node and which command so operators can diagnose the
    /// real cause instead of a generic timeout.
    #[error("remote exec failed on {node} running `{command}`: {message}")]
    RemoteExec {
        /// Address of the node the command ran against
        node: String,
        /// The command that failed
        command: String,
        /// Underlying failure, verbatim
        message: String,
    },

    /// A readiness predicate was never satisfied within the retry budget
    #[error("readiness condition `{condition}` not satisfied after {attempts} attempts")]
    ReadinessTimeout {
        /// The condition that never held
        condition: String,
        /// How many snapshots were evaluated
        attempts: u32,
    },

    /// A cluster state query failed.
    ///
    /// Readiness polls treat this like "not ready" and keep polling; it only
    /// surfaces directly when a query fails outside a poll loop.
    #[error("cluster query error: {0}")]
    Query(String),

    /// Chart installation failed. No automatic rollback.
    #[error("install error: {0}")]
    Install(String),

    /// Packer build or manifest lookup failed
    #[error("image build error: {0}")]
    ImageBuild(String),

    /// Invalid run configuration or stage ordering
    #[error("validation error: {0}")]
    Validation(String),

    /// I/O error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a crypto error with the given message
    pub fn crypto(msg: impl Into<String>) -> Self {
        Self::Crypto(msg.into())
    }

    /// Create a provisioning error with the given message
    pub fn provisioning(msg: impl Into<String>) -> Self {
        Self::Provisioning(msg.into())
    }

    /// Create a remote exec error for the given node and command
    pub fn remote_exec(
        node: impl Into<String>,
        command: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::RemoteExec {
            node: node.into(),
            command: command.into(),
            message: message.into(),
        }
    }

    /// Create a cluster query error with the given message
    pub fn query(msg: impl Into<String>) -> Self {
        Self::Query(msg.into())
    }

    /// Create an install error with the given message
    pub fn install(msg: impl Into<String>) -> Self {
        Self::Install(msg.into())
    }

    /// Create an image build error with the given message
    pub fn image_build(msg: impl Into<String>) -> Self {
        Self::ImageBuild(msg.into())
    }

    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }
}
