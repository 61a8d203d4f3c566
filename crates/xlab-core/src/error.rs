//! ---
//! xlab_section: "01-core-functionality"
//! xlab_subsection: "module"
//! xlab_type: "source"
//! xlab_scope: "code"
//! xlab_description: "Error type of the lifecycle controller."
//! xlab_version: "v0.0.0-prealpha"
//! xlab_owner: "tbd"
//! ---
use xlab_queue::QueueError;

use crate::collaborators::ContainerRole;

/// Result alias used throughout the controller crate.
pub type Result<T> = std::result::Result<T, ControllerError>;

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
    /// Failure reported by an external collaborator.
    #[error(transparent)]
    Collaborator(#[from] anyhow::Error),
    #[error("no usable {role} image registered for {uri}")]
    MissingImage { role: ContainerRole, uri: String },
    #[error("failed to start {role} container: {reason}")]
    ContainerStart { role: ContainerRole, reason: String },
    #[error("unknown command code {0}")]
    UnknownCommand(u8),
    #[error("malformed command payload: {0}")]
    MalformedPayload(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names_the_role() {
        let err = ControllerError::MissingImage {
            role: ContainerRole::System,
            uri: "urn:sys".into(),
        };
        assert_eq!(err.to_string(), "no usable system image registered for urn:sys");
    }
}
