//! Contract types for the sandbox runtime's local daemon (HTTP over a unix socket).
//!
//! The daemon itself is an external collaborator; this module only names the calls a
//! worker makes against it and the status codes each call is expected to return, so that
//! the worker's HTTP client and its tests share one vocabulary.

use std::time::Duration;

/// Connect timeout applied to every call against the local daemon.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);
/// Overall request timeout applied to every call against the local daemon.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// One call the worker can make against a sandbox's local runtime daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeCall {
    /// `POST /containers`. Launches a fresh container for a `Spawn` request. Expects
    /// HTTP 201.
    Launch {
        /// Container name to create.
        name: String,
        /// Application tag, passed through to the runtime as image/config selection.
        application: String,
    },
    /// `POST /containers/<name>/checkpoints`. Expects HTTP 201.
    Checkpoint {
        /// Container name.
        name: String,
    },
    /// `POST /containers/<name>/pause`. Expects HTTP 204.
    Pause {
        /// Container name.
        name: String,
    },
    /// `POST /containers/<name>/unpause`. Expects HTTP 204.
    Unpause {
        /// Container name.
        name: String,
    },
    /// `POST /containers/<name>/stop`. Expects HTTP 204.
    Stop {
        /// Container name.
        name: String,
    },
    /// `POST /containers/<name>/start?checkpoint=<id>`. Expects HTTP 204.
    StartFromCheckpoint {
        /// Container name.
        name: String,
        /// Checkpoint id to start from.
        checkpoint_id: String,
    },
    /// `DELETE /containers/<name>?force=true`. Expects HTTP 204.
    Remove {
        /// Container name.
        name: String,
    },
}

impl RuntimeCall {
    /// The HTTP status code a well-behaved daemon returns for this call.
    pub const fn expected_status(&self) -> u16 {
        match self {
            Self::Launch { .. } | Self::Checkpoint { .. } => 201,
            Self::Pause { .. }
            | Self::Unpause { .. }
            | Self::Stop { .. }
            | Self::StartFromCheckpoint { .. }
            | Self::Remove { .. } => 204,
        }
    }

    /// The HTTP method and path this call maps to.
    pub fn method_and_path(&self) -> (&'static str, String) {
        match self {
            Self::Launch { name, application } => ("POST", format!("/containers?name={name}&image={application}")),
            Self::Checkpoint { name } => ("POST", format!("/containers/{name}/checkpoints")),
            Self::Pause { name } => ("POST", format!("/containers/{name}/pause")),
            Self::Unpause { name } => ("POST", format!("/containers/{name}/unpause")),
            Self::Stop { name } => ("POST", format!("/containers/{name}/stop")),
            Self::StartFromCheckpoint {
                name,
                checkpoint_id,
            } => (
                "POST",
                format!("/containers/{name}/start?checkpoint={checkpoint_id}"),
            ),
            Self::Remove { name } => ("DELETE", format!("/containers/{name}?force=true")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::RuntimeCall;

    // ── 1. checkpoint expects 201, everything else expects 204 ──
    #[test]
    fn checkpoint_expects_201_others_expect_204() {
        assert_eq!(
            RuntimeCall::Checkpoint {
                name: "c0".into()
            }
            .expected_status(),
            201
        );
        assert_eq!(
            RuntimeCall::Remove {
                name: "c0".into()
            }
            .expected_status(),
            204
        );
    }

    // ── 2. start-from-checkpoint encodes the checkpoint id as a query param ──
    #[test]
    fn start_from_checkpoint_path() {
        let call = RuntimeCall::StartFromCheckpoint {
            name: "c0".into(),
            checkpoint_id: "chk-1".into(),
        };
        let (method, path) = call.method_and_path();
        assert_eq!(method, "POST");
        assert_eq!(path, "/containers/c0/start?checkpoint=chk-1");
    }
}
