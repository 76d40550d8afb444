//! Worker-handshake environment variables and the process-role discriminator
//!
//! The supervisor tells each child its role through three environment
//! variables. A child treats the id and port variables as a single handshake:
//! both present and parsing as non-negative integers means worker mode,
//! anything else means supervisor mode. The variables are read once at
//! program entry; children never re-enter supervisor mode.

use std::env;

/// Stable worker id, set by the supervisor
pub const ENV_PROCESS_ID: &str = "UTOPIA_PROCESS_ID";
/// TCP port the child must bind, set by the supervisor
pub const ENV_WORKER_PORT: &str = "UTOPIA_WORKER_PORT";
/// Marks the child as a worker for introspection
pub const ENV_SCALING_MODE: &str = "UTOPIA_SCALING_MODE";
/// The value `ENV_SCALING_MODE` carries in worker processes
pub const WORKER_MODE: &str = "worker";

/// Handshake values handed to a worker process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerEnv {
    pub process_id: u32,
    pub port: u16,
}

/// Role this process runs as, decided once at program entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessRole {
    Supervisor,
    Worker(WorkerEnv),
}

impl ProcessRole {
    /// Inspect the handshake environment and decide the process role
    pub fn detect() -> Self {
        let id = env::var(ENV_PROCESS_ID).ok();
        let port = env::var(ENV_WORKER_PORT).ok();
        Self::from_parts(id.as_deref(), port.as_deref())
    }

    fn from_parts(id: Option<&str>, port: Option<&str>) -> Self {
        match (
            id.and_then(|v| v.parse::<u32>().ok()),
            port.and_then(|v| v.parse::<u16>().ok()),
        ) {
            (Some(process_id), Some(port)) => ProcessRole::Worker(WorkerEnv { process_id, port }),
            _ => ProcessRole::Supervisor,
        }
    }
}

/// Read-only snapshot of the handshake environment, queryable by hosted
/// worker code
#[derive(Debug, Clone)]
pub struct Handshake {
    mode: Option<String>,
    process_id: Option<u32>,
    worker_port: Option<u16>,
}

impl Handshake {
    pub fn from_env() -> Self {
        Self::from_parts(
            env::var(ENV_SCALING_MODE).ok(),
            env::var(ENV_PROCESS_ID).ok().as_deref(),
            env::var(ENV_WORKER_PORT).ok().as_deref(),
        )
    }

    fn from_parts(mode: Option<String>, id: Option<&str>, port: Option<&str>) -> Self {
        Self {
            mode,
            process_id: id.and_then(|v| v.parse().ok()),
            worker_port: port.and_then(|v| v.parse().ok()),
        }
    }

    /// True iff the scaling-mode variable is set at all
    pub fn is_cluster_mode(&self) -> bool {
        self.mode.is_some()
    }

    /// True iff this process was spawned as a cluster worker
    pub fn is_worker(&self) -> bool {
        self.mode.as_deref() == Some(WORKER_MODE)
    }

    pub fn worker_port(&self) -> Option<u16> {
        self.worker_port
    }

    pub fn process_id(&self) -> Option<u32> {
        self.process_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_role_requires_both_variables() {
        assert_eq!(
            ProcessRole::from_parts(Some("2"), Some("8082")),
            ProcessRole::Worker(WorkerEnv {
                process_id: 2,
                port: 8082
            })
        );
        assert_eq!(
            ProcessRole::from_parts(Some("2"), None),
            ProcessRole::Supervisor
        );
        assert_eq!(
            ProcessRole::from_parts(None, Some("8082")),
            ProcessRole::Supervisor
        );
        assert_eq!(ProcessRole::from_parts(None, None), ProcessRole::Supervisor);
    }

    #[test]
    fn test_non_numeric_values_fall_back_to_supervisor() {
        assert_eq!(
            ProcessRole::from_parts(Some("abc"), Some("8082")),
            ProcessRole::Supervisor
        );
        assert_eq!(
            ProcessRole::from_parts(Some("0"), Some("not-a-port")),
            ProcessRole::Supervisor
        );
        // Negative integers do not parse as unsigned
        assert_eq!(
            ProcessRole::from_parts(Some("-1"), Some("8082")),
            ProcessRole::Supervisor
        );
    }

    #[test]
    fn test_id_zero_is_a_valid_worker() {
        assert_eq!(
            ProcessRole::from_parts(Some("0"), Some("3000")),
            ProcessRole::Worker(WorkerEnv {
                process_id: 0,
                port: 3000
            })
        );
    }

    #[test]
    fn test_handshake_introspection() {
        let hs = Handshake::from_parts(Some(WORKER_MODE.to_string()), Some("1"), Some("3001"));
        assert!(hs.is_cluster_mode());
        assert!(hs.is_worker());
        assert_eq!(hs.process_id(), Some(1));
        assert_eq!(hs.worker_port(), Some(3001));
    }

    #[test]
    fn test_handshake_outside_cluster() {
        let hs = Handshake::from_parts(None, None, None);
        assert!(!hs.is_cluster_mode());
        assert!(!hs.is_worker());
        assert_eq!(hs.process_id(), None);
        assert_eq!(hs.worker_port(), None);
    }

    #[test]
    fn test_cluster_mode_with_unexpected_value() {
        // Any value marks cluster mode; only the worker literal marks a worker
        let hs = Handshake::from_parts(Some("primary".to_string()), None, None);
        assert!(hs.is_cluster_mode());
        assert!(!hs.is_worker());
    }
}
