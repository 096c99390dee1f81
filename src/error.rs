use serde_derive::{Deserialize, Serialize};

/// A conclave error. Errors are serializable since they may be returned
/// across the network inside response messages.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Error {
    /// The operation was aborted because the engine or role shut down. The
    /// caller should retry against the cluster.
    Abort,
    /// The caller's view of the world is stale: it acted under a term or
    /// vote that has since moved on. Never retried blindly.
    Concurrency(String),
    /// Invalid or inconsistent internal data, e.g. a divergent log or a
    /// snapshot the local node cannot reconcile. Fatal to the current role.
    InvalidData(String),
    /// Invalid caller input, e.g. a topology change naming an unknown node.
    /// Rejected synchronously, no state is mutated.
    InvalidInput(String),
    /// An IO error: network, storage, or a timeout. Transient; the engine
    /// retries via its normal timeout/reconnection cycle.
    IO(String),
    /// The local node lost (or never had) leadership. Carries the recorded
    /// step-down reason, propagated to all in-flight proposals.
    LostLeadership(String),
    /// The request requires an active leader role on the local node.
    NotLeader,
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Abort => write!(f, "operation aborted"),
            Error::Concurrency(msg) => write!(f, "concurrency conflict: {msg}"),
            Error::InvalidData(msg) => write!(f, "invalid data: {msg}"),
            Error::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            Error::IO(msg) => write!(f, "io error: {msg}"),
            Error::LostLeadership(msg) => write!(f, "leadership lost: {msg}"),
            Error::NotLeader => write!(f, "not the leader"),
        }
    }
}

/// Constructs an Error::InvalidData via format!() and into().
#[macro_export]
macro_rules! errdata {
    ($($args:tt)*) => { $crate::error::Error::InvalidData(format!($($args)*)).into() };
}

/// Constructs an Error::InvalidInput via format!() and into().
#[macro_export]
macro_rules! errinput {
    ($($args:tt)*) => { $crate::error::Error::InvalidInput(format!($($args)*)).into() };
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IO(err.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::InvalidData(err.to_string())
    }
}

impl From<std::net::AddrParseError> for Error {
    fn from(err: std::net::AddrParseError) -> Self {
        Error::InvalidInput(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        // A panic while holding the engine lock means shared state may be
        // inconsistent, so treat it as fatal data corruption.
        Error::InvalidData(format!("lock poisoned: {err}"))
    }
}

impl<T> From<crossbeam::channel::SendError<T>> for Error {
    fn from(_: crossbeam::channel::SendError<T>) -> Self {
        // The receiving end is gone, i.e. the role was disposed.
        Error::Abort
    }
}

impl From<crossbeam::channel::RecvError> for Error {
    fn from(_: crossbeam::channel::RecvError) -> Self {
        Error::Abort
    }
}

/// A conclave result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn macros() {
        let data: Error = errdata!("entry {} truncated", 7);
        assert_eq!(data, Error::InvalidData("entry 7 truncated".to_string()));

        let input: Error = errinput!("unknown node {}", "X");
        assert_eq!(input, Error::InvalidInput("unknown node X".to_string()));
    }

    #[test]
    fn display() {
        assert_eq!(Error::NotLeader.to_string(), "not the leader");
        assert_eq!(
            Error::LostLeadership("vote of no confidence".to_string()).to_string(),
            "leadership lost: vote of no confidence"
        );
    }
}
