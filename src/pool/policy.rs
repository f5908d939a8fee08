//! Lost-connection policies.
//!
//! When a controller loses its connection it asks the pool's policy what to
//! do next. Remote servers get a decision ([`Action`]); local servers are
//! assumed to always be reachable, so the policy is only informed.
//!
//! A user policy may panic or abstain by returning `None`. Either way the
//! pool's default policy is consulted instead, and if that fails too the
//! controller reconnects.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};

use tracing::warn;

use crate::server::ServerKey;

/// Why a connection was lost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Grounds {
    /// An open connection was closed by the peer or the network.
    UnexpectedDisconnect,
    /// A connect attempt failed.
    FailedConnection,
    /// The server did not answer within the response timeout.
    ResponseTimeout,
}

impl fmt::Display for Grounds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Grounds::UnexpectedDisconnect => "unexpected disconnect",
            Grounds::FailedConnection => "failed connection",
            Grounds::ResponseTimeout => "response timeout",
        };
        f.write_str(name)
    }
}

/// What to do with a remote server after a lost connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    /// Remove the server from the pool.
    Drop,
    /// Wait for the reconnect period, then try again.
    Reconnect,
}

/// Decides how the pool reacts to lost connections.
pub trait LostConnectionPolicy: Send + Sync {
    /// A connection to a remote server was lost. Returning `None` defers to
    /// the pool's default policy.
    fn lost_remote_server(&self, server: &ServerKey, grounds: Grounds) -> Option<Action>;

    /// A connection to an in-process server was lost.
    fn lost_local_server(&self, server: &ServerKey, grounds: Grounds) {
        let _ = (server, grounds);
    }
}

impl<F> LostConnectionPolicy for F
where
    F: Fn(&ServerKey, Grounds) -> Option<Action> + Send + Sync,
{
    fn lost_remote_server(&self, server: &ServerKey, grounds: Grounds) -> Option<Action> {
        self(server, grounds)
    }
}

/// Always reconnects.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultPolicy;

impl LostConnectionPolicy for DefaultPolicy {
    fn lost_remote_server(&self, _server: &ServerKey, _grounds: Grounds) -> Option<Action> {
        Some(Action::Reconnect)
    }
}

/// Ask `policy`, falling back to `default`, then to [`Action::Reconnect`].
pub(crate) fn resolve(
    policy: Option<&dyn LostConnectionPolicy>,
    default: &dyn LostConnectionPolicy,
    server: &ServerKey,
    grounds: Grounds,
) -> Action {
    if let Some(policy) = policy {
        match catch_unwind(AssertUnwindSafe(|| policy.lost_remote_server(server, grounds))) {
            Ok(Some(action)) => return action,
            Ok(None) => {}
            Err(_) => warn!(%server, %grounds, "lost-connection policy panicked"),
        }
    }

    match catch_unwind(AssertUnwindSafe(|| default.lost_remote_server(server, grounds))) {
        Ok(Some(action)) => action,
        Ok(None) => Action::Reconnect,
        Err(_) => {
            warn!(%server, %grounds, "default lost-connection policy panicked");
            Action::Reconnect
        }
    }
}

/// Inform `policy` about a lost local server, containing any panic.
pub(crate) fn inform_local(policy: &dyn LostConnectionPolicy, server: &ServerKey, grounds: Grounds) {
    if catch_unwind(AssertUnwindSafe(|| policy.lost_local_server(server, grounds))).is_err() {
        warn!(%server, %grounds, "lost-connection policy panicked");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> ServerKey {
        ServerKey::Remote("127.0.0.1:4730".parse().unwrap())
    }

    #[test]
    fn test_user_policy_wins() {
        let drop_all = |_: &ServerKey, _: Grounds| -> Option<Action> { Some(Action::Drop) };
        assert_eq!(
            resolve(Some(&drop_all), &DefaultPolicy, &key(), Grounds::FailedConnection),
            Action::Drop
        );
    }

    #[test]
    fn test_abstaining_policy_falls_back() {
        let abstain = |_: &ServerKey, _: Grounds| -> Option<Action> { None };
        let default = |_: &ServerKey, _: Grounds| -> Option<Action> { Some(Action::Drop) };
        assert_eq!(
            resolve(Some(&abstain), &default, &key(), Grounds::ResponseTimeout),
            Action::Drop
        );
    }

    #[test]
    fn test_panicking_policy_falls_back() {
        let panicking = |_: &ServerKey, _: Grounds| -> Option<Action> { panic!("policy bug") };
        assert_eq!(
            resolve(
                Some(&panicking),
                &DefaultPolicy,
                &key(),
                Grounds::UnexpectedDisconnect
            ),
            Action::Reconnect
        );
    }

    #[test]
    fn test_broken_default_reconnects() {
        let abstain = |_: &ServerKey, _: Grounds| -> Option<Action> { None };
        assert_eq!(
            resolve(None, &abstain, &key(), Grounds::FailedConnection),
            Action::Reconnect
        );
    }

    #[test]
    fn test_grounds_display() {
        assert_eq!(Grounds::ResponseTimeout.to_string(), "response timeout");
    }
}
