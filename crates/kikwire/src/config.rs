//! Client configuration.

use std::time::Duration;

use kikwire_protocol::Credentials;

// ---------------------------------------------------------------------------
// ClientConfig
// ---------------------------------------------------------------------------

/// Configuration for a [`KikClient`](crate::KikClient).
///
/// Built with [`KikClientBuilder`](crate::KikClientBuilder) in most
/// code; the fields are public so a whole config can also be assembled
/// and passed in at once.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Account to log in as. The username doubles as the session-store
    /// key.
    pub credentials: Credentials,

    /// How long a request may wait for its reply before failing with
    /// [`RequestError::Timeout`](crate::RequestError::Timeout).
    ///
    /// Default: 75 seconds.
    pub request_timeout: Duration,

    /// How often pending requests are checked against `request_timeout`.
    ///
    /// Default: 1 second.
    pub sweep_interval: Duration,

    /// Track group members: on every roster, look up each group's member
    /// JIDs and keep the results in [`TrackedRoster::users`](crate::TrackedRoster::users).
    pub track_user_info: bool,

    /// Track friends: keep the latest roster's friend list in
    /// [`TrackedRoster::friends`](crate::TrackedRoster::friends).
    pub track_friend_info: bool,

    /// Ask for the roster as soon as authentication succeeds. The reply
    /// is broadcast as [`ClientEvent::RosterReceived`](crate::ClientEvent::RosterReceived).
    ///
    /// Default: true.
    pub fetch_roster_on_login: bool,

    /// Capacity of the broadcast event channel. Subscribers that fall
    /// further behind than this skip events.
    ///
    /// Default: 100.
    pub event_capacity: usize,

    /// Capacity of the command channel between handles and the
    /// connection task.
    ///
    /// Default: 64.
    pub command_capacity: usize,
}

impl ClientConfig {
    /// Default settings for the given account.
    pub fn new(credentials: Credentials) -> Self {
        Self {
            credentials,
            ..Self::default()
        }
    }

    /// The session-store key for this account.
    pub fn account(&self) -> &str {
        &self.credentials.username
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            credentials: Credentials::default(),
            request_timeout: Duration::from_secs(75),
            sweep_interval: Duration::from_secs(1),
            track_user_info: false,
            track_friend_info: false,
            fetch_roster_on_login: true,
            event_capacity: 100,
            command_capacity: 64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        let config = ClientConfig::default();
        assert_eq!(config.request_timeout, Duration::from_secs(75));
        assert_eq!(config.sweep_interval, Duration::from_secs(1));
        assert!(config.fetch_roster_on_login);
        assert!(!config.track_user_info);
        assert!(!config.track_friend_info);
        assert_eq!(config.event_capacity, 100);
        assert_eq!(config.command_capacity, 64);
    }

    #[test]
    fn test_new_keeps_defaults_and_sets_account() {
        let config = ClientConfig::new(Credentials::new("alice", "pw"));
        assert_eq!(config.account(), "alice");
        assert_eq!(config.request_timeout, Duration::from_secs(75));
    }
}
