//! Optional roster tracking.
//!
//! When enabled in [`ClientConfig`](crate::ClientConfig), the connection
//! task feeds every broadcast event through a [`RosterTracker`] before
//! publishing it. The tracker keeps the latest groups and friends, plus
//! whatever user profiles JID-info lookups have returned. Callers only
//! ever see a [`TrackedRoster`] snapshot.

use kikwire_protocol::requests;
use kikwire_protocol::{Group, Jid, Request, User};
use serde::{Deserialize, Serialize};

use crate::ClientEvent;

/// Snapshot of the tracked roster state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedRoster {
    /// Groups from the latest roster, in roster order.
    pub groups: Vec<Group>,
    /// Friends from the latest roster (only with `track_friend_info`).
    pub friends: Vec<User>,
    /// Users returned by JID-info lookups (only with `track_user_info`).
    pub users: Vec<User>,
}

/// Applies broadcast events to a [`TrackedRoster`].
///
/// Not reset on reconnect: the state lives as long as the client.
pub struct RosterTracker {
    roster: TrackedRoster,
    track_user_info: bool,
    track_friend_info: bool,
}

impl RosterTracker {
    pub fn new(track_user_info: bool, track_friend_info: bool) -> Self {
        Self {
            roster: TrackedRoster::default(),
            track_user_info,
            track_friend_info,
        }
    }

    pub fn snapshot(&self) -> TrackedRoster {
        self.roster.clone()
    }

    /// Updates the tracked state from one event.
    ///
    /// Returns the JID-info lookups to send: one per non-empty group on
    /// every roster, when `track_user_info` is on. Their replies come
    /// back as [`ClientEvent::JidInfoReceived`].
    pub fn apply(&mut self, event: &ClientEvent) -> Vec<Request> {
        match event {
            ClientEvent::RosterReceived { groups, friends } => {
                self.roster.groups = groups.clone();
                if self.track_friend_info {
                    self.roster.friends = friends.clone();
                }
                if !self.track_user_info {
                    return Vec::new();
                }
                groups
                    .iter()
                    .filter(|g| !g.users.is_empty())
                    .map(|g| requests::get_jid_info(&g.users))
                    .collect()
            }
            ClientEvent::JidInfoReceived { users } if self.track_user_info => {
                self.roster.users.extend(users.iter().cloned());
                Vec::new()
            }
            ClientEvent::UserLeftGroup { group, user } => {
                self.remove_member(group, user);
                Vec::new()
            }
            _ => Vec::new(),
        }
    }

    // Removal is keyed by JID, from both the user list and the group.
    fn remove_member(&mut self, group: &Jid, user: &Jid) {
        self.roster.users.retain(|u| &u.jid != user);
        if let Some(g) = self.roster.groups.iter_mut().find(|g| &g.jid == group) {
            g.users.retain(|m| m != user);
        }
        tracing::debug!(%group, %user, "user left group");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roster_event() -> ClientEvent {
        ClientEvent::RosterReceived {
            groups: vec![Group::new(
                "g1@groups.kik.com",
                vec![Jid::from("u1"), Jid::from("u2")],
            )],
            friends: vec![User::from_jid("u3")],
        }
    }

    #[test]
    fn test_roster_replaces_groups_and_requests_member_info() {
        let mut tracker = RosterTracker::new(true, true);
        let lookups = tracker.apply(&roster_event());

        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.groups.len(), 1);
        assert_eq!(snapshot.groups[0].users, vec![Jid::from("u1"), Jid::from("u2")]);
        assert_eq!(snapshot.friends, vec![User::from_jid("u3")]);

        assert_eq!(lookups.len(), 1);
        let items: Vec<_> = lookups[0]
            .stanza
            .find("query")
            .map(|q| q.children_named("item").filter_map(|i| i.get_attr("jid")).collect())
            .unwrap_or_default();
        assert_eq!(items, vec!["u1", "u2"]);
    }

    #[test]
    fn test_roster_without_user_tracking_issues_no_lookups() {
        let mut tracker = RosterTracker::new(false, false);
        assert!(tracker.apply(&roster_event()).is_empty());
        assert!(tracker.snapshot().friends.is_empty());
        assert_eq!(tracker.snapshot().groups.len(), 1);
    }

    #[test]
    fn test_empty_groups_are_not_looked_up() {
        let mut tracker = RosterTracker::new(true, false);
        let event = ClientEvent::RosterReceived {
            groups: vec![Group::new("g2@groups.kik.com", vec![])],
            friends: vec![],
        };
        assert!(tracker.apply(&event).is_empty());
    }

    #[test]
    fn test_jid_info_appends_users() {
        let mut tracker = RosterTracker::new(true, false);
        tracker.apply(&ClientEvent::JidInfoReceived {
            users: vec![User::from_jid("u1")],
        });
        tracker.apply(&ClientEvent::JidInfoReceived {
            users: vec![User::from_jid("u2")],
        });
        assert_eq!(tracker.snapshot().users.len(), 2);
    }

    #[test]
    fn test_user_left_group_removes_by_jid() {
        let mut tracker = RosterTracker::new(true, false);
        tracker.apply(&roster_event());
        tracker.apply(&ClientEvent::JidInfoReceived {
            users: vec![User::from_jid("u1"), User::from_jid("u2")],
        });

        tracker.apply(&ClientEvent::UserLeftGroup {
            group: Jid::from("g1@groups.kik.com"),
            user: Jid::from("u1"),
        });

        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.users, vec![User::from_jid("u2")]);
        assert_eq!(snapshot.groups[0].users, vec![Jid::from("u2")]);
    }

    #[test]
    fn test_user_left_unknown_group_is_harmless() {
        let mut tracker = RosterTracker::new(true, false);
        tracker.apply(&ClientEvent::UserLeftGroup {
            group: Jid::from("nope@groups.kik.com"),
            user: Jid::from("u9"),
        });
        assert_eq!(tracker.snapshot(), TrackedRoster::default());
    }
}
