//! Connected users, kept in sync from `UserState` / `UserRemove`.

use std::collections::BTreeMap;

use mumble_proto::msgs;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct User {
    pub session: u32,
    /// Registered user id; `None` for unregistered users.
    pub user_id: Option<u32>,
    pub name: String,
    pub channel_id: u32,
    pub mute: bool,
    pub deaf: bool,
    pub suppress: bool,
    pub self_mute: bool,
    pub self_deaf: bool,
    pub priority_speaker: bool,
    pub recording: bool,
    pub comment: Option<String>,
    pub hash: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserChange {
    Connected,
    Moved { from: u32, to: u32 },
    Updated,
    Disconnected,
}

#[derive(Debug, Clone, Default)]
pub struct Users {
    by_session: BTreeMap<u32, User>,
}

impl Users {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge a `UserState` message. Only fields present in the message are changed.
    pub fn apply_state(&mut self, msg: &msgs::UserState) -> Option<(User, UserChange)> {
        let session = msg.session?;
        let created = !self.by_session.contains_key(&session);
        let user = self.by_session.entry(session).or_insert_with(|| User {
            session,
            ..Default::default()
        });
        let previous_channel = user.channel_id;

        if let Some(name) = &msg.name {
            user.name = name.clone();
        }
        if let Some(user_id) = msg.user_id {
            user.user_id = Some(user_id);
        }
        if let Some(channel_id) = msg.channel_id {
            user.channel_id = channel_id;
        }
        if let Some(v) = msg.mute {
            user.mute = v;
        }
        if let Some(v) = msg.deaf {
            user.deaf = v;
        }
        if let Some(v) = msg.suppress {
            user.suppress = v;
        }
        if let Some(v) = msg.self_mute {
            user.self_mute = v;
        }
        if let Some(v) = msg.self_deaf {
            user.self_deaf = v;
        }
        if let Some(v) = msg.priority_speaker {
            user.priority_speaker = v;
        }
        if let Some(v) = msg.recording {
            user.recording = v;
        }
        if let Some(comment) = &msg.comment {
            user.comment = Some(comment.clone());
        }
        if let Some(hash) = &msg.hash {
            user.hash = Some(hash.clone());
        }

        let change = if created {
            UserChange::Connected
        } else if user.channel_id != previous_channel {
            UserChange::Moved {
                from: previous_channel,
                to: user.channel_id,
            }
        } else {
            UserChange::Updated
        };
        Some((user.clone(), change))
    }

    pub fn remove(&mut self, session: u32) -> Option<User> {
        self.by_session.remove(&session)
    }

    pub fn get(&self, session: u32) -> Option<&User> {
        self.by_session.get(&session)
    }

    pub fn all(&self) -> Vec<User> {
        self.by_session.values().cloned().collect()
    }

    pub fn in_channel(&self, channel_id: u32) -> Vec<&User> {
        self.by_session
            .values()
            .filter(|u| u.channel_id == channel_id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.by_session.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_session.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_state_connects_user_in_root() {
        let mut users = Users::new();
        let (user, change) = users
            .apply_state(&msgs::UserState {
                session: Some(5),
                name: Some("alice".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(change, UserChange::Connected);
        assert_eq!(user.name, "alice");
        assert_eq!(user.channel_id, 0);
    }

    #[test]
    fn channel_change_reports_move() {
        let mut users = Users::new();
        users.apply_state(&msgs::UserState {
            session: Some(5),
            channel_id: Some(1),
            ..Default::default()
        });
        let (_, change) = users
            .apply_state(&msgs::UserState {
                session: Some(5),
                channel_id: Some(4),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(change, UserChange::Moved { from: 1, to: 4 });
        assert_eq!(users.in_channel(4).len(), 1);
        assert!(users.in_channel(1).is_empty());
    }

    #[test]
    fn partial_update_keeps_other_fields() {
        let mut users = Users::new();
        users.apply_state(&msgs::UserState {
            session: Some(2),
            name: Some("bob".to_string()),
            self_mute: Some(true),
            ..Default::default()
        });
        let (user, change) = users
            .apply_state(&msgs::UserState {
                session: Some(2),
                self_deaf: Some(true),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(change, UserChange::Updated);
        assert_eq!(user.name, "bob");
        assert!(user.self_mute);
        assert!(user.self_deaf);
    }

    #[test]
    fn remove_forgets_user() {
        let mut users = Users::new();
        users.apply_state(&msgs::UserState {
            session: Some(9),
            ..Default::default()
        });
        assert_eq!(users.remove(9).map(|u| u.session), Some(9));
        assert!(users.get(9).is_none());
        assert!(users.remove(9).is_none());
    }
}
