//! Server channel tree, kept in sync from `ChannelState` / `ChannelRemove`.

use std::collections::{BTreeMap, BTreeSet};

use mumble_proto::msgs;

/// Id of the root channel on every server.
pub const ROOT_CHANNEL_ID: u32 = 0;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Channel {
    pub id: u32,
    /// `None` only for the root channel.
    pub parent: Option<u32>,
    pub name: String,
    pub description: Option<String>,
    pub position: i32,
    pub temporary: bool,
    pub max_users: Option<u32>,
    pub links: BTreeSet<u32>,
}

impl Channel {
    fn new(id: u32) -> Self {
        Self {
            id,
            parent: None,
            name: String::new(),
            description: None,
            position: 0,
            temporary: false,
            max_users: None,
            links: BTreeSet::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelChange {
    Created,
    Updated,
    Removed,
}

#[derive(Debug, Clone, Default)]
pub struct ChannelTree {
    channels: BTreeMap<u32, Channel>,
}

impl ChannelTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge a `ChannelState` message. Only fields present in the message are changed.
    ///
    /// Returns the updated channel and whether it was new. Messages without a channel id are
    /// ignored.
    pub fn apply_state(&mut self, msg: &msgs::ChannelState) -> Option<(Channel, ChannelChange)> {
        let id = msg.channel_id?;
        let created = !self.channels.contains_key(&id);
        let channel = self.channels.entry(id).or_insert_with(|| Channel::new(id));

        if let Some(parent) = msg.parent {
            channel.parent = (id != ROOT_CHANNEL_ID).then_some(parent);
        }
        if let Some(name) = &msg.name {
            channel.name = name.clone();
        }
        if let Some(description) = &msg.description {
            channel.description = Some(description.clone());
        }
        if let Some(position) = msg.position {
            channel.position = position;
        }
        if let Some(temporary) = msg.temporary {
            channel.temporary = temporary;
        }
        if let Some(max_users) = msg.max_users {
            channel.max_users = (max_users > 0).then_some(max_users);
        }
        if !msg.links.is_empty() {
            channel.links = msg.links.iter().copied().collect();
        }
        for link in &msg.links_add {
            channel.links.insert(*link);
        }
        for link in &msg.links_remove {
            channel.links.remove(link);
        }

        let change = if created {
            ChannelChange::Created
        } else {
            ChannelChange::Updated
        };
        Some((channel.clone(), change))
    }

    /// Drop a channel. Links pointing at it are removed from the remaining channels.
    pub fn remove(&mut self, id: u32) -> Option<Channel> {
        let removed = self.channels.remove(&id)?;
        for channel in self.channels.values_mut() {
            channel.links.remove(&id);
        }
        Some(removed)
    }

    pub fn get(&self, id: u32) -> Option<&Channel> {
        self.channels.get(&id)
    }

    pub fn root(&self) -> Option<&Channel> {
        self.get(ROOT_CHANNEL_ID)
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Direct children of `id`, in the order the server asks clients to display them.
    pub fn children(&self, id: u32) -> Vec<&Channel> {
        let mut out: Vec<&Channel> = self
            .channels
            .values()
            .filter(|c| c.parent == Some(id))
            .collect();
        out.sort_by(|a, b| a.position.cmp(&b.position).then_with(|| a.name.cmp(&b.name)));
        out
    }

    /// Walk from the root, matching each path segment against child channel names.
    ///
    /// An empty path resolves to the root. Names must match exactly.
    pub fn find<S: AsRef<str>>(&self, path: &[S]) -> Option<&Channel> {
        let mut current = self.root()?;
        for name in path {
            let name = name.as_ref();
            current = self
                .channels
                .values()
                .find(|c| c.parent == Some(current.id) && c.name == name)?;
        }
        Some(current)
    }

    /// Names from the root's child down to `id`. The root itself has an empty path.
    pub fn path_of(&self, id: u32) -> Option<Vec<String>> {
        let mut names = Vec::new();
        let mut current = self.get(id)?;
        while let Some(parent) = current.parent {
            names.push(current.name.clone());
            current = self.get(parent)?;
            if names.len() > self.channels.len() {
                // cycle in server data
                return None;
            }
        }
        names.reverse();
        Some(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(id: u32, parent: Option<u32>, name: &str) -> msgs::ChannelState {
        msgs::ChannelState {
            channel_id: Some(id),
            parent,
            name: Some(name.to_string()),
            ..Default::default()
        }
    }

    fn sample_tree() -> ChannelTree {
        let mut tree = ChannelTree::new();
        tree.apply_state(&state(0, None, "Root"));
        tree.apply_state(&state(1, Some(0), "Team"));
        tree.apply_state(&state(2, Some(1), "Voice"));
        tree.apply_state(&state(3, Some(0), "Lobby"));
        tree.apply_state(&state(4, Some(3), "Voice"));
        tree
    }

    #[test]
    fn find_descends_by_name() {
        let tree = sample_tree();
        assert_eq!(tree.find(&["Team", "Voice"]).map(|c| c.id), Some(2));
        assert_eq!(tree.find(&["Lobby", "Voice"]).map(|c| c.id), Some(4));
        assert_eq!(tree.find::<&str>(&[]).map(|c| c.id), Some(0));
    }

    #[test]
    fn find_returns_none_for_unknown_segment() {
        let tree = sample_tree();
        assert!(tree.find(&["Team", "Music"]).is_none());
        assert!(tree.find(&["team"]).is_none());
        assert!(tree.find(&["Voice"]).is_none());
    }

    #[test]
    fn find_on_empty_tree_is_none() {
        let tree = ChannelTree::new();
        assert!(tree.find(&["Team"]).is_none());
    }

    #[test]
    fn remove_drops_channel_and_links() {
        let mut tree = sample_tree();
        tree.apply_state(&msgs::ChannelState {
            channel_id: Some(3),
            links_add: vec![1],
            ..Default::default()
        });
        assert!(tree.get(3).unwrap().links.contains(&1));

        let removed = tree.remove(1).unwrap();
        assert_eq!(removed.name, "Team");
        assert!(tree.find(&["Team"]).is_none());
        assert!(tree.get(3).unwrap().links.is_empty());
    }

    #[test]
    fn apply_state_merges_partial_updates() {
        let mut tree = sample_tree();
        let (ch, change) = tree
            .apply_state(&msgs::ChannelState {
                channel_id: Some(2),
                description: Some("talk here".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(change, ChannelChange::Updated);
        assert_eq!(ch.name, "Voice");
        assert_eq!(ch.parent, Some(1));
        assert_eq!(ch.description.as_deref(), Some("talk here"));
    }

    #[test]
    fn apply_state_without_id_is_ignored() {
        let mut tree = ChannelTree::new();
        assert!(tree.apply_state(&msgs::ChannelState::default()).is_none());
        assert!(tree.is_empty());
    }

    #[test]
    fn children_sorted_by_position_then_name() {
        let mut tree = sample_tree();
        tree.apply_state(&msgs::ChannelState {
            channel_id: Some(3),
            position: Some(-1),
            ..Default::default()
        });
        let names: Vec<&str> = tree.children(0).iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["Lobby", "Team"]);
    }

    #[test]
    fn path_of_walks_to_root() {
        let tree = sample_tree();
        assert_eq!(tree.path_of(2), Some(vec!["Team".to_string(), "Voice".to_string()]));
        assert_eq!(tree.path_of(0), Some(Vec::new()));
        assert_eq!(tree.path_of(99), None);
    }
}
