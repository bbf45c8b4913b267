//! The channel tree and the ACL evaluator that walks it.
//!
//! Channels refer to each other (and to their occupants) by id only; the
//! tree owns the nodes and every lookup goes through it. Links may form an
//! arbitrary graph and are stored as a symmetric edge set keyed by id.

use std::collections::HashMap;
use std::collections::HashSet;
use thiserror::Error;

use crate::server::acl::AclEntry;
use crate::server::acl::AclSet;
use crate::server::acl::AclSubject;
use crate::server::acl::Permission;

/// Id of the root channel; it always exists.
pub const ROOT_CHANNEL_ID: u32 = 0;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TreeError {
    #[error("no such channel: {0}")]
    NotFound(u32),
    #[error("the root channel cannot be removed or moved")]
    RootImmutable,
    #[error("move would create a cycle")]
    WouldCycle,
}

/// One node of the channel tree.
#[derive(Clone, Debug)]
pub struct Channel {
    pub id: u32,
    pub name: String,
    pub parent: Option<u32>,
    pub children: Vec<u32>,
    pub links: HashSet<u32>,
    pub position: i32,
    pub temporary: bool,
    pub max_users: u32,
    /// Blob store key of the description, if one is set.
    pub description_blob: Option<String>,
    pub acl: AclSet,
    /// Sessions currently in this channel. The client side holds the
    /// authoritative channel reference; this is the reverse index.
    pub members: HashSet<u32>,
}

impl Channel {
    fn new(id: u32, name: &str, parent: Option<u32>) -> Self {
        Channel {
            id,
            name: name.to_owned(),
            parent,
            children: Vec::new(),
            links: HashSet::new(),
            position: 0,
            temporary: false,
            max_users: 0,
            description_blob: None,
            acl: AclSet::default(),
            members: HashSet::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// The channel tree of one virtual server.
#[derive(Debug)]
pub struct ChannelTree {
    channels: HashMap<u32, Channel>,
    next_id: u32,
}

impl Default for ChannelTree {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelTree {
    /// Creates a tree holding only the root channel.
    pub fn new() -> Self {
        let mut channels = HashMap::new();
        channels.insert(
            ROOT_CHANNEL_ID,
            Channel::new(ROOT_CHANNEL_ID, "Root", None),
        );
        ChannelTree {
            channels,
            next_id: 1,
        }
    }

    pub fn get(&self, id: u32) -> Option<&Channel> {
        self.channels.get(&id)
    }

    pub fn get_mut(&mut self, id: u32) -> Option<&mut Channel> {
        self.channels.get_mut(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Channel> {
        self.channels.values()
    }

    /// Creates a channel under `parent` and returns its id.
    pub fn add(&mut self, parent: u32, name: &str, temporary: bool) -> Result<u32, TreeError> {
        if !self.channels.contains_key(&parent) {
            return Err(TreeError::NotFound(parent));
        }
        let id = self.next_id;
        self.next_id += 1;
        let mut channel = Channel::new(id, name, Some(parent));
        channel.temporary = temporary;
        self.channels.insert(id, channel);
        self.channels
            .get_mut(&parent)
            .expect("parent checked above")
            .children
            .push(id);
        Ok(id)
    }

    /// Re-inserts a channel from a snapshot. Child lists are rebuilt
    /// afterwards with [ChannelTree::rebuild_children]; `next_id` is
    /// advanced past `id`.
    pub fn insert_thawed(&mut self, channel: Channel) {
        self.next_id = self.next_id.max(channel.id + 1);
        self.channels.insert(channel.id, channel);
    }

    /// Recomputes every child list from the parent fields. Channels whose
    /// parent is gone are reattached to the root.
    pub fn rebuild_children(&mut self) {
        let mut ids: Vec<u32> = self.channels.keys().copied().collect();
        ids.sort_unstable();
        for id in &ids {
            self.channels.get_mut(id).unwrap().children.clear();
        }
        for id in ids {
            let parent = match self.channels[&id].parent {
                Some(parent) => parent,
                None => continue,
            };
            let parent = if self.channels.contains_key(&parent) {
                parent
            } else {
                self.channels.get_mut(&id).unwrap().parent = Some(ROOT_CHANNEL_ID);
                ROOT_CHANNEL_ID
            };
            self.channels.get_mut(&parent).unwrap().children.push(id);
        }
    }

    /// Removes a channel and its whole subtree, returning the removed ids
    /// (children before parents). Occupants must have been moved out first.
    pub fn remove(&mut self, id: u32) -> Result<Vec<u32>, TreeError> {
        if id == ROOT_CHANNEL_ID {
            return Err(TreeError::RootImmutable);
        }
        if !self.channels.contains_key(&id) {
            return Err(TreeError::NotFound(id));
        }
        let mut removed = self.subtree(id);
        removed.reverse();
        for rid in &removed {
            if let Some(channel) = self.channels.remove(rid) {
                for linked in channel.links {
                    if let Some(other) = self.channels.get_mut(&linked) {
                        other.links.remove(rid);
                    }
                }
                if let Some(parent) = channel.parent {
                    if let Some(p) = self.channels.get_mut(&parent) {
                        p.children.retain(|c| c != rid);
                    }
                }
            }
        }
        Ok(removed)
    }

    /// Moves a channel under a new parent, refusing cycles.
    pub fn move_channel(&mut self, id: u32, new_parent: u32) -> Result<(), TreeError> {
        if id == ROOT_CHANNEL_ID {
            return Err(TreeError::RootImmutable);
        }
        if !self.channels.contains_key(&id) {
            return Err(TreeError::NotFound(id));
        }
        if !self.channels.contains_key(&new_parent) {
            return Err(TreeError::NotFound(new_parent));
        }
        if id == new_parent || self.is_descendant(id, new_parent) {
            return Err(TreeError::WouldCycle);
        }
        let old_parent = self.channels[&id].parent;
        if let Some(old) = old_parent {
            if let Some(p) = self.channels.get_mut(&old) {
                p.children.retain(|c| *c != id);
            }
        }
        self.channels.get_mut(&new_parent).unwrap().children.push(id);
        self.channels.get_mut(&id).unwrap().parent = Some(new_parent);
        Ok(())
    }

    /// True if `channel` lies in the subtree rooted at `ancestor`.
    pub fn is_descendant(&self, ancestor: u32, channel: u32) -> bool {
        let mut cursor = self.channels.get(&channel).and_then(|c| c.parent);
        while let Some(id) = cursor {
            if id == ancestor {
                return true;
            }
            cursor = self.channels.get(&id).and_then(|c| c.parent);
        }
        false
    }

    /// Links two channels; the relation is symmetric.
    pub fn link(&mut self, a: u32, b: u32) -> Result<(), TreeError> {
        for id in [a, b] {
            if !self.channels.contains_key(&id) {
                return Err(TreeError::NotFound(id));
            }
        }
        if a != b {
            self.channels.get_mut(&a).unwrap().links.insert(b);
            self.channels.get_mut(&b).unwrap().links.insert(a);
        }
        Ok(())
    }

    pub fn unlink(&mut self, a: u32, b: u32) -> Result<(), TreeError> {
        for id in [a, b] {
            if !self.channels.contains_key(&id) {
                return Err(TreeError::NotFound(id));
            }
        }
        self.channels.get_mut(&a).unwrap().links.remove(&b);
        self.channels.get_mut(&b).unwrap().links.remove(&a);
        Ok(())
    }

    /// Transitive closure of the link relation, including `id` itself.
    pub fn all_links(&self, id: u32) -> HashSet<u32> {
        let mut seen = HashSet::new();
        let mut queue = vec![id];
        while let Some(current) = queue.pop() {
            if !seen.insert(current) {
                continue;
            }
            if let Some(channel) = self.channels.get(&current) {
                queue.extend(channel.links.iter().copied());
            }
        }
        seen
    }

    /// Ids of the subtree rooted at `id`, parents before children.
    pub fn subtree(&self, id: u32) -> Vec<u32> {
        let mut out = Vec::new();
        let mut queue = vec![id];
        while let Some(current) = queue.pop() {
            if let Some(channel) = self.channels.get(&current) {
                out.push(current);
                queue.extend(channel.children.iter().rev().copied());
            }
        }
        out
    }

    /// Depth-first order of the whole tree starting at the root, the order
    /// the channel tree is announced to a new client in.
    pub fn dfs_order(&self) -> Vec<u32> {
        self.subtree(ROOT_CHANNEL_ID)
    }

    /// Chain of channels from the root down to `id`.
    fn chain(&self, id: u32) -> Vec<u32> {
        let mut chain = Vec::new();
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            chain.push(current);
            cursor = self.channels.get(&current).and_then(|c| c.parent);
        }
        chain.reverse();
        chain
    }

    /// Records `session` as an occupant of `channel`.
    pub fn member_join(&mut self, channel: u32, session: u32) {
        if let Some(c) = self.channels.get_mut(&channel) {
            c.members.insert(session);
        }
    }

    pub fn member_leave(&mut self, channel: u32, session: u32) {
        if let Some(c) = self.channels.get_mut(&channel) {
            c.members.remove(&session);
        }
    }

    /// Empty temporary channels, candidates for reaping on the next tick.
    pub fn expired_temporary(&self) -> Vec<u32> {
        self.channels
            .values()
            .filter(|c| c.temporary && c.is_empty())
            .map(|c| c.id)
            .collect()
    }

    /// Computes the full permission mask of `subject` on `channel`.
    pub fn permissions(&self, channel: u32, subject: &AclSubject) -> Permission {
        if subject.is_superuser() {
            return Permission::ALL;
        }
        let chain = self.chain(channel);

        // Collect applicable entries root-first. A channel that does not
        // inherit drops everything gathered above it.
        let mut collected: Vec<(u32, &AclEntry)> = Vec::new();
        for id in &chain {
            let node = &self.channels[id];
            if !node.acl.inherit {
                collected.clear();
            }
            for entry in &node.acl.entries {
                collected.push((*id, entry));
            }
        }

        let mut granted = Permission::DEFAULT;
        for (origin, entry) in collected {
            let applies = if origin == channel {
                entry.apply_here
            } else {
                entry.apply_subs
            };
            if !applies || !self.entry_matches(entry, channel, subject) {
                continue;
            }
            granted = granted.deny(entry.deny).grant(entry.grant);
        }
        granted
    }

    /// Convenience wrapper over [ChannelTree::permissions].
    pub fn has_permission(&self, channel: u32, subject: &AclSubject, perm: Permission) -> bool {
        self.permissions(channel, subject).has(perm)
    }

    fn entry_matches(&self, entry: &AclEntry, channel: u32, subject: &AclSubject) -> bool {
        if let Some(user_id) = entry.user_id {
            return subject.user_id == Some(user_id);
        }
        match &entry.group {
            Some(group) => self.group_member(group, channel, subject),
            None => false,
        }
    }

    /// Resolves membership of `subject` in `group` in the context of
    /// `channel`, including the meta-groups.
    pub fn group_member(&self, group: &str, channel: u32, subject: &AclSubject) -> bool {
        if let Some(negated) = group.strip_prefix('!') {
            return !self.group_member(negated, channel, subject);
        }
        if let Some(token) = group.strip_prefix('#') {
            return subject.has_token(token);
        }
        match group {
            "all" => true,
            "auth" => subject.user_id.is_some(),
            "in" => subject.channel == channel,
            "out" => subject.channel != channel,
            name => self.named_group_member(name, channel, subject),
        }
    }

    fn named_group_member(&self, name: &str, channel: u32, subject: &AclSubject) -> bool {
        let user_id = match subject.user_id {
            Some(id) => id,
            None => return false,
        };
        let chain = self.chain(channel);
        let mut members: HashSet<u32> = HashSet::new();
        let mut defined = false;
        for (depth, id) in chain.iter().enumerate() {
            if let Some(group) = self.channels[id].acl.groups.get(name) {
                let is_target = depth + 1 == chain.len();
                if !is_target && !group.inheritable {
                    continue;
                }
                if !group.inherit {
                    members.clear();
                }
                defined = true;
                for add in &group.add {
                    members.insert(*add);
                }
                for remove in &group.remove {
                    members.remove(remove);
                }
            }
        }
        defined && members.contains(&user_id)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn subject(user_id: Option<u32>, channel: u32) -> AclSubject {
        AclSubject {
            session: 1,
            user_id,
            tokens: Vec::new(),
            channel,
        }
    }

    #[test]
    fn add_and_remove_keep_parent_child_consistent() {
        let mut tree = ChannelTree::new();
        let a = tree.add(ROOT_CHANNEL_ID, "A", false).unwrap();
        let b = tree.add(a, "B", false).unwrap();
        let c = tree.add(b, "C", false).unwrap();
        assert_eq!(tree.get(a).unwrap().children, vec![b]);

        let removed = tree.remove(b).unwrap();
        assert_eq!(removed, vec![c, b]);
        assert!(tree.get(b).is_none());
        assert!(tree.get(c).is_none());
        assert!(tree.get(a).unwrap().children.is_empty());
    }

    #[test]
    fn root_is_immutable() {
        let mut tree = ChannelTree::new();
        assert_eq!(tree.remove(ROOT_CHANNEL_ID), Err(TreeError::RootImmutable));
        let a = tree.add(ROOT_CHANNEL_ID, "A", false).unwrap();
        assert_eq!(
            tree.move_channel(ROOT_CHANNEL_ID, a),
            Err(TreeError::RootImmutable)
        );
    }

    #[test]
    fn moves_refuse_cycles() {
        let mut tree = ChannelTree::new();
        let a = tree.add(ROOT_CHANNEL_ID, "A", false).unwrap();
        let b = tree.add(a, "B", false).unwrap();
        let c = tree.add(b, "C", false).unwrap();
        assert_eq!(tree.move_channel(a, c), Err(TreeError::WouldCycle));
        assert_eq!(tree.move_channel(a, a), Err(TreeError::WouldCycle));

        tree.move_channel(c, ROOT_CHANNEL_ID).unwrap();
        assert_eq!(tree.get(c).unwrap().parent, Some(ROOT_CHANNEL_ID));
        assert!(tree.get(b).unwrap().children.is_empty());
    }

    #[test]
    fn dfs_order_lists_parents_before_children() {
        let mut tree = ChannelTree::new();
        let a = tree.add(ROOT_CHANNEL_ID, "A", false).unwrap();
        let b = tree.add(ROOT_CHANNEL_ID, "B", false).unwrap();
        let a1 = tree.add(a, "A1", false).unwrap();
        let order = tree.dfs_order();
        assert_eq!(order[0], ROOT_CHANNEL_ID);
        let pos = |id| order.iter().position(|c| *c == id).unwrap();
        assert!(pos(a) < pos(a1));
        assert!(pos(b) > pos(ROOT_CHANNEL_ID));
    }

    #[test]
    fn links_are_symmetric_and_transitive_closure_works() {
        let mut tree = ChannelTree::new();
        let a = tree.add(ROOT_CHANNEL_ID, "A", false).unwrap();
        let b = tree.add(ROOT_CHANNEL_ID, "B", false).unwrap();
        let c = tree.add(ROOT_CHANNEL_ID, "C", false).unwrap();
        tree.link(a, b).unwrap();
        tree.link(b, c).unwrap();
        assert!(tree.get(b).unwrap().links.contains(&a));

        let closure = tree.all_links(a);
        assert_eq!(closure, [a, b, c].into_iter().collect());

        tree.unlink(a, b).unwrap();
        assert_eq!(tree.all_links(a), [a].into_iter().collect());
    }

    #[test]
    fn removing_a_channel_clears_its_links() {
        let mut tree = ChannelTree::new();
        let a = tree.add(ROOT_CHANNEL_ID, "A", false).unwrap();
        let b = tree.add(ROOT_CHANNEL_ID, "B", false).unwrap();
        tree.link(a, b).unwrap();
        tree.remove(b).unwrap();
        assert!(tree.get(a).unwrap().links.is_empty());
    }

    #[test]
    fn default_permissions_without_acls() {
        let tree = ChannelTree::new();
        let subj = subject(None, ROOT_CHANNEL_ID);
        assert!(tree.has_permission(ROOT_CHANNEL_ID, &subj, Permission::SPEAK));
        assert!(!tree.has_permission(ROOT_CHANNEL_ID, &subj, Permission::KICK));
    }

    #[test]
    fn superuser_can_do_anything() {
        let tree = ChannelTree::new();
        let subj = subject(Some(0), ROOT_CHANNEL_ID);
        assert!(tree.has_permission(ROOT_CHANNEL_ID, &subj, Permission::BAN));
        assert!(tree.has_permission(ROOT_CHANNEL_ID, &subj, Permission::WRITE));
    }

    #[test]
    fn deny_entry_strips_default_permission() {
        let mut tree = ChannelTree::new();
        let a = tree.add(ROOT_CHANNEL_ID, "A", false).unwrap();
        tree.get_mut(a).unwrap().acl.entries.push(AclEntry {
            group: Some("all".to_owned()),
            apply_here: true,
            apply_subs: true,
            deny: Permission::SPEAK,
            ..Default::default()
        });
        let subj = subject(None, a);
        assert!(!tree.has_permission(a, &subj, Permission::SPEAK));
        assert!(tree.has_permission(a, &subj, Permission::ENTER));
        // The entry applies to sub-channels too.
        let a1 = tree.add(a, "A1", false).unwrap();
        assert!(!tree.has_permission(a1, &subj, Permission::SPEAK));
    }

    #[test]
    fn inherit_flag_cuts_off_parent_entries() {
        let mut tree = ChannelTree::new();
        let a = tree.add(ROOT_CHANNEL_ID, "A", false).unwrap();
        tree.get_mut(ROOT_CHANNEL_ID)
            .unwrap()
            .acl
            .entries
            .push(AclEntry {
                group: Some("all".to_owned()),
                apply_here: true,
                apply_subs: true,
                deny: Permission::ENTER,
                ..Default::default()
            });
        let subj = subject(None, a);
        assert!(!tree.has_permission(a, &subj, Permission::ENTER));

        tree.get_mut(a).unwrap().acl.inherit = false;
        assert!(tree.has_permission(a, &subj, Permission::ENTER));
    }

    #[test]
    fn user_entry_beats_defaults_for_that_user_only() {
        let mut tree = ChannelTree::new();
        let a = tree.add(ROOT_CHANNEL_ID, "A", false).unwrap();
        tree.get_mut(a).unwrap().acl.entries.push(AclEntry {
            user_id: Some(7),
            apply_here: true,
            grant: Permission::KICK,
            ..Default::default()
        });
        assert!(tree.has_permission(a, &subject(Some(7), a), Permission::KICK));
        assert!(!tree.has_permission(a, &subject(Some(8), a), Permission::KICK));
    }

    #[test]
    fn meta_and_token_groups_resolve() {
        let mut tree = ChannelTree::new();
        let a = tree.add(ROOT_CHANNEL_ID, "A", false).unwrap();
        let mut subj = subject(None, a);
        assert!(tree.group_member("all", a, &subj));
        assert!(!tree.group_member("auth", a, &subj));
        assert!(tree.group_member("in", a, &subj));
        assert!(!tree.group_member("out", a, &subj));
        assert!(tree.group_member("!auth", a, &subj));

        subj.tokens.push("secret".to_owned());
        assert!(tree.group_member("#secret", a, &subj));
        assert!(!tree.group_member("#other", a, &subj));
    }

    #[test]
    fn named_groups_inherit_down_the_chain() {
        let mut tree = ChannelTree::new();
        let a = tree.add(ROOT_CHANNEL_ID, "A", false).unwrap();
        let mut admins = crate::server::acl::Group {
            name: "admin".to_owned(),
            inherit: true,
            inheritable: true,
            ..Default::default()
        };
        admins.add.insert(7);
        tree.get_mut(ROOT_CHANNEL_ID)
            .unwrap()
            .acl
            .groups
            .insert("admin".to_owned(), admins);

        assert!(tree.group_member("admin", a, &subject(Some(7), a)));
        assert!(!tree.group_member("admin", a, &subject(Some(8), a)));
        assert!(!tree.group_member("admin", a, &subject(None, a)));
    }

    #[test]
    fn empty_temporary_channels_are_reported_for_reaping() {
        let mut tree = ChannelTree::new();
        let t = tree.add(ROOT_CHANNEL_ID, "temp", true).unwrap();
        let p = tree.add(ROOT_CHANNEL_ID, "perm", false).unwrap();
        tree.member_join(t, 5);
        assert!(tree.expired_temporary().is_empty());
        tree.member_leave(t, 5);
        assert_eq!(tree.expired_temporary(), vec![t]);
        tree.member_leave(p, 1);
        assert_eq!(tree.expired_temporary(), vec![t]);
    }
}
