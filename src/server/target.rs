//! Whisper and shout target resolution.
//!
//! Clients configure up to 30 numbered targets, each a bag of explicit
//! sessions and channel selectors. Resolution to a concrete listener set is
//! lazy and cached; every mutation that could change the outcome (channel
//! moves, link edits, ACL or token changes, joins and leaves) clears the
//! caches server-wide.

use std::collections::HashSet;

use crate::msgs;
use crate::server::acl::Permission;
use crate::server::client::Client;
use crate::server::State;

/// One channel selector of a voice target.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ChannelTarget {
    pub channel_id: u32,
    /// Also address the channels linked (transitively) to this one.
    pub include_links: bool,
    /// Also address every descendant channel.
    pub include_children: bool,
    /// Restrict recipients to members of this ACL group.
    pub group: Option<String>,
}

/// A configured whisper/shout destination.
#[derive(Clone, Debug, Default)]
pub struct VoiceTarget {
    pub sessions: Vec<u32>,
    pub channels: Vec<ChannelTarget>,
    pub(crate) cache: Option<HashSet<u32>>,
}

impl VoiceTarget {
    /// Builds a target from its wire form.
    pub fn from_proto(targets: &[msgs::VoiceTarget_Target]) -> Self {
        let mut out = VoiceTarget::default();
        for t in targets {
            out.sessions.extend_from_slice(t.get_session());
            if t.has_channel_id() {
                out.channels.push(ChannelTarget {
                    channel_id: t.get_channel_id(),
                    include_links: t.get_links(),
                    include_children: t.get_children(),
                    group: if t.has_group() {
                        Some(t.get_group().to_owned())
                    } else {
                        None
                    },
                });
            }
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty() && self.channels.is_empty()
    }

    /// Drops the materialized listener set; the next use recomputes it.
    pub fn clear_cache(&mut self) {
        self.cache = None;
    }

    /// The materialized listener set, computing it on first use.
    ///
    /// Sessions may include the sender itself; the dispatcher filters it.
    /// Deafness is a delivery-time property and is also left to the
    /// dispatcher.
    pub fn resolve(&mut self, state: &State, sender: &Client) -> &HashSet<u32> {
        if self.cache.is_none() {
            self.cache = Some(self.compute(state, sender));
        }
        self.cache.as_ref().unwrap()
    }

    fn compute(&self, state: &State, sender: &Client) -> HashSet<u32> {
        let mut listeners: HashSet<u32> = HashSet::new();
        let subject = sender.acl_subject();

        for session in &self.sessions {
            if state.clients.contains_key(session) {
                listeners.insert(*session);
            }
        }

        for target in &self.channels {
            let mut channel_ids: HashSet<u32> = HashSet::new();
            channel_ids.insert(target.channel_id);
            if target.include_links {
                channel_ids.extend(state.channels.all_links(target.channel_id));
            }
            if target.include_children {
                channel_ids.extend(state.channels.subtree(target.channel_id));
            }

            for channel_id in channel_ids {
                let channel = match state.channels.get(channel_id) {
                    Some(channel) => channel,
                    None => continue,
                };
                if !state
                    .channels
                    .has_permission(channel_id, &subject, Permission::WHISPER)
                {
                    continue;
                }
                for session in &channel.members {
                    if let Some(member) = state.clients.get(session) {
                        if let Some(group) = &target.group {
                            let member_subject = member.acl_subject();
                            if !state
                                .channels
                                .group_member(group, channel_id, &member_subject)
                            {
                                continue;
                            }
                        }
                        listeners.insert(*session);
                    }
                }
            }
        }

        listeners
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::server::channel::ROOT_CHANNEL_ID;
    use crate::server::client::testutil::mock_client;
    use crate::server::Server;
    use std::sync::Arc;

    async fn scene() -> (Arc<Server>, u32, u32) {
        let server = Server::new_for_test();
        let (d, d1);
        {
            let mut state = server.state.write().await;
            d = state.channels.add(ROOT_CHANNEL_ID, "D", false).unwrap();
            d1 = state.channels.add(d, "D1", false).unwrap();
        }
        (server, d, d1)
    }

    async fn join(server: &Arc<Server>, session: u32, channel: u32, name: &str) -> Arc<Client> {
        let (client, _queues) = mock_client(session, server, channel, name);
        let mut state = server.state.write().await;
        state.clients.insert(session, client.clone());
        state.channels.member_join(channel, session);
        client
    }

    #[tokio::test]
    async fn channel_target_includes_descendants_when_asked() {
        let (server, d, d1) = scene().await;
        let alice = join(&server, 1, ROOT_CHANNEL_ID, "alice").await;
        join(&server, 2, d, "bob").await;
        join(&server, 3, d1, "carol").await;

        let mut shallow = VoiceTarget {
            channels: vec![ChannelTarget {
                channel_id: d,
                ..Default::default()
            }],
            ..Default::default()
        };
        let mut deep = VoiceTarget {
            channels: vec![ChannelTarget {
                channel_id: d,
                include_children: true,
                ..Default::default()
            }],
            ..Default::default()
        };

        let state = server.state.read().await;
        assert_eq!(shallow.resolve(&state, &alice), &[2].into_iter().collect());
        assert_eq!(
            deep.resolve(&state, &alice),
            &[2, 3].into_iter().collect::<std::collections::HashSet<_>>()
        );
    }

    #[tokio::test]
    async fn linked_channels_are_included_transitively() {
        let (server, d, d1) = scene().await;
        let e = {
            let mut state = server.state.write().await;
            let e = state.channels.add(ROOT_CHANNEL_ID, "E", false).unwrap();
            state.channels.link(d, e).unwrap();
            e
        };
        let alice = join(&server, 1, d1, "alice").await;
        join(&server, 2, d, "bob").await;
        join(&server, 3, e, "carol").await;

        let mut target = VoiceTarget {
            channels: vec![ChannelTarget {
                channel_id: d,
                include_links: true,
                ..Default::default()
            }],
            ..Default::default()
        };
        let state = server.state.read().await;
        assert_eq!(
            target.resolve(&state, &alice),
            &[2, 3].into_iter().collect::<std::collections::HashSet<_>>()
        );
    }

    #[tokio::test]
    async fn explicit_sessions_must_exist() {
        let (server, _d, _d1) = scene().await;
        let alice = join(&server, 1, ROOT_CHANNEL_ID, "alice").await;
        join(&server, 2, ROOT_CHANNEL_ID, "bob").await;

        let mut target = VoiceTarget {
            sessions: vec![2, 99],
            ..Default::default()
        };
        let state = server.state.read().await;
        assert_eq!(target.resolve(&state, &alice), &[2].into_iter().collect());
    }

    #[tokio::test]
    async fn whisper_acl_gates_channel_targets() {
        let (server, d, _d1) = scene().await;
        let alice = join(&server, 1, ROOT_CHANNEL_ID, "alice").await;
        join(&server, 2, d, "bob").await;

        {
            let mut state = server.state.write().await;
            state.channels.get_mut(d).unwrap().acl.entries.push(
                crate::server::acl::AclEntry {
                    group: Some("all".to_owned()),
                    apply_here: true,
                    apply_subs: true,
                    deny: Permission::WHISPER,
                    ..Default::default()
                },
            );
        }

        let mut target = VoiceTarget {
            channels: vec![ChannelTarget {
                channel_id: d,
                ..Default::default()
            }],
            ..Default::default()
        };
        let state = server.state.read().await;
        assert!(target.resolve(&state, &alice).is_empty());
    }

    #[tokio::test]
    async fn cache_is_reused_until_cleared() {
        let (server, d, _d1) = scene().await;
        let alice = join(&server, 1, ROOT_CHANNEL_ID, "alice").await;
        join(&server, 2, d, "bob").await;

        let mut target = VoiceTarget {
            channels: vec![ChannelTarget {
                channel_id: d,
                ..Default::default()
            }],
            ..Default::default()
        };

        {
            let state = server.state.read().await;
            assert_eq!(target.resolve(&state, &alice).len(), 1);
        }

        // A third client joins the target channel; the stale cache misses
        // it until cleared.
        join(&server, 3, d, "carol").await;
        {
            let state = server.state.read().await;
            assert_eq!(target.resolve(&state, &alice).len(), 1);
            target.clear_cache();
            assert_eq!(target.resolve(&state, &alice).len(), 2);
        }
    }
}
