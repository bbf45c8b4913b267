//! The control message router.
//!
//! A single task drains the server's incoming queue and dispatches each
//! message to its handler. Every mutation of channel or user state happens
//! here, which is the ordering guarantee that lets handlers run without
//! further locking discipline.

use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::control::ControlPacket;
use crate::msgs;
use crate::server::acl::AclEntry;
use crate::server::acl::Group;
use crate::server::acl::Permission;
use crate::server::ban::unix_now;
use crate::server::ban::Ban;
use crate::server::channel::ROOT_CHANNEL_ID;
use crate::server::client::Client;
use crate::server::client::ClientState;
use crate::server::target::VoiceTarget;
use crate::server::user::SUPERUSER_ID;
use crate::server::Message;
use crate::server::Server;

/// Runs the router until the queue closes.
pub async fn message_loop(server: Arc<Server>, mut rx: mpsc::Receiver<Message>) {
    while let Some(message) = rx.recv().await {
        server.handle_message(message).await;
    }
}

fn send_permission_denied(client: &Arc<Client>, channel: u32, perm: Permission) {
    let mut pd = msgs::PermissionDenied::new();
    pd.set_field_type(msgs::PermissionDenied_DenyType::Permission);
    pd.set_permission(perm.0);
    pd.set_channel_id(channel);
    pd.set_session(client.session);
    client.send_message(pd);
}

fn send_permission_denied_type(client: &Arc<Client>, deny: msgs::PermissionDenied_DenyType) {
    let mut pd = msgs::PermissionDenied::new();
    pd.set_field_type(deny);
    client.send_message(pd);
}

/// Usernames are short printable strings without leading or trailing
/// whitespace.
fn valid_username(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 128
        && name.trim() == name
        && !name.chars().any(|c| c.is_control())
}

fn valid_channel_name(name: &str) -> bool {
    valid_username(name)
}

impl Server {
    pub(crate) async fn handle_message(self: &Arc<Self>, message: Message) {
        let Message { client, packet } = message;
        if client.is_disconnected() {
            return;
        }

        // The control-plane rate limit. Pings keep flowing so the timeout
        // accounting stays truthful under pressure.
        match &packet {
            ControlPacket::Ping(_) | ControlPacket::Authenticate(_) => {}
            _ if client.state() == ClientState::Ready => {
                if !client.global_limit.lock().unwrap().allow() {
                    debug!(session = client.session, kind = packet.name(), "rate limited");
                    return;
                }
            }
            _ => {}
        }

        match packet {
            ControlPacket::Authenticate(msg) => self.handle_authenticate(&client, *msg).await,
            ControlPacket::Ping(msg) => self.handle_ping(&client, *msg).await,
            ControlPacket::ChannelState(msg) => self.handle_channel_state(&client, *msg).await,
            ControlPacket::ChannelRemove(msg) => self.handle_channel_remove(&client, *msg).await,
            ControlPacket::UserState(msg) => self.handle_user_state(&client, *msg).await,
            ControlPacket::UserRemove(msg) => self.handle_user_remove(&client, *msg).await,
            ControlPacket::BanList(msg) => self.handle_ban_list(&client, *msg).await,
            ControlPacket::TextMessage(msg) => self.handle_text_message(&client, *msg).await,
            ControlPacket::ACL(msg) => self.handle_acl(&client, *msg).await,
            ControlPacket::QueryUsers(msg) => self.handle_query_users(&client, *msg).await,
            ControlPacket::CryptSetup(msg) => self.handle_crypt_setup(&client, *msg).await,
            ControlPacket::ContextActionModify(msg) => {
                debug!(session = client.session, action = msg.get_action(), "ignoring context action registration from client");
            }
            ControlPacket::ContextAction(msg) => {
                info!(session = client.session, action = msg.get_action(), "context action");
            }
            ControlPacket::UserList(msg) => self.handle_user_list(&client, *msg).await,
            ControlPacket::VoiceTarget(msg) => self.handle_voice_target(&client, *msg).await,
            ControlPacket::PermissionQuery(msg) => {
                self.handle_permission_query(&client, *msg).await
            }
            ControlPacket::UserStats(msg) => self.handle_user_stats(&client, *msg).await,
            ControlPacket::RequestBlob(msg) => self.handle_request_blob(&client, *msg).await,
            ControlPacket::PluginDataTransmission(msg) => {
                self.handle_plugin_data(&client, *msg).await
            }
            other => {
                client
                    .fatal(self, &format!("unexpected {} message", other.name()))
                    .await;
            }
        }
    }

    async fn reject_auth(
        self: &Arc<Self>,
        client: &Arc<Client>,
        reject: msgs::Reject_RejectType,
        reason: &str,
    ) {
        let mut msg = msgs::Reject::new();
        msg.set_field_type(reject);
        if !reason.is_empty() {
            msg.set_reason(reason.to_owned());
        }
        client.send_message(msg);
        info!(session = client.session, ?reject, "authentication rejected");
        client.force_disconnect(self).await;
    }

    async fn handle_authenticate(self: &Arc<Self>, client: &Arc<Client>, msg: msgs::Authenticate) {
        if client.state() == ClientState::Ready {
            // Re-authentication is how clients update their access tokens.
            {
                let mut profile = client.profile.lock().unwrap();
                profile.tokens = msg.get_tokens().to_vec();
            }
            self.state.read().await.clear_caches();
            return;
        }
        if client.state() != ClientState::Authenticated {
            client.fatal(self, "authenticate out of order").await;
            return;
        }

        let username = msg.get_username().to_owned();
        if !valid_username(&username) {
            self.reject_auth(
                client,
                msgs::Reject_RejectType::InvalidUsername,
                "Invalid username",
            )
            .await;
            return;
        }

        let (cert_hash, cert_verified) = {
            let profile = client.profile.lock().unwrap();
            (profile.cert_hash.clone(), profile.cert_verified)
        };

        if self.cfg_bool("CertRequired") && !cert_verified {
            self.reject_auth(
                client,
                msgs::Reject_RejectType::NoCertificate,
                "A verified certificate is required",
            )
            .await;
            return;
        }

        // Resolve the identity before taking the write lock.
        let state = self.state.read().await;

        let now = unix_now();
        let ip = client.remote().ip();
        if state
            .bans
            .iter()
            .any(|ban| ban.applies(ip, &cert_hash, now))
        {
            drop(state);
            self.reject_auth(
                client,
                msgs::Reject_RejectType::None,
                "You are banned from this server",
            )
            .await;
            return;
        }

        let user_id = if username == "SuperUser" {
            let password = self.cfg_str("SuperUserPassword");
            if password.is_empty() || msg.get_password() != password {
                drop(state);
                self.reject_auth(client, msgs::Reject_RejectType::WrongUserPW, "").await;
                return;
            }
            Some(SUPERUSER_ID)
        } else if let Some(user) = state.users.find_by_name(&username) {
            let by_cert = !user.cert_hash.is_empty() && user.cert_hash == cert_hash;
            if by_cert || user.verify_password(msg.get_password()) {
                Some(user.id)
            } else {
                drop(state);
                self.reject_auth(client, msgs::Reject_RejectType::WrongUserPW, "").await;
                return;
            }
        } else {
            state.users.find_by_cert(&cert_hash).map(|user| user.id)
        };

        // Registered certificates pull in the canonical account name.
        let username = match user_id.and_then(|id| state.users.get(id)) {
            Some(user) => user.name.clone(),
            None => username,
        };

        if state
            .clients
            .values()
            .any(|other| other.shown_name() == username)
        {
            drop(state);
            self.reject_auth(client, msgs::Reject_RejectType::UsernameInUse, "").await;
            return;
        }

        if state.ready_clients().count() as i64 >= self.cfg_int("MaxUsers") {
            drop(state);
            self.reject_auth(
                client,
                msgs::Reject_RejectType::ServerFull,
                "Server is full",
            )
            .await;
            return;
        }

        // Pick the channel the client lands in.
        let mut channel = self.cfg_int("DefaultChannel") as u32;
        if self.cfg_bool("RememberChannel") {
            if let Some(user) = user_id.and_then(|id| state.users.get(id)) {
                channel = user.last_channel;
            }
        }
        if state.channels.get(channel).is_none() {
            channel = ROOT_CHANNEL_ID;
        }
        drop(state);

        {
            let mut profile = client.profile.lock().unwrap();
            profile.username = username.clone();
            profile.user_id = user_id;
            profile.tokens = msg.get_tokens().to_vec();
            profile.celt_codecs = msg.get_celt_versions().to_vec();
            profile.opus = msg.get_opus();
            profile.channel = channel;
        }

        // The Enter check needs the tokens recorded just above.
        {
            let mut state = self.state.write().await;
            let subject = client.acl_subject();
            if !state
                .channels
                .has_permission(channel, &subject, Permission::ENTER)
            {
                client.profile.lock().unwrap().channel = ROOT_CHANNEL_ID;
            }
            let channel = client.channel_id();

            state.clients.insert(client.session, client.clone());
            state.channels.member_join(channel, client.session);
            if let Some(user) = user_id.and_then(|id| state.users.get_mut(id)) {
                user.last_active = now as u64;
            }
            state.clear_caches();

            // Everyone else learns about the new participant right away.
            state.broadcast(&self.user_state_of(client).into());
        }

        self.update_codec_versions(Some(client)).await;

        // CryptSetup: the shared key plus both nonces. The client's encrypt
        // nonce is our decrypt nonce.
        let mut crypt_setup = msgs::CryptSetup::new();
        {
            let crypt = client.crypt.lock().unwrap();
            crypt_setup.set_key(crypt.get_key().to_vec());
            crypt_setup.set_client_nonce(crypt.get_decrypt_nonce().to_vec());
            crypt_setup.set_server_nonce(crypt.get_encrypt_nonce().to_vec());
        }
        client.send_message(crypt_setup);

        let state = self.state.read().await;

        let mut codec = msgs::CodecVersion::new();
        codec.set_alpha(state.codec.alpha);
        codec.set_beta(state.codec.beta);
        codec.set_prefer_alpha(state.codec.prefer_alpha);
        codec.set_opus(state.codec.opus);
        client.send_message(codec);

        // The full channel tree, parents always before children.
        for id in state.channels.dfs_order() {
            client.send_message(self.channel_state_of(&state, id));
        }

        // Every participant including the new client itself.
        for other in state.ready_clients() {
            client.send_message(self.user_state_of(other));
        }
        client.send_message(self.user_state_of(client));

        let permissions = state.channels.permissions(ROOT_CHANNEL_ID, &client.acl_subject());
        drop(state);

        let mut sync = msgs::ServerSync::new();
        sync.set_session(client.session);
        sync.set_max_bandwidth(self.cfg_int("MaxBandwidth") as u32);
        sync.set_welcome_text(self.cfg_str("WelcomeText"));
        sync.set_permissions(u64::from(permissions.0));
        client.send_message(sync);

        let mut server_config = msgs::ServerConfig::new();
        server_config.set_allow_html(self.cfg_bool("AllowHTML"));
        server_config.set_message_length(self.cfg_int("MaxTextMessageLength") as u32);
        server_config.set_image_message_length(self.cfg_int("MaxImageMessageLength") as u32);
        server_config.set_max_users(self.cfg_int("MaxUsers") as u32);
        client.send_message(server_config);

        let suggest_positional = self.cfg_str("SuggestPositional");
        let suggest_ptt = self.cfg_str("SuggestPushToTalk");
        if !suggest_positional.is_empty() || !suggest_ptt.is_empty() {
            let mut suggest = msgs::SuggestConfig::new();
            if !suggest_positional.is_empty() {
                suggest.set_positional(suggest_positional == "true");
            }
            if !suggest_ptt.is_empty() {
                suggest.set_push_to_talk(suggest_ptt == "true");
            }
            client.send_message(suggest);
        }

        client.set_state(ClientState::Ready);
        client.signal_ready(true);
        info!(
            session = client.session,
            name = %username,
            registered = user_id.is_some(),
            "authenticated"
        );
        self.mark_dirty();
    }

    /// The UserState describing one client, as sent in the initial sync.
    fn user_state_of(&self, client: &Arc<Client>) -> msgs::UserState {
        let profile = client.profile.lock().unwrap();
        let mut msg = msgs::UserState::new();
        msg.set_session(client.session);
        msg.set_name(profile.username.clone());
        msg.set_channel_id(profile.channel);
        if let Some(user_id) = profile.user_id {
            msg.set_user_id(user_id);
        }
        if !profile.cert_hash.is_empty() {
            msg.set_hash(profile.cert_hash.clone());
        }
        if profile.mute {
            msg.set_mute(true);
        }
        if profile.deaf {
            msg.set_deaf(true);
        }
        if profile.suppress {
            msg.set_suppress(true);
        }
        if profile.self_mute {
            msg.set_self_mute(true);
        }
        if profile.self_deaf {
            msg.set_self_deaf(true);
        }
        if profile.priority_speaker {
            msg.set_priority_speaker(true);
        }
        if profile.recording {
            msg.set_recording(true);
        }
        msg
    }

    /// The ChannelState describing one channel, description inlined from
    /// the blob store (a missing blob degrades to no description).
    fn channel_state_of(&self, state: &crate::server::State, id: u32) -> msgs::ChannelState {
        let mut msg = msgs::ChannelState::new();
        let channel = match state.channels.get(id) {
            Some(channel) => channel,
            None => return msg,
        };
        msg.set_channel_id(id);
        if let Some(parent) = channel.parent {
            msg.set_parent(parent);
        }
        msg.set_name(channel.name.clone());
        msg.set_links(channel.links.iter().copied().collect());
        if channel.temporary {
            msg.set_temporary(true);
        }
        msg.set_position(channel.position);
        if channel.max_users != 0 {
            msg.set_max_users(channel.max_users);
        }
        if let Some(key) = &channel.description_blob {
            match self.blobstore.get(key) {
                Ok(blob) => msg.set_description(String::from_utf8_lossy(&blob).into_owned()),
                Err(err) => {
                    warn!(channel = id, "description blob missing: {}", err);
                }
            }
        }
        msg
    }

    async fn handle_ping(self: &Arc<Self>, client: &Arc<Client>, msg: msgs::Ping) {
        {
            let mut stats = client.ping_stats.lock().unwrap();
            stats.udp_packets = msg.get_udp_packets();
            stats.tcp_packets = msg.get_tcp_packets();
            stats.udp_ping_avg = msg.get_udp_ping_avg();
            stats.udp_ping_var = msg.get_udp_ping_var();
            stats.tcp_ping_avg = msg.get_tcp_ping_avg();
            stats.tcp_ping_var = msg.get_tcp_ping_var();
            stats.remote_good = msg.get_good();
            stats.remote_late = msg.get_late();
            stats.remote_lost = msg.get_lost();
            stats.remote_resync = msg.get_resync();
        }

        let crypt_stats = client.crypt.lock().unwrap().stats();
        let mut reply = msgs::Ping::new();
        reply.set_timestamp(msg.get_timestamp());
        reply.set_good(crypt_stats.good);
        reply.set_late(crypt_stats.late);
        reply.set_lost(crypt_stats.lost);
        reply.set_resync(crypt_stats.resync);
        client.send_message(reply);
    }

    async fn handle_channel_state(self: &Arc<Self>, client: &Arc<Client>, msg: msgs::ChannelState) {
        if !msg.has_channel_id() {
            self.create_channel(client, msg).await;
        } else {
            self.edit_channel(client, msg).await;
        }
    }

    async fn create_channel(self: &Arc<Self>, client: &Arc<Client>, msg: msgs::ChannelState) {
        let parent = msg.get_parent();
        let name = msg.get_name().to_owned();
        let temporary = msg.get_temporary();
        if !valid_channel_name(&name) {
            send_permission_denied_type(client, msgs::PermissionDenied_DenyType::ChannelName);
            return;
        }

        let needed = if temporary {
            Permission::MAKE_TEMP_CHANNEL
        } else {
            Permission::MAKE_CHANNEL
        };

        let mut state = self.state.write().await;
        if state.channels.get(parent).is_none() {
            return;
        }
        let subject = client.acl_subject();
        if !state.channels.has_permission(parent, &subject, needed) {
            drop(state);
            send_permission_denied(client, parent, needed);
            return;
        }
        let sibling_taken = state
            .channels
            .get(parent)
            .map(|p| {
                p.children
                    .iter()
                    .any(|c| state.channels.get(*c).map(|c| c.name == name).unwrap_or(false))
            })
            .unwrap_or(false);
        if sibling_taken {
            drop(state);
            send_permission_denied_type(client, msgs::PermissionDenied_DenyType::ChannelName);
            return;
        }

        let id = match state.channels.add(parent, &name, temporary) {
            Ok(id) => id,
            Err(err) => {
                debug!("channel create failed: {}", err);
                return;
            }
        };
        if let Some(channel) = state.channels.get_mut(id) {
            channel.position = msg.get_position();
            if msg.has_max_users() {
                channel.max_users = msg.get_max_users();
            }
            if msg.has_description() && !msg.get_description().is_empty() {
                match self.blobstore.put(msg.get_description().as_bytes()) {
                    Ok(key) => channel.description_blob = Some(key),
                    Err(err) => warn!("description blob store failed: {}", err),
                }
            }
        }

        let mut out = self.channel_state_of(&state, id);
        out.set_description(msg.get_description().to_owned());
        state.broadcast(&out.into());
        info!(
            session = client.session,
            channel = id,
            temporary,
            name = %name,
            "channel created"
        );

        // The creator of a temporary channel moves into it immediately.
        if temporary {
            let old = client.channel_id();
            state.channels.member_leave(old, client.session);
            state.channels.member_join(id, client.session);
            client.profile.lock().unwrap().channel = id;
            state.clear_caches();
            let mut moved = msgs::UserState::new();
            moved.set_session(client.session);
            moved.set_actor(client.session);
            moved.set_channel_id(id);
            state.broadcast(&moved.into());
        } else {
            self.mark_dirty();
        }
    }

    async fn edit_channel(self: &Arc<Self>, client: &Arc<Client>, msg: msgs::ChannelState) {
        let id = msg.get_channel_id();
        let subject = client.acl_subject();
        let mut state = self.state.write().await;
        if state.channels.get(id).is_none() {
            return;
        }

        let mut out = msgs::ChannelState::new();
        out.set_channel_id(id);
        let mut changed = false;
        let mut links_changed = false;

        if msg.has_name() && msg.get_name() != state.channels.get(id).unwrap().name {
            if !state.channels.has_permission(id, &subject, Permission::WRITE) {
                drop(state);
                send_permission_denied(client, id, Permission::WRITE);
                return;
            }
            let name = msg.get_name().to_owned();
            if !valid_channel_name(&name) {
                drop(state);
                send_permission_denied_type(client, msgs::PermissionDenied_DenyType::ChannelName);
                return;
            }
            state.channels.get_mut(id).unwrap().name = name.clone();
            out.set_name(name);
            changed = true;
        }

        if msg.has_parent() && Some(msg.get_parent()) != state.channels.get(id).unwrap().parent {
            let dest = msg.get_parent();
            if !state.channels.has_permission(id, &subject, Permission::WRITE)
                || !state
                    .channels
                    .has_permission(dest, &subject, Permission::MAKE_CHANNEL)
            {
                drop(state);
                send_permission_denied(client, dest, Permission::MAKE_CHANNEL);
                return;
            }
            if let Err(err) = state.channels.move_channel(id, dest) {
                debug!("channel move refused: {}", err);
                return;
            }
            out.set_parent(dest);
            changed = true;
        }

        for linked in msg.get_links_add() {
            let allowed = state
                .channels
                .has_permission(id, &subject, Permission::LINK_CHANNEL)
                && state
                    .channels
                    .has_permission(*linked, &subject, Permission::LINK_CHANNEL);
            if !allowed {
                drop(state);
                send_permission_denied(client, *linked, Permission::LINK_CHANNEL);
                return;
            }
            if state.channels.link(id, *linked).is_ok() {
                links_changed = true;
                changed = true;
            }
        }
        for linked in msg.get_links_remove() {
            if !state
                .channels
                .has_permission(id, &subject, Permission::LINK_CHANNEL)
            {
                drop(state);
                send_permission_denied(client, id, Permission::LINK_CHANNEL);
                return;
            }
            if state.channels.unlink(id, *linked).is_ok() {
                links_changed = true;
                changed = true;
            }
        }

        if msg.has_description() {
            if !state.channels.has_permission(id, &subject, Permission::WRITE) {
                drop(state);
                send_permission_denied(client, id, Permission::WRITE);
                return;
            }
            let description = msg.get_description();
            let channel = state.channels.get_mut(id).unwrap();
            if description.is_empty() {
                channel.description_blob = None;
            } else {
                match self.blobstore.put(description.as_bytes()) {
                    Ok(key) => channel.description_blob = Some(key),
                    Err(err) => warn!("description blob store failed: {}", err),
                }
            }
            out.set_description(description.to_owned());
            changed = true;
        }

        if msg.has_position() && msg.get_position() != state.channels.get(id).unwrap().position {
            if !state.channels.has_permission(id, &subject, Permission::WRITE) {
                drop(state);
                send_permission_denied(client, id, Permission::WRITE);
                return;
            }
            state.channels.get_mut(id).unwrap().position = msg.get_position();
            out.set_position(msg.get_position());
            changed = true;
        }

        if !changed {
            return;
        }
        if links_changed {
            out.set_links(
                state
                    .channels
                    .get(id)
                    .unwrap()
                    .links
                    .iter()
                    .copied()
                    .collect(),
            );
            state.clear_caches();
        }
        state.broadcast(&out.into());
        self.mark_dirty();
    }

    async fn handle_channel_remove(
        self: &Arc<Self>,
        client: &Arc<Client>,
        msg: msgs::ChannelRemove,
    ) {
        let id = msg.get_channel_id();
        let subject = client.acl_subject();
        let mut state = self.state.write().await;
        if state.channels.get(id).is_none() {
            return;
        }
        if !state.channels.has_permission(id, &subject, Permission::WRITE) {
            drop(state);
            send_permission_denied(client, id, Permission::WRITE);
            return;
        }

        // Occupants of the removed subtree fall back to the root channel.
        let subtree = state.channels.subtree(id);
        let mut displaced: Vec<Arc<Client>> = Vec::new();
        for channel_id in &subtree {
            if let Some(channel) = state.channels.get(*channel_id) {
                for session in channel.members.iter() {
                    if let Some(occupant) = state.clients.get(session) {
                        displaced.push(occupant.clone());
                    }
                }
            }
        }
        for occupant in &displaced {
            let old = occupant.channel_id();
            state.channels.member_leave(old, occupant.session);
            state.channels.member_join(ROOT_CHANNEL_ID, occupant.session);
            occupant.profile.lock().unwrap().channel = ROOT_CHANNEL_ID;
            let mut moved = msgs::UserState::new();
            moved.set_session(occupant.session);
            moved.set_actor(client.session);
            moved.set_channel_id(ROOT_CHANNEL_ID);
            state.broadcast(&moved.into());
        }

        if state.channels.remove(id).is_err() {
            return;
        }
        state.clear_caches();
        let mut out = msgs::ChannelRemove::new();
        out.set_channel_id(id);
        state.broadcast(&out.into());
        info!(session = client.session, channel = id, "channel removed");
        self.mark_dirty();
    }

    async fn handle_user_state(self: &Arc<Self>, client: &Arc<Client>, msg: msgs::UserState) {
        let target_session = if msg.has_session() {
            msg.get_session()
        } else {
            client.session
        };
        let self_action = target_session == client.session;

        let mut state = self.state.write().await;
        let target = match state.clients.get(&target_session) {
            Some(target) => target.clone(),
            None => return,
        };
        let subject = client.acl_subject();

        let mut out = msgs::UserState::new();
        out.set_session(target_session);
        out.set_actor(client.session);
        let mut changed = false;
        let mut persist = false;

        // Channel move.
        if msg.has_channel_id() && msg.get_channel_id() != target.channel_id() {
            let dest = msg.get_channel_id();
            if state.channels.get(dest).is_none() {
                return;
            }
            let allowed = if self_action {
                state.channels.has_permission(dest, &subject, Permission::ENTER)
            } else {
                state
                    .channels
                    .has_permission(target.channel_id(), &subject, Permission::MOVE)
                    && state.channels.has_permission(dest, &subject, Permission::MOVE)
            };
            if !allowed {
                drop(state);
                send_permission_denied(
                    client,
                    dest,
                    if self_action {
                        Permission::ENTER
                    } else {
                        Permission::MOVE
                    },
                );
                return;
            }
            let dest_channel = state.channels.get(dest).unwrap();
            if dest_channel.max_users != 0
                && dest_channel.members.len() as u32 >= dest_channel.max_users
            {
                drop(state);
                send_permission_denied_type(client, msgs::PermissionDenied_DenyType::ChannelFull);
                return;
            }

            let old = target.channel_id();
            state.channels.member_leave(old, target.session);
            state.channels.member_join(dest, target.session);
            target.profile.lock().unwrap().channel = dest;
            state.clear_caches();
            if let Some(user_id) = target.user_id() {
                if self.cfg_bool("RememberChannel") {
                    if let Some(user) = state.users.get_mut(user_id) {
                        user.last_channel = dest;
                        persist = true;
                    }
                }
            }
            out.set_channel_id(dest);
            changed = true;
        }

        // Server mute and deafen, by privilege.
        if msg.has_mute() || msg.has_deaf() || msg.has_suppress() || msg.has_priority_speaker() {
            if !state.channels.has_permission(
                target.channel_id(),
                &subject,
                Permission::MUTE_DEAFEN,
            ) {
                drop(state);
                send_permission_denied(client, target.channel_id(), Permission::MUTE_DEAFEN);
                return;
            }
            let mut profile = target.profile.lock().unwrap();
            if msg.has_deaf() {
                profile.deaf = msg.get_deaf();
                out.set_deaf(profile.deaf);
                // Deafening implies muting.
                if profile.deaf && !profile.mute {
                    profile.mute = true;
                    out.set_mute(true);
                }
                changed = true;
            }
            if msg.has_mute() {
                profile.mute = msg.get_mute();
                if !profile.mute && profile.deaf {
                    profile.deaf = false;
                    out.set_deaf(false);
                }
                out.set_mute(profile.mute);
                changed = true;
            }
            if msg.has_suppress() {
                profile.suppress = msg.get_suppress();
                out.set_suppress(profile.suppress);
                changed = true;
            }
            if msg.has_priority_speaker() {
                profile.priority_speaker = msg.get_priority_speaker();
                out.set_priority_speaker(profile.priority_speaker);
                changed = true;
            }
        }

        if self_action {
            let mut profile = client.profile.lock().unwrap();
            if msg.has_self_mute() {
                profile.self_mute = msg.get_self_mute();
                out.set_self_mute(profile.self_mute);
                changed = true;
            }
            if msg.has_self_deaf() {
                profile.self_deaf = msg.get_self_deaf();
                // A deafened client cannot hear itself being muted.
                if profile.self_deaf {
                    profile.self_mute = true;
                    out.set_self_mute(true);
                }
                out.set_self_deaf(profile.self_deaf);
                changed = true;
            }
            if msg.has_recording() {
                profile.recording = msg.get_recording();
                out.set_recording(profile.recording);
                changed = true;
            }
            if msg.has_plugin_context() {
                profile.plugin_context = msg.get_plugin_context().to_vec();
            }
            if msg.has_plugin_identity() {
                profile.plugin_identity = msg.get_plugin_identity().to_owned();
            }
            if msg.has_comment() {
                let comment = msg.get_comment();
                if comment.is_empty() {
                    profile.comment_blob = None;
                } else {
                    match self.blobstore.put(comment.as_bytes()) {
                        Ok(key) => profile.comment_blob = Some(key),
                        Err(err) => warn!("comment blob store failed: {}", err),
                    }
                }
                out.set_comment(comment.to_owned());
                changed = true;
            }
            if msg.has_texture() {
                let texture = msg.get_texture();
                if texture.is_empty() {
                    profile.texture_blob = None;
                } else {
                    match self.blobstore.put(texture) {
                        Ok(key) => profile.texture_blob = Some(key),
                        Err(err) => warn!("texture blob store failed: {}", err),
                    }
                }
                out.set_texture(texture.to_vec());
                changed = true;
            }
            if !msg.get_temporary_access_tokens().is_empty() {
                profile.tokens = msg.get_temporary_access_tokens().to_vec();
                drop(profile);
                state.clear_caches();
            }
        }

        // Self-registration.
        if msg.has_user_id() && self_action && !client.is_registered() {
            let cert_hash = client.profile.lock().unwrap().cert_hash.clone();
            let allowed = state.channels.has_permission(
                ROOT_CHANNEL_ID,
                &subject,
                Permission::SELF_REGISTER,
            ) && !cert_hash.is_empty();
            if !allowed {
                drop(state);
                send_permission_denied(client, ROOT_CHANNEL_ID, Permission::SELF_REGISTER);
                return;
            }
            let name = client.shown_name();
            if let Some(user_id) = state.users.register(&name, &cert_hash) {
                client.profile.lock().unwrap().user_id = Some(user_id);
                out.set_user_id(user_id);
                changed = true;
                persist = true;
                info!(session = client.session, user_id, "registered");
            }
        }

        if changed {
            state.broadcast(&out.into());
        }
        drop(state);
        if persist {
            self.mark_dirty();
        }
    }

    async fn handle_user_remove(self: &Arc<Self>, client: &Arc<Client>, msg: msgs::UserRemove) {
        let ban = msg.get_ban();
        let needed = if ban { Permission::BAN } else { Permission::KICK };
        let subject = client.acl_subject();

        let mut state = self.state.write().await;
        let target = match state.clients.get(&msg.get_session()) {
            Some(target) => target.clone(),
            None => return,
        };
        if !state
            .channels
            .has_permission(ROOT_CHANNEL_ID, &subject, needed)
        {
            drop(state);
            send_permission_denied(client, ROOT_CHANNEL_ID, needed);
            return;
        }

        if ban {
            let mut entry = Ban::single(
                target.remote().ip(),
                &target.shown_name(),
                msg.get_reason(),
                0,
            );
            entry.cert_hash = target.profile.lock().unwrap().cert_hash.clone();
            state.bans.push(entry);
        }

        let mut out = msgs::UserRemove::new();
        out.set_session(target.session);
        out.set_actor(client.session);
        out.set_reason(msg.get_reason().to_owned());
        out.set_ban(ban);
        state.broadcast(&out.into());
        drop(state);

        info!(
            session = target.session,
            actor = client.session,
            ban,
            "user removed"
        );
        target.force_disconnect(self).await;
        if ban {
            self.mark_dirty();
        }
    }

    async fn handle_ban_list(self: &Arc<Self>, client: &Arc<Client>, msg: msgs::BanList) {
        let subject = client.acl_subject();
        {
            let state = self.state.read().await;
            if !state
                .channels
                .has_permission(ROOT_CHANNEL_ID, &subject, Permission::BAN)
            {
                drop(state);
                send_permission_denied(client, ROOT_CHANNEL_ID, Permission::BAN);
                return;
            }
        }

        if msg.get_query() {
            let state = self.state.read().await;
            let mut reply = msgs::BanList::new();
            for ban in &state.bans {
                let mut entry = msgs::BanList_BanEntry::new();
                entry.set_address(ban.address.to_vec());
                entry.set_mask(ban.mask);
                entry.set_name(ban.name.clone());
                entry.set_hash(ban.cert_hash.clone());
                entry.set_reason(ban.reason.clone());
                entry.set_start(ban.start.to_string());
                entry.set_duration(ban.duration);
                reply.mut_bans().push(entry);
            }
            client.send_message(reply);
            return;
        }

        let mut bans = Vec::new();
        for entry in msg.get_bans() {
            let mut address = [0u8; 16];
            if entry.get_address().len() != 16 {
                continue;
            }
            address.copy_from_slice(entry.get_address());
            bans.push(Ban {
                address,
                mask: entry.get_mask(),
                name: entry.get_name().to_owned(),
                cert_hash: entry.get_hash().to_owned(),
                reason: entry.get_reason().to_owned(),
                start: entry.get_start().parse().unwrap_or_else(|_| unix_now()),
                duration: entry.get_duration(),
            });
        }
        let count = bans.len();
        self.state.write().await.bans = bans;
        info!(session = client.session, count, "ban list replaced");
        self.mark_dirty();
    }

    async fn handle_text_message(self: &Arc<Self>, client: &Arc<Client>, msg: msgs::TextMessage) {
        let text = msg.get_message();
        if text.len() > self.cfg_int("MaxTextMessageLength") as usize {
            send_permission_denied_type(client, msgs::PermissionDenied_DenyType::TextTooLong);
            return;
        }
        let subject = client.acl_subject();

        let state = self.state.read().await;
        let mut recipients: HashSet<u32> = HashSet::new();

        for session in msg.get_session() {
            if state.clients.contains_key(session) {
                recipients.insert(*session);
            }
        }
        for channel_id in msg.get_channel_id() {
            if !state
                .channels
                .has_permission(*channel_id, &subject, Permission::TEXT_MESSAGE)
            {
                send_permission_denied(client, *channel_id, Permission::TEXT_MESSAGE);
                continue;
            }
            if let Some(channel) = state.channels.get(*channel_id) {
                recipients.extend(channel.members.iter().copied());
            }
        }
        for tree_id in msg.get_tree_id() {
            if !state
                .channels
                .has_permission(*tree_id, &subject, Permission::TEXT_MESSAGE)
            {
                send_permission_denied(client, *tree_id, Permission::TEXT_MESSAGE);
                continue;
            }
            for channel_id in state.channels.subtree(*tree_id) {
                if let Some(channel) = state.channels.get(channel_id) {
                    recipients.extend(channel.members.iter().copied());
                }
            }
        }
        recipients.remove(&client.session);

        let mut out = msgs::TextMessage::new();
        out.set_actor(client.session);
        out.set_message(text.to_owned());
        for session in recipients {
            if let Some(recipient) = state.clients.get(&session) {
                if recipient.state() == ClientState::Ready {
                    recipient.send_message(out.clone());
                }
            }
        }
    }

    async fn handle_acl(self: &Arc<Self>, client: &Arc<Client>, msg: msgs::ACL) {
        let id = msg.get_channel_id();
        let subject = client.acl_subject();

        let mut state = self.state.write().await;
        if state.channels.get(id).is_none() {
            return;
        }
        if !state.channels.has_permission(id, &subject, Permission::WRITE) {
            drop(state);
            send_permission_denied(client, id, Permission::WRITE);
            return;
        }

        if msg.get_query() {
            let channel = state.channels.get(id).unwrap();
            let mut reply = msgs::ACL::new();
            reply.set_channel_id(id);
            reply.set_inherit_acls(channel.acl.inherit);
            for group in channel.acl.groups.values() {
                let mut out = msgs::ACL_ChanGroup::new();
                out.set_name(group.name.clone());
                out.set_inherited(false);
                out.set_inherit(group.inherit);
                out.set_inheritable(group.inheritable);
                out.set_add(group.add.iter().copied().collect());
                out.set_remove(group.remove.iter().copied().collect());
                reply.mut_groups().push(out);
            }
            for entry in &channel.acl.entries {
                let mut out = msgs::ACL_ChanACL::new();
                out.set_apply_here(entry.apply_here);
                out.set_apply_subs(entry.apply_subs);
                out.set_inherited(false);
                if let Some(user_id) = entry.user_id {
                    out.set_user_id(user_id);
                }
                if let Some(group) = &entry.group {
                    out.set_group(group.clone());
                }
                out.set_grant(entry.grant.0);
                out.set_deny(entry.deny.0);
                reply.mut_acls().push(out);
            }
            drop(state);
            client.send_message(reply);
            return;
        }

        // Replace the channel's own (non-inherited) entries and groups.
        let channel = state.channels.get_mut(id).unwrap();
        channel.acl.inherit = msg.get_inherit_acls();
        channel.acl.entries.clear();
        channel.acl.groups.clear();
        for entry in msg.get_acls() {
            if entry.get_inherited() {
                continue;
            }
            channel.acl.entries.push(AclEntry {
                user_id: if entry.has_user_id() {
                    Some(entry.get_user_id())
                } else {
                    None
                },
                group: if entry.has_group() {
                    Some(entry.get_group().to_owned())
                } else {
                    None
                },
                apply_here: entry.get_apply_here(),
                apply_subs: entry.get_apply_subs(),
                grant: Permission(entry.get_grant()),
                deny: Permission(entry.get_deny()),
            });
        }
        for group in msg.get_groups() {
            if group.get_inherited() {
                continue;
            }
            channel.acl.groups.insert(
                group.get_name().to_owned(),
                Group {
                    name: group.get_name().to_owned(),
                    inherit: group.get_inherit(),
                    inheritable: group.get_inheritable(),
                    add: group.get_add().iter().copied().collect(),
                    remove: group.get_remove().iter().copied().collect(),
                },
            );
        }
        state.clear_caches();
        info!(session = client.session, channel = id, "acl updated");
        self.mark_dirty();
    }

    async fn handle_query_users(self: &Arc<Self>, client: &Arc<Client>, msg: msgs::QueryUsers) {
        let state = self.state.read().await;
        let mut reply = msgs::QueryUsers::new();
        for id in msg.get_ids() {
            if let Some(user) = state.users.get(*id) {
                reply.mut_ids().push(user.id);
                reply.mut_names().push(user.name.clone());
            }
        }
        for name in msg.get_names() {
            if let Some(user) = state.users.find_by_name(name) {
                reply.mut_ids().push(user.id);
                reply.mut_names().push(user.name.clone());
            }
        }
        drop(state);
        client.send_message(reply);
    }

    async fn handle_crypt_setup(self: &Arc<Self>, client: &Arc<Client>, msg: msgs::CryptSetup) {
        if msg.has_client_nonce() {
            // The client hands us its current encrypt nonce; our decrypt
            // direction realigns to it and resets the replay window.
            let nonce: Result<[u8; 16], _> = msg.get_client_nonce().try_into();
            match nonce {
                Ok(nonce) => {
                    client.crypt.lock().unwrap().set_decrypt_nonce(&nonce);
                    debug!(session = client.session, "crypt resynced from client nonce");
                }
                Err(_) => {
                    client.fatal(self, "malformed client nonce").await;
                }
            }
        } else {
            // The client asks for our current encrypt nonce.
            let mut reply = msgs::CryptSetup::new();
            reply.set_server_nonce(client.crypt.lock().unwrap().get_encrypt_nonce().to_vec());
            client.send_message(reply);
        }
    }

    async fn handle_user_list(self: &Arc<Self>, client: &Arc<Client>, msg: msgs::UserList) {
        let subject = client.acl_subject();
        let mut state = self.state.write().await;
        if !state
            .channels
            .has_permission(ROOT_CHANNEL_ID, &subject, Permission::REGISTER)
        {
            drop(state);
            send_permission_denied(client, ROOT_CHANNEL_ID, Permission::REGISTER);
            return;
        }

        if msg.get_users().is_empty() {
            let mut reply = msgs::UserList::new();
            for user in state.users.iter() {
                if user.id == SUPERUSER_ID {
                    continue;
                }
                let mut out = msgs::UserList_User::new();
                out.set_user_id(user.id);
                out.set_name(user.name.clone());
                out.set_last_channel(user.last_channel);
                out.set_last_seen(user.last_active.to_string());
                reply.mut_users().push(out);
            }
            drop(state);
            client.send_message(reply);
            return;
        }

        for entry in msg.get_users() {
            let id = entry.get_user_id();
            if !entry.has_name() {
                if state.users.remove(id) {
                    info!(session = client.session, user_id = id, "account removed");
                }
            } else if let Some(user) = state.users.get_mut(id) {
                user.name = entry.get_name().to_owned();
            }
        }
        self.mark_dirty();
    }

    async fn handle_voice_target(self: &Arc<Self>, client: &Arc<Client>, msg: msgs::VoiceTarget) {
        let id = msg.get_id();
        if !(1..=30).contains(&id) {
            return;
        }
        let slot = id as u8;
        let target = VoiceTarget::from_proto(msg.get_targets());
        let mut targets = client.targets.lock().unwrap();
        targets.retain(|(existing, _)| *existing != slot);
        if !target.is_empty() {
            targets.push((slot, target));
        }
    }

    async fn handle_permission_query(
        self: &Arc<Self>,
        client: &Arc<Client>,
        msg: msgs::PermissionQuery,
    ) {
        let id = msg.get_channel_id();
        let state = self.state.read().await;
        if state.channels.get(id).is_none() {
            return;
        }
        let permissions = state.channels.permissions(id, &client.acl_subject());
        drop(state);

        let mut reply = msgs::PermissionQuery::new();
        reply.set_channel_id(id);
        reply.set_permissions(permissions.0);
        client.send_message(reply);
    }

    async fn handle_user_stats(self: &Arc<Self>, client: &Arc<Client>, msg: msgs::UserStats) {
        let target_session = if msg.has_session() {
            msg.get_session()
        } else {
            client.session
        };
        let state = self.state.read().await;
        let target = match state.clients.get(&target_session) {
            Some(target) => target.clone(),
            None => return,
        };
        let extended = target_session == client.session
            || state.channels.has_permission(
                ROOT_CHANNEL_ID,
                &client.acl_subject(),
                Permission::REGISTER,
            );
        drop(state);

        let mut reply = msgs::UserStats::new();
        reply.set_session(target_session);

        let crypt_stats = target.crypt.lock().unwrap().stats();
        let ping_stats = *target.ping_stats.lock().unwrap();

        let mut from_server = msgs::UserStats_Stats::new();
        from_server.set_good(crypt_stats.good);
        from_server.set_late(crypt_stats.late);
        from_server.set_lost(crypt_stats.lost);
        from_server.set_resync(crypt_stats.resync);
        reply.set_from_server(from_server);

        let mut from_client = msgs::UserStats_Stats::new();
        from_client.set_good(ping_stats.remote_good);
        from_client.set_late(ping_stats.remote_late);
        from_client.set_lost(ping_stats.remote_lost);
        from_client.set_resync(ping_stats.remote_resync);
        reply.set_from_client(from_client);

        reply.set_udp_packets(ping_stats.udp_packets);
        reply.set_tcp_packets(ping_stats.tcp_packets);
        reply.set_udp_ping_avg(ping_stats.udp_ping_avg);
        reply.set_udp_ping_var(ping_stats.udp_ping_var);
        reply.set_tcp_ping_avg(ping_stats.tcp_ping_avg);
        reply.set_tcp_ping_var(ping_stats.tcp_ping_var);

        if extended {
            let profile = target.profile.lock().unwrap();
            let mut version = msgs::Version::new();
            version.set_version_v1(profile.version.v1());
            version.set_version_v2(profile.version.v2());
            version.set_release(profile.client_release.clone());
            version.set_os(profile.os_name.clone());
            version.set_os_version(profile.os_version.clone());
            reply.set_version(version);
            reply.set_celt_versions(profile.celt_codecs.clone());
            reply.set_opus(profile.opus);
            reply.set_strong_certificate(profile.cert_verified);
            drop(profile);
            reply.set_address(crate::server::ban::mapped_bytes(target.remote().ip()).to_vec());
        } else {
            reply.set_stats_only(true);
        }

        reply.set_onlinesecs(target.connected_at.elapsed().as_secs() as u32);
        reply.set_idlesecs(target.bandwidth.lock().unwrap().idle_seconds() as u32);
        reply.set_bandwidth(target.bandwidth.lock().unwrap().bandwidth() * 8);

        client.send_message(reply);
    }

    async fn handle_request_blob(self: &Arc<Self>, client: &Arc<Client>, msg: msgs::RequestBlob) {
        let state = self.state.read().await;
        for session in msg.get_session_comment() {
            if let Some(target) = state.clients.get(session) {
                let blob = target.profile.lock().unwrap().comment_blob.clone();
                if let Some(key) = blob {
                    let comment = self
                        .blobstore
                        .get(&key)
                        .map(|b| String::from_utf8_lossy(&b).into_owned())
                        .unwrap_or_default();
                    let mut out = msgs::UserState::new();
                    out.set_session(*session);
                    out.set_comment(comment);
                    client.send_message(out);
                }
            }
        }
        for session in msg.get_session_texture() {
            if let Some(target) = state.clients.get(session) {
                let blob = target.profile.lock().unwrap().texture_blob.clone();
                if let Some(key) = blob {
                    let texture = self.blobstore.get(&key).unwrap_or_default();
                    let mut out = msgs::UserState::new();
                    out.set_session(*session);
                    out.set_texture(texture);
                    client.send_message(out);
                }
            }
        }
        for channel_id in msg.get_channel_description() {
            if let Some(channel) = state.channels.get(*channel_id) {
                if let Some(key) = &channel.description_blob {
                    // A lost blob degrades to an empty description.
                    let description = self
                        .blobstore
                        .get(key)
                        .map(|b| String::from_utf8_lossy(&b).into_owned())
                        .unwrap_or_default();
                    let mut out = msgs::ChannelState::new();
                    out.set_channel_id(*channel_id);
                    out.set_description(description);
                    client.send_message(out);
                }
            }
        }
    }

    async fn handle_plugin_data(
        self: &Arc<Self>,
        client: &Arc<Client>,
        msg: msgs::PluginDataTransmission,
    ) {
        if !client.plugin_limit.lock().unwrap().allow() {
            debug!(session = client.session, "plugin data rate limited");
            return;
        }
        let state = self.state.read().await;
        let mut out = msg.clone();
        out.set_sender_session(client.session);
        for session in msg.get_receiver_sessions() {
            if let Some(recipient) = state.clients.get(session) {
                if recipient.state() == ClientState::Ready {
                    recipient.send_message(out.clone());
                }
            }
        }
    }
}
