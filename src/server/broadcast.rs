//! Voice fan-out.
//!
//! A single task consumes queued audio packets and delivers each to the
//! listeners the sender's target resolves to. Delivery never waits for a
//! slow receiver: the per-client send path drops frames when saturated and
//! keeps a drop counter.

use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::trace;

use crate::server::acl::Permission;
use crate::server::client::Client;
use crate::server::Server;
use crate::voice;
use crate::voice::AudioPacket;
use crate::voice::UdpPacket;

/// One audio packet from one sender, queued for fan-out.
pub struct VoiceBroadcast {
    pub sender: Arc<Client>,
    pub packet: AudioPacket,
}

impl VoiceBroadcast {
    pub fn new(sender: Arc<Client>, packet: AudioPacket) -> Self {
        VoiceBroadcast { sender, packet }
    }
}

/// Runs the dispatcher until the queue closes.
pub async fn voice_loop(server: Arc<Server>, mut rx: mpsc::Receiver<VoiceBroadcast>) {
    while let Some(broadcast) = rx.recv().await {
        dispatch(&server, broadcast).await;
    }
}

/// Delivers one packet to every listener of the sender's current target.
pub async fn dispatch(server: &Arc<Server>, broadcast: VoiceBroadcast) {
    let VoiceBroadcast { sender, packet } = broadcast;
    if sender.is_disconnected() {
        return;
    }

    // Muted senders produce no sound for anyone.
    {
        let profile = sender.profile.lock().unwrap();
        if profile.mute || profile.self_mute || profile.suppress {
            return;
        }
    }

    let state = server.state.read().await;

    let listeners: HashSet<u32> = match packet.target {
        voice::TARGET_REGULAR_SPEECH => {
            // Everyone in the sender's current channel, if it grants Speak.
            let channel_id = sender.channel_id();
            if !state
                .channels
                .has_permission(channel_id, &sender.acl_subject(), Permission::SPEAK)
            {
                return;
            }
            match state.channels.get(channel_id) {
                Some(channel) => channel.members.iter().copied().collect(),
                None => return,
            }
        }
        voice::TARGET_SERVER_LOOPBACK => [sender.session].into_iter().collect(),
        slot => {
            let mut targets = sender.targets.lock().unwrap();
            match targets.iter_mut().find(|(id, _)| *id == slot) {
                Some((_, target)) => target.resolve(&state, &sender).clone(),
                None => return,
            }
        }
    };

    // The two wire forms are rendered at most once each, on demand.
    let mut legacy_data = None;
    let mut framed_data = None;

    for session in listeners {
        let recipient = match state.clients.get(&session) {
            Some(recipient) => recipient.clone(),
            None => continue,
        };
        if recipient.session == sender.session && packet.target != voice::TARGET_SERVER_LOOPBACK
        {
            continue;
        }
        {
            let profile = recipient.profile.lock().unwrap();
            if profile.deaf || profile.self_deaf {
                continue;
            }
        }

        let legacy = recipient.legacy_udp();
        let data = if legacy {
            legacy_data
                .get_or_insert_with(|| UdpPacket::Audio(packet.clone()).data(true))
                .as_ref()
        } else {
            framed_data
                .get_or_insert_with(|| UdpPacket::Audio(packet.clone()).data(false))
                .as_ref()
        };
        match data {
            Ok(bytes) => recipient.send_udp(server, bytes),
            Err(err) => {
                // Payloads that cannot be expressed in the recipient's
                // framing (CELT to a length-delimited client) are skipped
                // for that recipient only.
                trace!(
                    session = recipient.session,
                    "skipping recipient, not encodable: {}",
                    err
                );
            }
        }
    }
}
