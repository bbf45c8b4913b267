//! Snapshots of the persistent server state.
//!
//! A snapshot is a serialized [msgs::FrozenServer] in `main.fz`. Writing
//! goes through a temp file in the same directory, an fsync, and an atomic
//! replace that keeps the previous snapshot as `backup.fz`; a reader can
//! never observe a partial file. Temp files orphaned by a crash are
//! removed at boot.

use protobuf::Message;
use std::fs;
use std::io;
use std::io::Write;
use std::path::Path;
use tracing::info;
use tracing::warn;

use crate::msgs;
use crate::server::acl::AclEntry;
use crate::server::acl::Group;
use crate::server::acl::Permission;
use crate::server::ban::Ban;
use crate::server::channel::Channel;
use crate::server::config::Config;
use crate::server::user::User;
use crate::server::State;

/// File name of the current snapshot.
pub const SNAPSHOT_FILE: &str = "main.fz";
/// File name of the previous snapshot, kept by the atomic replace.
pub const BACKUP_FILE: &str = "backup.fz";
/// Prefix of in-progress snapshot temp files.
const TEMP_PREFIX: &str = ".main.fz_";

/// Captures the persistent parts of the server state.
pub fn snapshot(state: &State, cfg: &Config) -> msgs::FrozenServer {
    let mut frozen = msgs::FrozenServer::new();

    for (key, value) in cfg.entries() {
        let mut entry = msgs::ConfigEntry::new();
        entry.set_key(key.to_owned());
        entry.set_value(value.to_owned());
        frozen.mut_config().push(entry);
    }

    let mut channels: Vec<&Channel> = state
        .channels
        .iter()
        .filter(|channel| !channel.temporary)
        .collect();
    channels.sort_by_key(|channel| channel.id);
    for channel in channels {
        let mut out = msgs::FrozenChannel::new();
        out.set_id(channel.id);
        out.set_name(channel.name.clone());
        if let Some(parent) = channel.parent {
            out.set_parent_id(parent);
        }
        out.set_position(i64::from(channel.position));
        out.set_inherit_acl(channel.acl.inherit);
        out.set_links(channel.links.iter().copied().collect());
        if let Some(blob) = &channel.description_blob {
            out.set_description_blob(blob.clone());
        }
        for entry in &channel.acl.entries {
            let mut acl = msgs::FrozenAclEntry::new();
            if let Some(user_id) = entry.user_id {
                acl.set_user_id(user_id);
            }
            if let Some(group) = &entry.group {
                acl.set_group(group.clone());
            }
            acl.set_apply_here(entry.apply_here);
            acl.set_apply_subs(entry.apply_subs);
            acl.set_grant(entry.grant.0);
            acl.set_deny(entry.deny.0);
            out.mut_acls().push(acl);
        }
        for group in channel.acl.groups.values() {
            let mut frozen_group = msgs::FrozenGroup::new();
            frozen_group.set_name(group.name.clone());
            frozen_group.set_inherit(group.inherit);
            frozen_group.set_inheritable(group.inheritable);
            frozen_group.set_add(group.add.iter().copied().collect());
            frozen_group.set_remove(group.remove.iter().copied().collect());
            out.mut_groups().push(frozen_group);
        }
        frozen.mut_channels().push(out);
    }

    for user in state.users.iter() {
        let mut out = msgs::FrozenUser::new();
        out.set_id(user.id);
        out.set_name(user.name.clone());
        out.set_password_hash(user.password_hash.clone());
        out.set_cert_hash(user.cert_hash.clone());
        out.set_email(user.email.clone());
        out.set_last_channel_id(user.last_channel);
        out.set_last_active(user.last_active);
        frozen.mut_users().push(out);
    }

    for ban in &state.bans {
        let mut out = msgs::FrozenBan::new();
        out.set_address(ban.address.to_vec());
        out.set_mask(ban.mask);
        out.set_name(ban.name.clone());
        out.set_cert_hash(ban.cert_hash.clone());
        out.set_reason(ban.reason.clone());
        out.set_start(ban.start);
        out.set_duration(ban.duration);
        frozen.mut_bans().push(out);
    }

    frozen
}

/// Applies a snapshot onto fresh state.
pub fn apply(frozen: &msgs::FrozenServer, state: &mut State, cfg: &mut Config) {
    for entry in frozen.get_config() {
        cfg.set(entry.get_key(), entry.get_value());
    }

    for channel in frozen.get_channels() {
        let mut acl = crate::server::acl::AclSet {
            inherit: channel.get_inherit_acl(),
            ..Default::default()
        };
        for entry in channel.get_acls() {
            acl.entries.push(AclEntry {
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
        for group in channel.get_groups() {
            acl.groups.insert(
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

        state.channels.insert_thawed(Channel {
            id: channel.get_id(),
            name: channel.get_name().to_owned(),
            parent: if channel.has_parent_id() && channel.get_id() != 0 {
                Some(channel.get_parent_id())
            } else {
                None
            },
            children: Vec::new(),
            links: channel.get_links().iter().copied().collect(),
            position: channel.get_position() as i32,
            temporary: false,
            max_users: 0,
            description_blob: if channel.has_description_blob() {
                Some(channel.get_description_blob().to_owned())
            } else {
                None
            },
            acl,
            members: Default::default(),
        });
    }
    state.channels.rebuild_children();

    for user in frozen.get_users() {
        state.users.insert_thawed(User {
            id: user.get_id(),
            name: user.get_name().to_owned(),
            password_hash: user.get_password_hash().to_owned(),
            cert_hash: user.get_cert_hash().to_owned(),
            email: user.get_email().to_owned(),
            last_channel: user.get_last_channel_id(),
            last_active: user.get_last_active(),
        });
    }

    for ban in frozen.get_bans() {
        if ban.get_address().len() != 16 {
            continue;
        }
        let mut address = [0u8; 16];
        address.copy_from_slice(ban.get_address());
        state.bans.push(Ban {
            address,
            mask: ban.get_mask(),
            name: ban.get_name().to_owned(),
            cert_hash: ban.get_cert_hash().to_owned(),
            reason: ban.get_reason().to_owned(),
            start: ban.get_start(),
            duration: ban.get_duration(),
        });
    }
}

/// Writes a snapshot with the atomic-replace protocol.
pub fn write_snapshot(dir: &Path, frozen: &msgs::FrozenServer) -> io::Result<()> {
    let buf = frozen
        .write_to_bytes()
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

    let mut temp = tempfile::Builder::new()
        .prefix(TEMP_PREFIX)
        .tempfile_in(dir)?;
    temp.write_all(&buf)?;
    temp.as_file().sync_all()?;

    let main = dir.join(SNAPSHOT_FILE);
    let backup = dir.join(BACKUP_FILE);

    // First freeze: a plain rename does the job. Otherwise the current
    // snapshot becomes the backup before the replacement lands.
    if main.exists() {
        fs::rename(&main, &backup)?;
    }
    temp.persist(&main).map_err(|e| e.error)?;
    Ok(())
}

/// Reads the current snapshot; a corrupted `main.fz` falls back to the
/// backup.
pub fn read_snapshot(dir: &Path) -> io::Result<Option<msgs::FrozenServer>> {
    for name in [SNAPSHOT_FILE, BACKUP_FILE] {
        let path = dir.join(name);
        if !path.exists() {
            continue;
        }
        let buf = fs::read(&path)?;
        match msgs::FrozenServer::parse_from_bytes(&buf) {
            Ok(frozen) => return Ok(Some(frozen)),
            Err(err) => {
                warn!(file = %path.display(), "unreadable snapshot: {}", err);
            }
        }
    }
    Ok(None)
}

/// Removes snapshot temp files orphaned by an interrupted freeze.
pub fn clean_orphans(dir: &Path) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if let Some(name) = entry.file_name().to_str() {
            if name.starts_with(TEMP_PREFIX) {
                info!(file = name, "removing orphaned snapshot temp file");
                let _ = fs::remove_file(entry.path());
            }
        }
    }
    Ok(())
}

/// Builds a snapshot from a murmur SQLite database, for `--import-murmurdb`.
pub fn import_murmur(db_path: &Path, server_id: u64) -> anyhow::Result<msgs::FrozenServer> {
    let conn = rusqlite::Connection::open_with_flags(
        db_path,
        rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY,
    )?;
    let mut frozen = msgs::FrozenServer::new();

    {
        let mut stmt =
            conn.prepare("SELECT channel_id, parent_id, name FROM channels WHERE server_id = ?1")?;
        let mut rows = stmt.query([server_id as i64])?;
        while let Some(row) = rows.next()? {
            let id: i64 = row.get(0)?;
            // The murmur root carries parent_id -1.
            let parent: Option<i64> = row.get(1)?;
            let mut out = msgs::FrozenChannel::new();
            out.set_id(id as u32);
            if let Some(parent) = parent {
                if parent >= 0 && id != 0 {
                    out.set_parent_id(parent as u32);
                }
            }
            out.set_name(row.get::<_, String>(2)?);
            out.set_inherit_acl(true);
            frozen.mut_channels().push(out);
        }
    }

    {
        let mut stmt = conn.prepare(
            "SELECT user_id, name, pw, lastchannel FROM users WHERE server_id = ?1",
        )?;
        let mut rows = stmt.query([server_id as i64])?;
        while let Some(row) = rows.next()? {
            let mut out = msgs::FrozenUser::new();
            out.set_id(row.get::<_, i64>(0)? as u32);
            out.set_name(row.get::<_, String>(1)?);
            out.set_password_hash(row.get::<_, Option<String>>(2)?.unwrap_or_default());
            let last_channel = row.get::<_, Option<i64>>(3)?.unwrap_or(0);
            out.set_last_channel_id(last_channel.max(0) as u32);
            frozen.mut_users().push(out);
        }
    }

    {
        let mut stmt = conn.prepare(
            "SELECT base, mask, name, hash, reason, start, duration FROM bans WHERE server_id = ?1",
        )?;
        let mut rows = stmt.query([server_id as i64])?;
        while let Some(row) = rows.next()? {
            let base: Vec<u8> = row.get(0)?;
            if base.len() != 16 {
                continue;
            }
            let mut out = msgs::FrozenBan::new();
            out.set_address(base);
            out.set_mask(row.get(1)?);
            out.set_name(row.get::<_, Option<String>>(2)?.unwrap_or_default());
            out.set_cert_hash(row.get::<_, Option<String>>(3)?.unwrap_or_default());
            out.set_reason(row.get::<_, Option<String>>(4)?.unwrap_or_default());
            out.set_start(row.get::<_, Option<i64>>(5)?.unwrap_or(0));
            out.set_duration(row.get::<_, Option<u32>>(6)?.unwrap_or(0));
            frozen.mut_bans().push(out);
        }
    }

    info!(
        channels = frozen.get_channels().len(),
        users = frozen.get_users().len(),
        bans = frozen.get_bans().len(),
        "murmur database read"
    );
    Ok(frozen)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::server::channel::ROOT_CHANNEL_ID;

    fn sample_state() -> (State, Config) {
        let mut state = State::default();
        let mut cfg = Config::new();
        cfg.set("WelcomeText", "hello");

        let a = state.channels.add(ROOT_CHANNEL_ID, "A", false).unwrap();
        let b = state.channels.add(a, "B", false).unwrap();
        state.channels.add(a, "tmp", true).unwrap();
        state.channels.link(a, b).unwrap();

        let uid = state.users.register("alice", "cafebabe").unwrap();
        state.users.get_mut(uid).unwrap().last_channel = b;
        state.bans.push(Ban::single(
            "203.0.113.5".parse().unwrap(),
            "mallory",
            "spam",
            0,
        ));
        (state, cfg)
    }

    #[test]
    fn snapshot_and_apply_roundtrip() {
        let (state, cfg) = sample_state();
        let frozen = snapshot(&state, &cfg);

        let mut thawed = State::default();
        let mut thawed_cfg = Config::new();
        apply(&frozen, &mut thawed, &mut thawed_cfg);

        assert_eq!(thawed_cfg.str_value("WelcomeText"), "hello");
        // Channel A and B survive, the temporary channel does not.
        let names: Vec<String> = thawed
            .channels
            .dfs_order()
            .iter()
            .map(|id| thawed.channels.get(*id).unwrap().name.clone())
            .collect();
        assert!(names.contains(&"A".to_owned()));
        assert!(names.contains(&"B".to_owned()));
        assert!(!names.contains(&"tmp".to_owned()));

        let alice = thawed.users.find_by_name("alice").unwrap();
        assert_eq!(alice.cert_hash, "cafebabe");
        assert_eq!(thawed.bans.len(), 1);
        assert_eq!(thawed.bans[0].name, "mallory");
    }

    #[test]
    fn links_survive_the_roundtrip() {
        let (state, cfg) = sample_state();
        let frozen = snapshot(&state, &cfg);
        let mut thawed = State::default();
        apply(&frozen, &mut thawed, &mut Config::new());

        let a = thawed
            .channels
            .iter()
            .find(|c| c.name == "A")
            .unwrap()
            .id;
        assert!(thawed.channels.all_links(a).len() > 1);
    }

    #[test]
    fn write_is_atomic_with_backup() {
        let dir = tempfile::tempdir().unwrap();
        let (state, cfg) = sample_state();
        let frozen = snapshot(&state, &cfg);

        // First freeze: plain rename, no backup yet.
        write_snapshot(dir.path(), &frozen).unwrap();
        assert!(dir.path().join(SNAPSHOT_FILE).exists());
        assert!(!dir.path().join(BACKUP_FILE).exists());

        // Second freeze: the old snapshot becomes the backup.
        let mut cfg2 = cfg.clone();
        cfg2.set("WelcomeText", "changed");
        write_snapshot(dir.path(), &snapshot(&state, &cfg2)).unwrap();
        assert!(dir.path().join(BACKUP_FILE).exists());

        let current = read_snapshot(dir.path()).unwrap().unwrap();
        let mut thawed_cfg = Config::new();
        apply(&current, &mut State::default(), &mut thawed_cfg);
        assert_eq!(thawed_cfg.str_value("WelcomeText"), "changed");

        // No temp files are left behind.
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(TEMP_PREFIX))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn interrupted_freeze_leaves_previous_snapshot_and_orphan_is_cleaned() {
        let dir = tempfile::tempdir().unwrap();
        let (state, cfg) = sample_state();
        write_snapshot(dir.path(), &snapshot(&state, &cfg)).unwrap();
        let before = fs::read(dir.path().join(SNAPSHOT_FILE)).unwrap();

        // Simulate a crash after the temp file was written but before the
        // rename: the orphan sits next to an untouched main.fz.
        fs::write(dir.path().join(".main.fz_zzzz"), b"partial").unwrap();

        assert_eq!(fs::read(dir.path().join(SNAPSHOT_FILE)).unwrap(), before);
        clean_orphans(dir.path()).unwrap();
        assert!(!dir.path().join(".main.fz_zzzz").exists());
        assert!(dir.path().join(SNAPSHOT_FILE).exists());
    }

    #[test]
    fn corrupted_snapshot_falls_back_to_backup() {
        let dir = tempfile::tempdir().unwrap();
        let (state, cfg) = sample_state();
        write_snapshot(dir.path(), &snapshot(&state, &cfg)).unwrap();
        write_snapshot(dir.path(), &snapshot(&state, &cfg)).unwrap();

        fs::write(dir.path().join(SNAPSHOT_FILE), b"\xff\xff\xff garbage").unwrap();
        assert!(read_snapshot(dir.path()).unwrap().is_some());
    }

    #[test]
    fn missing_snapshot_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_snapshot(dir.path()).unwrap().is_none());
    }
}
