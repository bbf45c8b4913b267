//! Registered user accounts.

use openssl::hash::hash;
use openssl::hash::MessageDigest;

use std::collections::HashMap;

/// User id of the built-in SuperUser account.
pub const SUPERUSER_ID: u32 = 0;

/// A registered user of a virtual server.
#[derive(Clone, Debug, Default)]
pub struct User {
    pub id: u32,
    pub name: String,
    /// Hex SHA-1 of the password, murmur compatible. Empty means password
    /// login is disabled for the account.
    pub password_hash: String,
    /// Hex SHA-1 of the client certificate the account is bound to.
    pub cert_hash: String,
    pub email: String,
    /// Channel the user was last seen in, restored on reconnect when the
    /// server is configured to remember it.
    pub last_channel: u32,
    /// Unix seconds of the last connection.
    pub last_active: u64,
}

impl User {
    pub fn set_password(&mut self, password: &str) {
        self.password_hash = hash_password(password);
    }

    pub fn verify_password(&self, password: &str) -> bool {
        !self.password_hash.is_empty() && self.password_hash == hash_password(password)
    }
}

/// Hex SHA-1 digest used for stored passwords.
pub fn hash_password(password: &str) -> String {
    let digest = hash(MessageDigest::sha1(), password.as_bytes()).expect("sha1");
    hex::encode(digest)
}

/// The user accounts of one virtual server.
///
/// SuperUser (id 0) always exists and cannot be deleted.
#[derive(Debug)]
pub struct UserRegistry {
    users: HashMap<u32, User>,
    next_id: u32,
}

impl Default for UserRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl UserRegistry {
    pub fn new() -> Self {
        let mut users = HashMap::new();
        users.insert(
            SUPERUSER_ID,
            User {
                id: SUPERUSER_ID,
                name: "SuperUser".to_owned(),
                ..Default::default()
            },
        );
        UserRegistry { users, next_id: 1 }
    }

    pub fn get(&self, id: u32) -> Option<&User> {
        self.users.get(&id)
    }

    pub fn get_mut(&mut self, id: u32) -> Option<&mut User> {
        self.users.get_mut(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &User> {
        self.users.values()
    }

    pub fn find_by_name(&self, name: &str) -> Option<&User> {
        self.users.values().find(|u| u.name == name)
    }

    pub fn find_by_cert(&self, cert_hash: &str) -> Option<&User> {
        if cert_hash.is_empty() {
            return None;
        }
        self.users.values().find(|u| u.cert_hash == cert_hash)
    }

    /// Registers a new account and returns its id. Fails if the name is
    /// already taken.
    pub fn register(&mut self, name: &str, cert_hash: &str) -> Option<u32> {
        if self.find_by_name(name).is_some() {
            return None;
        }
        let id = self.next_id;
        self.next_id += 1;
        self.users.insert(
            id,
            User {
                id,
                name: name.to_owned(),
                cert_hash: cert_hash.to_owned(),
                ..Default::default()
            },
        );
        Some(id)
    }

    /// Re-inserts a user from a snapshot, advancing `next_id` past it.
    pub fn insert_thawed(&mut self, user: User) {
        self.next_id = self.next_id.max(user.id + 1);
        self.users.insert(user.id, user);
    }

    /// Deletes an account. SuperUser is indestructible.
    pub fn remove(&mut self, id: u32) -> bool {
        if id == SUPERUSER_ID {
            return false;
        }
        self.users.remove(&id).is_some()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn superuser_always_exists_and_cannot_be_deleted() {
        let mut reg = UserRegistry::new();
        assert_eq!(reg.get(SUPERUSER_ID).unwrap().name, "SuperUser");
        assert!(!reg.remove(SUPERUSER_ID));
        assert!(reg.get(SUPERUSER_ID).is_some());
    }

    #[test]
    fn register_assigns_fresh_ids_and_rejects_duplicates() {
        let mut reg = UserRegistry::new();
        let alice = reg.register("alice", "abcd").unwrap();
        let bob = reg.register("bob", "").unwrap();
        assert_ne!(alice, SUPERUSER_ID);
        assert_ne!(alice, bob);
        assert!(reg.register("alice", "other").is_none());

        assert_eq!(reg.find_by_name("bob").unwrap().id, bob);
        assert_eq!(reg.find_by_cert("abcd").unwrap().id, alice);
        assert!(reg.find_by_cert("").is_none());
    }

    #[test]
    fn password_verification_uses_sha1_hex() {
        let mut user = User::default();
        assert!(!user.verify_password(""));
        user.set_password("s3cret");
        assert!(user.verify_password("s3cret"));
        assert!(!user.verify_password("S3cret"));
        // Known digest, same as murmur would store.
        user.set_password("password");
        assert_eq!(
            user.password_hash,
            "5baa61e4c9b93f3f0682250b6cf8331b7ee68fd8"
        );
    }

    #[test]
    fn thawed_users_do_not_collide_with_new_ids() {
        let mut reg = UserRegistry::new();
        reg.insert_thawed(User {
            id: 17,
            name: "old".to_owned(),
            ..Default::default()
        });
        let fresh = reg.register("new", "").unwrap();
        assert!(fresh > 17);
    }
}
