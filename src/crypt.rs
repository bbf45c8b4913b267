//! Implementation of the cryptography used for the voice channel.
//!
//! Each client gets its own [CryptState] with a shared AES key and one
//! 128-bit IV per direction, acting as little-endian nonce counters. The
//! encrypted datagram is `IV[0] || MAC[0..3] || ciphertext`, so the overhead
//! is [OVERHEAD] bytes and the receiver can recover the full nonce from its
//! low byte alone as long as it never falls more than 30 packets behind.

use bytes::BytesMut;
use openssl::memcmp;
use openssl::rand::rand_bytes;
use std::convert::TryInto;
use std::time::Duration;
use std::time::Instant;

/// Size in bytes of the AES key used in `CryptState`.
pub const KEY_SIZE: usize = 16;
/// Size in bytes of blocks for the AES primitive.
pub const BLOCK_SIZE: usize = std::mem::size_of::<u128>();
/// Bytes prepended to each encrypted datagram: one nonce byte and three
/// bytes of MAC truncation.
pub const OVERHEAD: usize = 4;

/// Implements OCB2-AES128 for encryption and authentication of the voice
/// packets when transmitted over UDP.
/// Also provides statistics about good, late, lost and replayed packets.
///
/// Note that OCB is covered by patents, however a license has been granted
/// for use in "most" software. See: http://web.cs.ucdavis.edu/~rogaway/ocb/license.htm
///
/// Based on https://github.com/mumble-voip/mumble/blob/e31d267a11b4ed0597ad41309a7f6b715837141f/src/CryptState.cpp
pub struct CryptState {
    key: [u8; KEY_SIZE],
    // internally as native endianness, externally as little endian and during ocb_* as big endian
    encrypt_nonce: u128,
    decrypt_nonce: u128,
    decrypt_history: [u8; 0x100],

    good: u32,
    late: u32,
    lost: u32,
    replay: u32,
    resync: u32,
    last_good: Option<Instant>,
}

/// Packet statistics of the decrypt direction of a [CryptState].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CryptStats {
    /// Packets transmitted without issues.
    pub good: u32,
    /// Packets which were transmitted successfully but arrived late.
    pub late: u32,
    /// Packets which were lost.
    pub lost: u32,
    /// Packets which had already been decrypted before.
    pub replay: u32,
    /// Nonce resyncs performed.
    pub resync: u32,
}

/// The reason a decrypt operation failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecryptError {
    /// The packet is too short to be decrypted.
    Eof,
    /// The packet has already been decrypted previously.
    Repeat,
    /// The packet was far too late.
    Late,
    /// The MAC of the decrypted packet did not match.
    ///
    /// This may also indicate a substantial de-sync of the decryption nonce.
    Mac,
}

impl CryptState {
    /// Creates a new CryptState with randomly generated key and initial
    /// encrypt- and decrypt-nonce.
    pub fn generate_new() -> Self {
        let mut key = [0; KEY_SIZE];
        let mut encrypt_nonce = [0; BLOCK_SIZE];
        let mut decrypt_nonce = [0; BLOCK_SIZE];
        rand_bytes(&mut key).unwrap();
        rand_bytes(&mut encrypt_nonce).unwrap();
        rand_bytes(&mut decrypt_nonce).unwrap();
        Self::new_from(key, encrypt_nonce, decrypt_nonce)
    }

    /// Creates a new CryptState from previously generated key, encrypt- and
    /// decrypt-nonce.
    pub fn new_from(
        key: [u8; KEY_SIZE],
        encrypt_nonce: [u8; BLOCK_SIZE],
        decrypt_nonce: [u8; BLOCK_SIZE],
    ) -> Self {
        CryptState {
            key,
            encrypt_nonce: u128::from_le_bytes(encrypt_nonce),
            decrypt_nonce: u128::from_le_bytes(decrypt_nonce),
            decrypt_history: [0; 0x100],

            good: 0,
            late: 0,
            lost: 0,
            replay: 0,
            resync: 0,
            last_good: None,
        }
    }

    /// Returns the packet statistics of the decrypt direction.
    pub fn stats(&self) -> CryptStats {
        CryptStats {
            good: self.good,
            late: self.late,
            lost: self.lost,
            replay: self.replay,
            resync: self.resync,
        }
    }

    /// Time since the last successful decrypt, if any.
    pub fn last_good_elapsed(&self) -> Option<Duration> {
        self.last_good.map(|at| at.elapsed())
    }

    /// Returns the shared, **private** key.
    pub fn get_key(&self) -> &[u8; KEY_SIZE] {
        &self.key
    }

    /// Returns the nonce used for encrypting.
    pub fn get_encrypt_nonce(&self) -> [u8; BLOCK_SIZE] {
        self.encrypt_nonce.to_le_bytes()
    }

    /// Returns the nonce used for decrypting.
    pub fn get_decrypt_nonce(&self) -> [u8; BLOCK_SIZE] {
        self.decrypt_nonce.to_le_bytes()
    }

    /// Updates the nonce used for decrypting and resets the replay window.
    ///
    /// This is the receiving half of the resync exchange; the counter it
    /// bumps is reported in ping statistics.
    pub fn set_decrypt_nonce(&mut self, nonce: &[u8; BLOCK_SIZE]) {
        self.decrypt_nonce = u128::from_le_bytes(*nonce);
        self.decrypt_history = [0; 0x100];
        self.resync += 1;
    }

    /// Encrypts a datagram and appends the result (header plus ciphertext)
    /// to `dst`.
    pub fn encrypt(&mut self, src: &[u8], dst: &mut BytesMut) {
        self.encrypt_nonce = self.encrypt_nonce.wrapping_add(1);

        // Leave four bytes for the header
        let base = dst.len();
        dst.resize(base + OVERHEAD, 0);
        let mut inner = dst.split_off(base + OVERHEAD);
        inner.extend_from_slice(src);

        let tag = self.ocb_encrypt(inner.as_mut());
        dst.unsplit(inner);

        dst[base] = self.encrypt_nonce as u8;
        dst[base + 1..base + 4].copy_from_slice(&tag.to_be_bytes()[0..3]);
    }

    /// Decrypts a datagram in place: on success `buf` holds the plaintext
    /// with the header stripped.
    pub fn decrypt(&mut self, buf: &mut BytesMut) -> Result<(), DecryptError> {
        if buf.len() < OVERHEAD {
            return Err(DecryptError::Eof);
        }
        let header = buf.split_to(OVERHEAD);
        let nonce_0 = header[0];

        // If we update our decrypt_nonce and the tag check fails or we've been processing late
        // packets, we need to revert it
        let saved_nonce = self.decrypt_nonce;
        let mut late = false; // will always restore nonce if this is the case
        let mut lost = 0; // for stats only

        if self.decrypt_nonce.wrapping_add(1) as u8 == nonce_0 {
            // in order
            self.decrypt_nonce = self.decrypt_nonce.wrapping_add(1);
        } else {
            // packet is late or repeated, or we lost a few packets in between
            let diff = nonce_0.wrapping_sub(self.decrypt_nonce as u8) as i8;
            self.decrypt_nonce = self.decrypt_nonce.wrapping_add(diff as u128);
            if diff > 0 {
                lost = i32::from(diff - 1); // lost a few packets in between this and the last one
            } else if diff > -30 {
                if self.decrypt_history[nonce_0 as usize] == (self.decrypt_nonce >> 8) as u8 {
                    self.decrypt_nonce = saved_nonce;
                    self.replay += 1;
                    return Err(DecryptError::Repeat);
                }
                // just late
                late = true;
                lost = -1;
            } else {
                self.decrypt_nonce = saved_nonce;
                return Err(DecryptError::Late); // late by more than 30 packets
            }
        }

        let tag = self.ocb_decrypt(buf.as_mut());
        if !memcmp::eq(&tag.to_be_bytes()[0..3], &header[1..4]) {
            self.decrypt_nonce = saved_nonce;
            return Err(DecryptError::Mac);
        }

        self.decrypt_history[nonce_0 as usize] = (self.decrypt_nonce >> 8) as u8;

        self.good += 1;
        self.last_good = Some(Instant::now());
        if late {
            self.late += 1;
            self.decrypt_nonce = saved_nonce;
        }
        self.lost = (self.lost as i32 + lost) as u32;

        Ok(())
    }

    /// Encrypt the provided buffer using AES-OCB, returning the tag.
    fn ocb_encrypt(&self, mut buf: &mut [u8]) -> u128 {
        let mut offset = self.aes_encrypt(self.encrypt_nonce.to_be());
        let mut checksum = 0u128;

        while buf.len() > BLOCK_SIZE {
            let (chunk, remainder) = buf.split_at_mut(BLOCK_SIZE);
            buf = remainder;
            let chunk: &mut [u8; BLOCK_SIZE] = chunk.try_into().expect("split_at works");

            offset = s2(offset);

            let plain = u128::from_be_bytes(*chunk);
            let encrypted = self.aes_encrypt(offset ^ plain) ^ offset;
            chunk.copy_from_slice(&encrypted.to_be_bytes());

            checksum ^= plain;
        }

        offset = s2(offset);

        let len = buf.len();
        assert!(len <= BLOCK_SIZE);
        let pad = self.aes_encrypt((len * 8) as u128 ^ offset);
        let mut block = pad.to_be_bytes();
        block[..len].copy_from_slice(buf);
        let plain = u128::from_be_bytes(block);
        let encrypted = pad ^ plain;
        buf.copy_from_slice(&encrypted.to_be_bytes()[..len]);

        checksum ^= plain;

        self.aes_encrypt(offset ^ s2(offset) ^ checksum)
    }

    /// Decrypt the provided buffer using AES-OCB, returning the tag.
    /// **Make sure to verify that the tag matches!**
    fn ocb_decrypt(&self, mut buf: &mut [u8]) -> u128 {
        let mut offset = self.aes_encrypt(self.decrypt_nonce.to_be());
        let mut checksum = 0u128;

        while buf.len() > BLOCK_SIZE {
            let (chunk, remainder) = buf.split_at_mut(BLOCK_SIZE);
            buf = remainder;
            let chunk: &mut [u8; BLOCK_SIZE] = chunk.try_into().expect("split_at works");

            offset = s2(offset);

            let encrypted = u128::from_be_bytes(*chunk);
            let plain = self.aes_decrypt(offset ^ encrypted) ^ offset;
            chunk.copy_from_slice(&plain.to_be_bytes());

            checksum ^= plain;
        }

        offset = s2(offset);

        let len = buf.len();
        assert!(len <= BLOCK_SIZE);
        let pad = self.aes_encrypt((len * 8) as u128 ^ offset);
        let mut block = [0; BLOCK_SIZE];
        block[..len].copy_from_slice(buf);
        let plain = u128::from_be_bytes(block) ^ pad;
        buf.copy_from_slice(&plain.to_be_bytes()[..len]);

        checksum ^= plain;

        self.aes_encrypt(offset ^ s2(offset) ^ checksum)
    }

    /// AES-128 encryption primitive.
    fn aes_encrypt(&self, block: u128) -> u128 {
        let mut result = [0u8; BLOCK_SIZE * 2];
        let mut crypter = openssl::symm::Crypter::new(
            openssl::symm::Cipher::aes_128_ecb(),
            openssl::symm::Mode::Encrypt,
            &self.key,
            None,
        )
        .unwrap();
        crypter.pad(false);
        crypter.update(&block.to_be_bytes(), &mut result).unwrap();
        crypter.finalize(&mut result).unwrap();
        u128::from_be_bytes((&result[..BLOCK_SIZE]).try_into().unwrap())
    }

    /// AES-128 decryption primitive.
    fn aes_decrypt(&self, block: u128) -> u128 {
        let mut result = [0u8; BLOCK_SIZE * 2];
        let mut crypter = openssl::symm::Crypter::new(
            openssl::symm::Cipher::aes_128_ecb(),
            openssl::symm::Mode::Decrypt,
            &self.key,
            None,
        )
        .unwrap();
        crypter.pad(false);
        crypter.update(&block.to_be_bytes(), &mut result).unwrap();
        crypter.finalize(&mut result).unwrap();
        u128::from_be_bytes((&result[..BLOCK_SIZE]).try_into().unwrap())
    }
}

fn s2(block: u128) -> u128 {
    let rot = block.rotate_left(1);
    let carry = rot & 1;
    rot ^ (carry * 0x86)
}

#[cfg(test)]
mod test {
    use bytes::BufMut;

    use super::*;

    fn u128hex(src: &str) -> u128 {
        u128::from_str_radix(src, 16).unwrap()
    }

    fn bytes_from_hex(src: &str) -> BytesMut {
        let mut buf = BytesMut::new();
        hex_to_bytes(src, &mut buf);
        buf
    }

    fn hex_to_bytes(src: &str, dst: &mut BytesMut) {
        dst.clear();
        dst.reserve(src.len() / 2);
        let mut iter = src.chars();
        while !iter.as_str().is_empty() {
            dst.put_u8(u8::from_str_radix(&iter.as_str()[..2], 16).unwrap());
            iter.next();
            iter.next();
        }
    }

    /// Pair of states wired to talk to each other. The nonces are fixed with
    /// a non-zero second byte so the replay history (which stores that byte)
    /// never collides with its initial value during a test.
    fn pair() -> (CryptState, CryptState) {
        let mut key = [0; KEY_SIZE];
        rand_bytes(&mut key).unwrap();
        let mut a_nonce = [0u8; BLOCK_SIZE];
        a_nonce[1] = 0x55;
        let mut b_nonce = [0u8; BLOCK_SIZE];
        b_nonce[1] = 0x66;
        (
            CryptState::new_from(key, a_nonce, b_nonce),
            CryptState::new_from(key, b_nonce, a_nonce),
        )
    }

    #[test]
    fn aes_test_vectors() {
        let key = u128hex("E8E9EAEBEDEEEFF0F2F3F4F5F7F8F9FA");
        let state = CryptState::new_from(key.to_be_bytes(), Default::default(), Default::default());
        assert_eq!(
            u128hex("6743C3D1519AB4F2CD9A78AB09A511BD"),
            state.aes_encrypt(u128hex("014BAF2278A69D331D5180103643E99A"))
        );
        assert_eq!(
            u128hex("014BAF2278A69D331D5180103643E99A"),
            state.aes_decrypt(u128hex("6743C3D1519AB4F2CD9A78AB09A511BD"))
        );
    }

    // Test vectors from http://web.cs.ucdavis.edu/~rogaway/papers/draft-krovetz-ocb-00.txt
    // (excluding ones with headers since those aren't implemented here)
    #[test]
    #[allow(clippy::cognitive_complexity)] // all macro-generated
    fn ocb_test_vectors() {
        macro_rules! test_cases {
            ($(
                T : $name:expr,
                M : $plain:expr,
                C : $cipher:expr,
                T : $tag:expr,
            )*) => {$(
                let key = u128hex("000102030405060708090a0b0c0d0e0f");
                let nonce = u128hex("000102030405060708090a0b0c0d0e0f");
                let state = CryptState::new_from(
                    key.to_be_bytes(),
                    nonce.to_be_bytes(),
                    nonce.to_be_bytes(),
                );

                let mut result = BytesMut::new();
                hex_to_bytes($plain.as_ref(), &mut result);
                let tag = state.ocb_encrypt(&mut result);
                assert_eq!(bytes_from_hex($cipher), result, concat!("ENCRYPT-RESULT-", $name));
                assert_eq!(u128hex($tag), tag, concat!("ENCRYPT-TAG-", $name));

                hex_to_bytes($cipher.as_ref(), &mut result);
                let tag = state.ocb_decrypt(&mut result);
                assert_eq!(bytes_from_hex($plain), result, concat!("DECRYPT-RESULT-", $name));
                assert_eq!(u128hex($tag), tag, concat!("DECRYPT-TAG-", $name));
            )*};
        }

        test_cases! {
            T : "OCB-AES-128-0B",
            M : "",
            C : "",
            T : "BF3108130773AD5EC70EC69E7875A7B0",

            T : "OCB-AES-128-8B",
            M : "0001020304050607",
            C : "C636B3A868F429BB",
            T : "A45F5FDEA5C088D1D7C8BE37CABC8C5C",

            T : "OCB-AES-128-16B",
            M : "000102030405060708090A0B0C0D0E0F",
            C : "52E48F5D19FE2D9869F0C4A4B3D2BE57",
            T : "F7EE49AE7AA5B5E6645DB6B3966136F9",

            T : "OCB-AES-128-24B",
            M : "000102030405060708090A0B0C0D0E0F1011121314151617",
            C : "F75D6BC8B4DC8D66B836A2B08B32A636CC579E145D323BEB",
            T : "A1A50F822819D6E0A216784AC24AC84C",

            T : "OCB-AES-128-32B",
            M : "000102030405060708090A0B0C0D0E0F101112131415161718191A1B1C1D1E1F",
            C : "F75D6BC8B4DC8D66B836A2B08B32A636CEC3C555037571709DA25E1BB0421A27",
            T : "09CA6C73F0B5C6C5FD587122D75F2AA3",

            T : "OCB-AES-128-40B",
            M : "000102030405060708090A0B0C0D0E0F101112131415161718191A1B1C1D1E1F2021222324252627",
            C : "F75D6BC8B4DC8D66B836A2B08B32A6369F1CD3C5228D79FD6C267F5F6AA7B231C7DFB9D59951AE9C",
            T : "9DB0CDF880F73E3E10D4EB3217766688",
        }
    }

    #[test]
    fn encrypt_and_decrypt_are_inverse() {
        let (mut alice, mut bob) = pair();
        let payload = b"a voice packet of no particular significance";

        let mut wire = BytesMut::new();
        alice.encrypt(payload, &mut wire);
        assert_eq!(wire.len(), payload.len() + OVERHEAD);

        bob.decrypt(&mut wire).expect("Failed to decrypt");
        assert_eq!(&wire[..], &payload[..]);
        assert_eq!(bob.stats().good, 1);
    }

    #[test]
    fn replayed_packet_is_rejected_exactly_once() {
        let (mut alice, mut bob) = pair();

        let mut wire = BytesMut::new();
        alice.encrypt(b"first", &mut wire);
        let replayed = wire.clone();

        bob.decrypt(&mut wire).unwrap();

        // Keep the stream moving so the replay arrives as a late packet,
        // not as the current one.
        for _ in 0..3 {
            let mut next = BytesMut::new();
            alice.encrypt(b"next", &mut next);
            bob.decrypt(&mut next).unwrap();
        }

        let mut again = replayed.clone();
        assert_eq!(bob.decrypt(&mut again), Err(DecryptError::Repeat));
        let stats = bob.stats();
        assert_eq!(stats.replay, 1);
        assert_eq!(stats.good, 4);
        assert_eq!(stats.late, 0);
        assert_eq!(stats.lost, 0);
    }

    #[test]
    fn each_nonce_decrypts_exactly_once() {
        let (mut alice, mut bob) = pair();
        let mut captured = Vec::new();
        for i in 0..50u8 {
            let mut wire = BytesMut::new();
            alice.encrypt(&[i], &mut wire);
            captured.push(wire.clone());
            bob.decrypt(&mut wire).unwrap();
            assert_eq!(&wire[..], &[i]);
        }
        assert_eq!(bob.stats().good, 50);
        for wire in &captured[25..] {
            let mut again = wire.clone();
            assert!(bob.decrypt(&mut again).is_err());
        }
        assert_eq!(bob.stats().good, 50);
    }

    #[test]
    fn late_packet_within_window_is_accepted_once() {
        let (mut alice, mut bob) = pair();

        let mut held_back = BytesMut::new();
        alice.encrypt(b"late", &mut held_back);

        // Deliver a few packets ahead of the held back one.
        for _ in 0..5 {
            let mut wire = BytesMut::new();
            alice.encrypt(b"ahead", &mut wire);
            bob.decrypt(&mut wire).unwrap();
        }

        let mut wire = held_back.clone();
        bob.decrypt(&mut wire).unwrap();
        assert_eq!(&wire[..], b"late");
        assert_eq!(bob.stats().late, 1);

        let mut again = held_back.clone();
        assert_eq!(bob.decrypt(&mut again), Err(DecryptError::Repeat));
    }

    #[test]
    fn missed_nonce_is_not_accepted_after_window_rollover() {
        let (mut alice, mut bob) = pair();

        // A packet that gets lost in transit.
        let mut missed = BytesMut::new();
        alice.encrypt(b"missed", &mut missed);

        // The window rolls over completely before it shows up again.
        for _ in 0..=0x100 {
            let mut wire = BytesMut::new();
            alice.encrypt(b"flow", &mut wire);
            bob.decrypt(&mut wire).unwrap();
        }

        assert!(bob.decrypt(&mut missed.clone()).is_err());
    }

    #[test]
    fn far_too_late_packet_is_rejected() {
        let (mut alice, mut bob) = pair();

        let mut stale = BytesMut::new();
        alice.encrypt(b"stale", &mut stale);

        for _ in 0..40 {
            let mut wire = BytesMut::new();
            alice.encrypt(b"flow", &mut wire);
            bob.decrypt(&mut wire).unwrap();
        }

        assert_eq!(bob.decrypt(&mut stale.clone()), Err(DecryptError::Late));
    }

    #[test]
    fn corrupted_packet_fails_mac() {
        let (mut alice, mut bob) = pair();
        let mut wire = BytesMut::new();
        alice.encrypt(b"payload", &mut wire);
        let last = wire.len() - 1;
        wire[last] ^= 0xff;
        assert_eq!(bob.decrypt(&mut wire), Err(DecryptError::Mac));
        assert_eq!(bob.stats().good, 0);
    }

    #[test]
    fn resync_updates_nonce_and_counter() {
        let (mut alice, mut bob) = pair();

        // Simulate a desync: run the sender far ahead silently.
        for _ in 0..1000 {
            let mut wire = BytesMut::new();
            alice.encrypt(b"void", &mut wire);
        }

        bob.set_decrypt_nonce(&alice.get_encrypt_nonce());
        assert_eq!(bob.stats().resync, 1);

        let mut wire = BytesMut::new();
        alice.encrypt(b"after resync", &mut wire);
        bob.decrypt(&mut wire).unwrap();
        assert_eq!(&wire[..], b"after resync");
    }
}
