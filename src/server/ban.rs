//! Server-scoped address bans.

use std::net::IpAddr;
use std::net::Ipv6Addr;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

/// One ban entry. Addresses are stored as 16 bytes with IPv4 mapped into
/// IPv6, matched under a prefix mask. A `duration` of zero is permanent.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Ban {
    pub address: [u8; 16],
    /// Prefix length in bits.
    pub mask: u32,
    pub name: String,
    pub cert_hash: String,
    pub reason: String,
    /// Unix seconds when the ban was issued.
    pub start: i64,
    /// Seconds the ban lasts; 0 means permanent.
    pub duration: u32,
}

pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Normalizes an address to the 16-byte mapped form bans are stored in.
pub fn mapped_bytes(ip: IpAddr) -> [u8; 16] {
    match ip {
        IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
        IpAddr::V6(v6) => v6.octets(),
    }
}

/// Mask offset of the IPv4-mapped space; a v4 /24 is a mapped /120.
const V4_MASK_BASE: u32 = 96;

impl Ban {
    /// Creates a ban covering a single address.
    pub fn single(ip: IpAddr, name: &str, reason: &str, duration: u32) -> Self {
        Ban {
            address: mapped_bytes(ip),
            mask: 128,
            name: name.to_owned(),
            reason: reason.to_owned(),
            start: unix_now(),
            duration,
            ..Default::default()
        }
    }

    /// Mask as carried on the wire for IPv4-era clients (0..=32 for
    /// mapped v4 addresses).
    pub fn v4_wire_mask(&self) -> u32 {
        self.mask.saturating_sub(V4_MASK_BASE)
    }

    pub fn is_expired(&self, now: i64) -> bool {
        self.duration != 0 && now >= self.start + i64::from(self.duration)
    }

    /// True if `ip` falls under the banned prefix.
    pub fn matches_address(&self, ip: IpAddr) -> bool {
        let bytes = mapped_bytes(ip);
        let bits = self.mask.min(128) as usize;
        let full = bits / 8;
        if self.address[..full] != bytes[..full] {
            return false;
        }
        let rem = bits % 8;
        if rem == 0 {
            return true;
        }
        let mask = 0xffu8 << (8 - rem);
        self.address[full] & mask == bytes[full] & mask
    }

    /// True if the ban currently applies to a connection attempt.
    pub fn applies(&self, ip: IpAddr, cert_hash: &str, now: i64) -> bool {
        if self.is_expired(now) {
            return false;
        }
        if !self.cert_hash.is_empty() && self.cert_hash == cert_hash {
            return true;
        }
        self.matches_address(ip)
    }

    /// The address as an [IpAddr], un-mapping IPv4.
    pub fn ip(&self) -> IpAddr {
        let v6 = Ipv6Addr::from(self.address);
        match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn v4(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn single_address_ban_matches_only_that_address() {
        let ban = Ban::single(v4("192.0.2.7"), "mallory", "testing", 0);
        assert!(ban.matches_address(v4("192.0.2.7")));
        assert!(!ban.matches_address(v4("192.0.2.8")));
        assert_eq!(ban.ip(), v4("192.0.2.7"));
    }

    #[test]
    fn prefix_ban_covers_the_subnet() {
        let mut ban = Ban::single(v4("10.1.2.0"), "", "", 0);
        ban.mask = V4_MASK_BASE + 24;
        assert!(ban.matches_address(v4("10.1.2.250")));
        assert!(!ban.matches_address(v4("10.1.3.1")));
        assert_eq!(ban.v4_wire_mask(), 24);
    }

    #[test]
    fn odd_bit_masks_match_partially() {
        let mut ban = Ban::single(v4("10.0.0.0"), "", "", 0);
        ban.mask = V4_MASK_BASE + 9; // 10.0/9: second octet high bit clear
        assert!(ban.matches_address(v4("10.127.0.1")));
        assert!(!ban.matches_address(v4("10.128.0.1")));
    }

    #[test]
    fn zero_duration_means_permanent() {
        let ban = Ban::single(v4("198.51.100.1"), "", "", 0);
        assert!(!ban.is_expired(i64::MAX - 1));

        let mut limited = ban.clone();
        limited.duration = 60;
        assert!(!limited.is_expired(limited.start + 59));
        assert!(limited.is_expired(limited.start + 60));
    }

    #[test]
    fn cert_hash_bans_apply_regardless_of_address() {
        let mut ban = Ban::single(v4("203.0.113.1"), "", "", 0);
        ban.cert_hash = "deadbeef".to_owned();
        assert!(ban.applies(v4("203.0.113.9"), "deadbeef", unix_now()));
        assert!(!ban.applies(v4("203.0.113.9"), "cafe", unix_now()));
        assert!(ban.applies(v4("203.0.113.1"), "cafe", unix_now()));
    }

    #[test]
    fn ipv6_bans_work_too() {
        let ip: IpAddr = "2001:db8::1".parse().unwrap();
        let mut ban = Ban::single(ip, "", "", 0);
        ban.mask = 32;
        assert!(ban.matches_address("2001:db8::42".parse().unwrap()));
        assert!(!ban.matches_address("2001:db9::1".parse().unwrap()));
        assert_eq!(Ban::single(ip, "", "", 0).ip(), ip);
    }
}
