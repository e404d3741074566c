//! Session id generation: a SHA-1 digest over process/time entropy, encoded
//! with a configurable bits-per-character alphabet.
//!
//! Grounded on `original_source/src/uid.c` (`smisk_uid_create`,
//! `smisk_uid_format`) and the `binconvtab`/`smisk_encode_bin` helpers in
//! `original_source/src/utils.c`.

use crate::config::SessionIdWidth;
use sha1::{Digest, Sha1};
use std::time::{SystemTime, UNIX_EPOCH};

const BINCONVTAB: &[u8; 64] =
    b"0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ_-";

/// 20-byte SHA-1 digest seeded from wall-clock time, pid, and a random salt.
/// Not cryptographically meaningful — only meant to be hard to predict
/// across processes, matching the original's intent.
pub struct Uid {
    digest: [u8; 20],
}

impl Uid {
    /// Generate a fresh id, optionally mixing in extra bytes (e.g. a node
    /// identifier) the way `smisk_uid_create`'s `node`/`node_length`
    /// arguments did.
    pub fn generate(node: Option<&[u8]>) -> Uid {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let pid = std::process::id();
        let salt: u32 = rand::random();

        let mut hasher = Sha1::new();
        hasher.update((now.as_secs() as u32).to_be_bytes());
        hasher.update((now.subsec_micros()).to_be_bytes());
        hasher.update(pid.to_be_bytes());
        hasher.update(salt.to_be_bytes());
        if let Some(node) = node {
            hasher.update(node);
        }

        let digest: [u8; 20] = hasher.finalize().into();
        Uid { digest }
    }

    /// Encode the digest with `width` bits per output character, matching
    /// `smisk_encode_bin`'s LSB-first bit-packing.
    pub fn format(&self, width: SessionIdWidth) -> String {
        encode_bin(&self.digest, width.bits())
    }
}

fn encode_bin(data: &[u8], nbits: u32) -> String {
    assert!(nbits < 7);
    let mask: u16 = (1u16 << nbits) - 1;
    let mut w: u16 = 0;
    let mut have: u32 = 0;
    let mut out = String::new();
    let mut iter = data.iter();

    loop {
        if have < nbits {
            if let Some(&byte) = iter.next() {
                w |= (byte as u16) << have;
                have += 8;
            } else {
                if have == 0 {
                    break;
                }
                have = nbits;
            }
        }
        out.push(BINCONVTAB[(w & mask) as usize] as char);
        w >>= nbits;
        have -= nbits;
    }

    out
}

/// Validate that `s` is a well-formed id for the given width: the exact
/// expected length, drawn only from the alphabet's first `2^bits`
/// characters.
pub fn is_valid(s: &str, width: SessionIdWidth) -> bool {
    if s.len() != width.char_count() {
        return false;
    }
    let alphabet_len = 1usize << width.bits();
    let alphabet = &BINCONVTAB[..alphabet_len];
    s.bytes().all(|b| alphabet.contains(&b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_lengths_match_spec() {
        let uid = Uid::generate(None);
        assert_eq!(uid.format(SessionIdWidth::Bits4).len(), 40);
        assert_eq!(uid.format(SessionIdWidth::Bits5).len(), 32);
        assert_eq!(uid.format(SessionIdWidth::Bits6).len(), 27);
    }

    #[test]
    fn generated_ids_are_unique() {
        let a = Uid::generate(None).format(SessionIdWidth::Bits6);
        let b = Uid::generate(None).format(SessionIdWidth::Bits6);
        assert_ne!(a, b);
    }

    #[test]
    fn is_valid_checks_length_and_alphabet() {
        let uid = Uid::generate(None);
        let s = uid.format(SessionIdWidth::Bits6);
        assert!(is_valid(&s, SessionIdWidth::Bits6));
        assert!(!is_valid(&s, SessionIdWidth::Bits5));
        assert!(!is_valid("not-an-id", SessionIdWidth::Bits6));
    }

    #[test]
    fn bits4_alphabet_is_hex() {
        let uid = Uid::generate(None);
        let s = uid.format(SessionIdWidth::Bits4);
        assert!(s.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase()));
    }
}
