//! Short, shareable session identifiers.
//!
//! A UID is 4 bytes from the thread-local CSPRNG rendered as 8 uppercase hex
//! characters. Uniqueness is probabilistic only: a collision overwrites the
//! older session in the store rather than being rejected.

use rand::Rng;

/// Length of a rendered UID in characters.
pub const UID_LEN: usize = 8;

/// Mint a fresh 8-character uppercase hex UID.
pub fn generate_uid() -> String {
    let bytes: [u8; UID_LEN / 2] = rand::rng().random();
    bytes.iter().map(|b| format!("{b:02X}")).collect()
}

/// Whether `s` has the shape of a UID this server would mint.
pub fn looks_like_uid(s: &str) -> bool {
    s.len() == UID_LEN
        && s
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'A'..=b'F').contains(&b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn uid_is_eight_uppercase_hex_chars() {
        for _ in 0..100 {
            let uid = generate_uid();
            assert_eq!(uid.len(), UID_LEN);
            assert!(looks_like_uid(&uid), "bad uid: {uid}");
        }
    }

    #[test]
    fn uids_are_not_trivially_repeated() {
        let uids: HashSet<String> = (0..256).map(|_| generate_uid()).collect();
        // 256 draws from 2^32 - a handful of collisions would already be suspicious
        assert!(uids.len() > 250);
    }

    #[test]
    fn looks_like_uid_rejects_lowercase_and_wrong_length() {
        assert!(looks_like_uid("A1B2C3D4"));
        assert!(!looks_like_uid("a1b2c3d4"));
        assert!(!looks_like_uid("A1B2C3"));
        assert!(!looks_like_uid("A1B2C3D4E5"));
        assert!(!looks_like_uid("G1B2C3D4"));
    }
}
