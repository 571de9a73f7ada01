//! Prediction and procedure id generation.
//!
//! Ids are derived from a UUIDv7 (time-ordered, so ids sort roughly by
//! creation order for log correlation) whose bytes are shuffled before
//! encoding so a casual reader can't reconstruct the embedded timestamp by
//! eye, then encoded with a Crockford-style base32 alphabet that avoids
//! visually ambiguous characters (no `i`, `l`, `o`, `u`).

use uuid::Uuid;

const ALPHABET: &[u8] = b"0123456789abcdefghjkmnpqrstvwxyz";

/// Byte permutation applied before encoding. Interleaves the timestamp-heavy
/// leading bytes of a UUIDv7 with its random trailing bytes so the encoded
/// id doesn't visibly sort by wall-clock time at a glance.
const SHUFFLE: [usize; 16] = [7, 0, 9, 2, 11, 4, 13, 6, 15, 8, 1, 10, 3, 12, 5, 14];

/// Generates a new id: a fresh UUIDv7, shuffled and base32-encoded.
pub fn generate() -> String {
    let uuid = Uuid::now_v7();
    encode(uuid.as_bytes())
}

fn shuffle(bytes: &[u8; 16]) -> [u8; 16] {
    let mut out = [0u8; 16];
    for (i, &src) in SHUFFLE.iter().enumerate() {
        out[i] = bytes[src];
    }
    out
}

/// Encodes 16 raw bytes as a Crockford-style base32 string with no padding
/// and no leading zero digit.
///
/// The 128 bits are treated as a single big-endian unsigned integer and
/// encoded 5 bits at a time, most significant group first, then leading
/// `'0'` characters are stripped (as with decimal integer formatting). At
/// least one character is always emitted.
fn encode(bytes: &[u8; 16]) -> String {
    let shuffled = shuffle(bytes);

    // 128 bits packed into 5-bit groups needs 26 groups (130 bits of room).
    let mut bits: u128 = 0;
    for b in shuffled {
        bits = (bits << 8) | b as u128;
    }
    // left-align into 130 bits by shifting up by the 2 padding bits.
    let mut out = [0u8; 26];
    let mut shifted = bits << 2;
    for slot in out.iter_mut().rev() {
        *slot = ALPHABET[(shifted & 0x1f) as usize];
        shifted >>= 5;
    }

    let s = String::from_utf8(out.to_vec()).expect("alphabet is ASCII");
    let trimmed = s.trim_start_matches('0');
    if trimmed.is_empty() {
        "0".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Generates a runner id for procedure-mode slots: 8 base32 characters,
/// never leading with `'0'`. The single-model runner uses the fixed id
/// `"default"` instead of calling this.
pub fn generate_runner_id() -> String {
    loop {
        let bytes = *Uuid::new_v4().as_bytes();
        let five = [bytes[0], bytes[1], bytes[2], bytes[3], bytes[4]];
        let s = encode_fixed5(&five);
        if !s.starts_with('0') {
            return s;
        }
    }
}

/// Encodes exactly 5 bytes (40 bits) as 8 base32 characters, no padding.
fn encode_fixed5(bytes: &[u8; 5]) -> String {
    let mut bits: u64 = 0;
    for b in bytes {
        bits = (bits << 8) | *b as u64;
    }
    let mut out = [0u8; 8];
    for (i, slot) in out.iter_mut().enumerate().rev() {
        *slot = ALPHABET[(bits & 0x1f) as usize];
        bits >>= 5;
        let _ = i;
    }
    String::from_utf8(out.to_vec()).expect("alphabet is ASCII")
}

/// Returns true if `s` looks like an id this module would generate: only
/// alphabet characters, 1-26 of them, and not starting with `'0'`.
pub fn is_well_formed(s: &str) -> bool {
    if s.is_empty() || s.len() > 26 {
        return false;
    }
    if s.starts_with('0') {
        return false;
    }
    s.bytes().all(|b| ALPHABET.contains(&b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_well_formed() {
        for _ in 0..1000 {
            let id = generate();
            assert!(is_well_formed(&id), "malformed id: {id}");
        }
    }

    #[test]
    fn generated_ids_are_unique() {
        let mut seen = std::collections::HashSet::new();
        for _ in 0..1000 {
            assert!(seen.insert(generate()));
        }
    }

    #[test]
    fn encode_never_starts_with_zero() {
        let zero = encode(&[0u8; 16]);
        assert_eq!(zero, "0");
        assert!(!zero.starts_with("00"));
    }

    #[test]
    fn encode_all_ones_is_26_chars() {
        let all_ones = encode(&[0xff; 16]);
        assert_eq!(all_ones.len(), 26);
        assert!(is_well_formed(&all_ones));
    }

    #[test]
    fn runner_ids_are_eight_chars_no_leading_zero() {
        for _ in 0..500 {
            let id = generate_runner_id();
            assert_eq!(id.len(), 8);
            assert!(!id.starts_with('0'));
        }
    }

    #[test]
    fn shuffle_is_a_bijection() {
        let mut seen = [false; 16];
        for &idx in SHUFFLE.iter() {
            assert!(!seen[idx], "index {idx} used twice");
            seen[idx] = true;
        }
    }
}
