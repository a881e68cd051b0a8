//! Compact lexicographic unique-id generator.
//!
//! A 22-character id: a 12-character prefix drawn from a cryptographic
//! source, plus a 10-character base-36 sequence that advances by a
//! pseudo-random step so ids remain roughly sortable without being
//! trivially predictable. Thread-safe: one `Nuid` is normally shared per
//! connection via `Arc`.

use parking_lot::Mutex;
use rand::Rng;
use sha2::{Digest, Sha256};
use std::time::{SystemTime, UNIX_EPOCH};

const PREFIX_LEN: usize = 12;
const SEQ_LEN: usize = 10;
const BASE36_DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
const MIN_INC: u64 = 33;
const MAX_INC: u64 = 333;
// 36^10, the point at which the sequence must roll over and the prefix
// must be regenerated.
const MAX_SEQ: u64 = 3_656_158_440_062_976;

struct State {
    prefix: [u8; PREFIX_LEN],
    seq: u64,
    inc: u64,
}

pub struct Nuid {
    state: Mutex<State>,
}

impl Default for Nuid {
    fn default() -> Self {
        Self::new()
    }
}

impl Nuid {
    pub fn new() -> Self {
        let mut rng = rand::thread_rng();
        let prefix = random_prefix(&mut rng);
        let seq = rng.gen_range(0..MAX_SEQ);
        let inc = rng.gen_range(MIN_INC..=MAX_INC);
        Self {
            state: Mutex::new(State { prefix, seq, inc }),
        }
    }

    /// Generate the next identifier.
    pub fn next(&self) -> String {
        let mut rng = rand::thread_rng();
        let mut guard = self.state.lock();
        guard.seq += guard.inc;
        if guard.seq >= MAX_SEQ {
            guard.prefix = random_prefix(&mut rng);
            guard.seq = rng.gen_range(0..MAX_SEQ);
            guard.inc = rng.gen_range(MIN_INC..=MAX_INC);
        }
        let mut out = String::with_capacity(PREFIX_LEN + SEQ_LEN);
        out.push_str(std::str::from_utf8(&guard.prefix).expect("ascii prefix"));
        out.push_str(&encode_base36(guard.seq));
        out
    }
}

fn random_prefix(rng: &mut impl Rng) -> [u8; PREFIX_LEN] {
    // Mix a cryptographic hash of process-local entropy with the RNG so
    // the prefix doesn't depend solely on the (weaker) thread RNG seed.
    let mut hasher = Sha256::new();
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    hasher.update(nanos.to_le_bytes());
    let salt: [u8; 16] = rng.gen();
    hasher.update(salt);
    let digest = hasher.finalize();

    let mut out = [0u8; PREFIX_LEN];
    for (i, slot) in out.iter_mut().enumerate() {
        *slot = BASE36_DIGITS[(digest[i] as usize) % BASE36_DIGITS.len()];
    }
    out
}

fn encode_base36(mut value: u64) -> String {
    let mut buf = [b'0'; SEQ_LEN];
    for slot in buf.iter_mut().rev() {
        *slot = BASE36_DIGITS[(value % 36) as usize];
        value /= 36;
    }
    String::from_utf8(buf.to_vec()).expect("ascii digits")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn ids_are_22_chars_and_ascii() {
        let nuid = Nuid::new();
        let id = nuid.next();
        assert_eq!(id.len(), PREFIX_LEN + SEQ_LEN);
        assert!(id.is_ascii());
    }

    #[test]
    fn sequence_is_strictly_increasing_within_a_prefix() {
        let nuid = Nuid::new();
        let mut last_prefix = None;
        let mut last_seq = None;
        for _ in 0..50 {
            let id = nuid.next();
            let (prefix, seq_str) = id.split_at(PREFIX_LEN);
            let seq = u64::from_str_radix(seq_str, 36).unwrap_or_else(|_| decode_base36(seq_str));
            if last_prefix.as_deref() == Some(prefix) {
                assert!(seq > last_seq.unwrap(), "sequence must strictly increase");
            }
            last_prefix = Some(prefix.to_string());
            last_seq = Some(seq);
        }
    }

    #[test]
    fn ids_are_unique_across_many_calls() {
        let nuid = Nuid::new();
        let mut seen = HashSet::new();
        for _ in 0..1000 {
            assert!(seen.insert(nuid.next()));
        }
    }

    fn decode_base36(s: &str) -> u64 {
        let mut value = 0u64;
        for c in s.chars() {
            value = value * 36 + BASE36_DIGITS.iter().position(|&b| b == c as u8).unwrap() as u64;
        }
        value
    }
}
