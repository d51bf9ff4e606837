//! Short code minting
//!
//! Links are numbered by a dense database sequence and the number is turned
//! into a code with a reversible, salted encoding. Consecutive ids produce
//! unrelated-looking codes and no collision retry is ever needed.
//!
//! Encoding scheme: the salt shuffles a 62 character alphabet. The last two
//! characters become padding markers, the remaining 60 are digits. The first
//! character of a code (the "lottery") is picked from the number itself and
//! reshuffles the digit alphabet for the rest of the code. Codes shorter than
//! the minimum length get a padding marker followed by filler.

use redb::Database;

use crate::database::{self, atomic};
use crate::error::{ShortCodeError, StoreError};

const ALPHABET: &str = "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ1234567890";
const PAD_CHARS: usize = 2;

/// Counter backing short code generation.
pub const URL_SEQUENCE: &str = "url_sequence";

/// Reversible integer <-> short code mapping.
#[derive(Debug, Clone)]
pub struct ShortCodeCodec {
    digits: Vec<char>,
    pads: Vec<char>,
    salt: Vec<char>,
    min_length: usize,
}

impl ShortCodeCodec {
    pub fn new(salt: &str, min_length: usize) -> Self {
        let salt: Vec<char> = salt.chars().collect();
        let mut digits: Vec<char> = ALPHABET.chars().collect();
        shuffle(&mut digits, &salt);
        let pads = digits.split_off(digits.len() - PAD_CHARS);

        Self {
            digits,
            pads,
            salt,
            min_length,
        }
    }

    /// Encodes a non-negative integer.
    ///
    /// Any integer type is accepted; negative or out-of-range values are
    /// rejected with [`ShortCodeError::InvalidNumber`].
    pub fn encode<N>(&self, number: N) -> Result<String, ShortCodeError>
    where
        N: TryInto<u64>,
    {
        let number = number
            .try_into()
            .map_err(|_| ShortCodeError::InvalidNumber)?;
        Ok(self.encode_u64(number))
    }

    /// Inverse of [`encode`](Self::encode); `None` for anything it did not produce.
    pub fn decode(&self, code: &str) -> Option<u64> {
        let mut chars = code.chars();
        let lottery = chars.next()?;
        if !self.digits.contains(&lottery) {
            return None;
        }

        let alphabet = self.keyed_alphabet(lottery);
        let base = alphabet.len() as u64;
        let mut value: u64 = 0;
        let mut seen_digit = false;
        for c in chars {
            if self.pads.contains(&c) {
                break;
            }
            let digit = alphabet.iter().position(|&a| a == c)? as u64;
            value = value.checked_mul(base)?.checked_add(digit)?;
            seen_digit = true;
        }

        // Only the canonical spelling decodes
        (seen_digit && self.encode_u64(value) == code).then_some(value)
    }

    fn encode_u64(&self, number: u64) -> String {
        let base = self.digits.len() as u64;
        let lottery = self.digits[(number % base) as usize];
        let alphabet = self.keyed_alphabet(lottery);

        let mut body = Vec::new();
        let mut rest = number;
        loop {
            body.push(alphabet[(rest % base) as usize]);
            rest /= base;
            if rest == 0 {
                break;
            }
        }
        body.reverse();

        let mut code = String::with_capacity(self.min_length.max(body.len() + 1));
        code.push(lottery);
        code.extend(body);

        if code.len() < self.min_length {
            code.push(self.pads[(number % PAD_CHARS as u64) as usize]);
            let mut index = (number % base) as usize;
            while code.len() < self.min_length {
                code.push(alphabet[index % alphabet.len()]);
                index += 7;
            }
        }

        code
    }

    fn keyed_alphabet(&self, lottery: char) -> Vec<char> {
        let mut key = Vec::with_capacity(self.salt.len() + 1);
        key.push(lottery);
        key.extend_from_slice(&self.salt);

        let mut alphabet = self.digits.clone();
        shuffle(&mut alphabet, &key);
        alphabet
    }
}

/// Deterministic, key-driven permutation.
fn shuffle(alphabet: &mut [char], key: &[char]) {
    if key.is_empty() {
        return;
    }

    let mut v = 0usize;
    let mut p = 0usize;
    for i in (1..alphabet.len()).rev() {
        v %= key.len();
        let k = key[v] as usize;
        p += k;
        let j = (k + v + p) % i;
        alphabet.swap(i, j);
        v += 1;
    }
}

/// Draws the next url id in its own transaction.
///
/// Concurrent callers serialize on the single redb writer, so values are
/// strictly increasing and gap-free.
pub fn next_url_id(db: &Database) -> Result<u64, StoreError> {
    atomic(db, |txn| database::next_value(txn, URL_SEQUENCE))
}
