//! Time-ordered push keys.
//!
//! A push key is 20 characters from a 64-character alphabet whose ASCII order
//! matches digit value. The first 8 characters encode a 48-bit millisecond
//! timestamp, the remaining 12 encode a 72-bit counter. The counter is
//! randomized whenever the timestamp advances and incremented with carry
//! otherwise, so keys from one generator sort in generation order.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Key alphabet in ascending ASCII order.
pub const PUSH_CHARS: &[u8; 64] =
    b"-0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ_abcdefghijklmnopqrstuvwxyz";

/// Length of a generated key.
pub const PUSH_ID_LEN: usize = TIME_CHARS + RANDOM_CHARS;

const TIME_CHARS: usize = 8;
const RANDOM_CHARS: usize = 12;
const MAX_DIGIT: u8 = 63;

/// Generates push keys.
///
/// The generator never reads a clock itself; callers pass the (server
/// adjusted) time for each key.
#[derive(Debug, Clone)]
pub struct PushIdGenerator<R = StdRng> {
    rng: R,
    last_millis: Option<u64>,
    counter: [u8; RANDOM_CHARS],
}

impl PushIdGenerator<StdRng> {
    /// Creates a generator seeded from the OS.
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }
}

impl Default for PushIdGenerator<StdRng> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: Rng> PushIdGenerator<R> {
    /// Creates a generator with a caller-supplied random source.
    pub fn with_rng(rng: R) -> Self {
        Self {
            rng,
            last_millis: None,
            counter: [0; RANDOM_CHARS],
        }
    }

    /// Generates the next key for time `now_millis`.
    ///
    /// A clock that goes backwards is treated as the previous millisecond,
    /// so ordering holds even across clock adjustments.
    pub fn generate(&mut self, now_millis: u64) -> String {
        match self.last_millis {
            Some(last) if now_millis <= last => {
                if !self.increment() {
                    self.last_millis = Some(last + 1);
                    self.randomize();
                }
            }
            _ => {
                self.last_millis = Some(now_millis);
                self.randomize();
            }
        }

        let millis = self.last_millis.unwrap_or(now_millis);
        let mut key = String::with_capacity(PUSH_ID_LEN);
        for i in (0..TIME_CHARS).rev() {
            let digit = (millis >> (6 * i)) & 0x3f;
            key.push(PUSH_CHARS[digit as usize] as char);
        }
        for &digit in &self.counter {
            key.push(PUSH_CHARS[digit as usize] as char);
        }
        key
    }

    fn randomize(&mut self) {
        for digit in &mut self.counter {
            *digit = self.rng.gen_range(0..=MAX_DIGIT);
        }
    }

    /// Adds one to the counter. Returns false if it wrapped around.
    fn increment(&mut self) -> bool {
        for digit in self.counter.iter_mut().rev() {
            if *digit < MAX_DIGIT {
                *digit += 1;
                return true;
            }
            *digit = 0;
        }
        false
    }
}

/// Decodes the timestamp prefix of a push key.
///
/// Returns `None` if the key is too short or uses characters outside the
/// alphabet.
pub fn push_id_millis(key: &str) -> Option<u64> {
    let bytes = key.as_bytes();
    if bytes.len() < TIME_CHARS {
        return None;
    }
    bytes[..TIME_CHARS].iter().try_fold(0u64, |acc, &b| {
        let digit = PUSH_CHARS.iter().position(|&c| c == b)?;
        Some((acc << 6) | digit as u64)
    })
}
