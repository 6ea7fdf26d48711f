//! Independent pseudo-random streams for daemons.
//!
//! Combined multiple-recursive generator (L'Ecuyer MRG32k3a) with
//! jump-ahead: a process-wide cursor advances 2^127 states per daemon,
//! so every daemon receives a seed vector for a provably disjoint
//! stream regardless of how many pools are running in parallel. The
//! jump is computed as the 2^127-th power of the two 3x3 transition
//! matrices, taken by repeated squaring mod m1/m2.

use std::fmt;
use std::str::FromStr;
use std::sync::{Mutex, OnceLock};

use serde::{Deserialize, Serialize};
use thiserror::Error;

const M1: u64 = 4_294_967_087; // 2^32 - 209
const M2: u64 = 4_294_944_443; // 2^32 - 22853
const A12: u64 = 1_403_580;
const A13N: u64 = 810_728; // applied negated
const A21: u64 = 527_612;
const A23N: u64 = 1_370_589; // applied negated

type Mat = [[u64; 3]; 3];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SeedError {
    #[error("expected 6 comma-separated integers, got {0}")]
    WrongArity(usize),
    #[error("seed component {0:?} is not an integer")]
    NotAnInteger(String),
    #[error("seed component {0} out of range for its modulus")]
    OutOfRange(u64),
    #[error("seed triple must not be all zero")]
    DegenerateTriple,
}

/// The 6-word state handed to one daemon: three words mod m1, three mod
/// m2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamSeed(pub [u64; 6]);

impl StreamSeed {
    pub fn validate(&self) -> Result<(), SeedError> {
        let s = &self.0;
        for &word in &s[..3] {
            if word >= M1 {
                return Err(SeedError::OutOfRange(word));
            }
        }
        for &word in &s[3..] {
            if word >= M2 {
                return Err(SeedError::OutOfRange(word));
            }
        }
        if s[..3].iter().all(|&w| w == 0) || s[3..].iter().all(|&w| w == 0) {
            return Err(SeedError::DegenerateTriple);
        }
        Ok(())
    }

    /// Fold the state into 32 seed bytes for a general-purpose RNG.
    pub fn to_rng_seed(&self) -> [u8; 32] {
        let mut out = [0u8; 32];
        let mut acc = 0x9e37_79b9_7f4a_7c15u64;
        for (i, chunk) in out.chunks_exact_mut(8).enumerate() {
            acc = acc
                .wrapping_add(self.0[i % 6])
                .wrapping_mul(0xbf58_476d_1ce4_e5b9);
            acc ^= acc >> 27;
            chunk.copy_from_slice(&acc.to_le_bytes());
        }
        out
    }
}

impl fmt::Display for StreamSeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = &self.0;
        write!(f, "{},{},{},{},{},{}", s[0], s[1], s[2], s[3], s[4], s[5])
    }
}

impl FromStr for StreamSeed {
    type Err = SeedError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = input.split(',').collect();
        if parts.len() != 6 {
            return Err(SeedError::WrongArity(parts.len()));
        }
        let mut words = [0u64; 6];
        for (slot, part) in words.iter_mut().zip(&parts) {
            *slot = part
                .trim()
                .parse()
                .map_err(|_| SeedError::NotAnInteger(part.to_string()))?;
        }
        let seed = StreamSeed(words);
        seed.validate()?;
        Ok(seed)
    }
}

fn mat_mul(a: &Mat, b: &Mat, m: u64) -> Mat {
    let m = m as u128;
    let mut out = [[0u64; 3]; 3];
    for i in 0..3 {
        for j in 0..3 {
            let mut acc: u128 = 0;
            for k in 0..3 {
                acc = (acc + (a[i][k] as u128) * (b[k][j] as u128)) % m;
            }
            out[i][j] = acc as u64;
        }
    }
    out
}

fn mat_vec(a: &Mat, v: &[u64; 3], m: u64) -> [u64; 3] {
    let m = m as u128;
    let mut out = [0u64; 3];
    for i in 0..3 {
        let mut acc: u128 = 0;
        for k in 0..3 {
            acc = (acc + (a[i][k] as u128) * (v[k] as u128)) % m;
        }
        out[i] = acc as u64;
    }
    out
}

fn transition_matrices() -> (Mat, Mat) {
    let a1 = [[0, 1, 0], [0, 0, 1], [M1 - A13N, A12, 0]];
    let a2 = [[0, 1, 0], [0, 0, 1], [M2 - A23N, 0, A21]];
    (a1, a2)
}

/// A1^(2^127) mod m1 and A2^(2^127) mod m2.
fn jump_matrices() -> &'static (Mat, Mat) {
    static JUMP: OnceLock<(Mat, Mat)> = OnceLock::new();
    JUMP.get_or_init(|| {
        let (mut j1, mut j2) = transition_matrices();
        for _ in 0..127 {
            j1 = mat_mul(&j1, &j1, M1);
            j2 = mat_mul(&j2, &j2, M2);
        }
        (j1, j2)
    })
}

/// The stream cursor: hands out one [`StreamSeed`] per daemon and jumps
/// ahead 2^127 states.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamCursor {
    s1: [u64; 3],
    s2: [u64; 3],
}

impl StreamCursor {
    pub fn from_entropy() -> Self {
        loop {
            let s1 = [
                rand::random::<u64>() % M1,
                rand::random::<u64>() % M1,
                rand::random::<u64>() % M1,
            ];
            let s2 = [
                rand::random::<u64>() % M2,
                rand::random::<u64>() % M2,
                rand::random::<u64>() % M2,
            ];
            let cursor = StreamCursor { s1, s2 };
            if cursor.seed().validate().is_ok() {
                return cursor;
            }
        }
    }

    /// Deterministic cursor from one word (splitmix expansion).
    pub fn from_seed(seed: u64) -> Self {
        let mut x = seed;
        let mut next = || {
            x = x.wrapping_add(0x9e37_79b9_7f4a_7c15);
            let mut z = x;
            z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
            z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
            z ^ (z >> 31)
        };
        loop {
            let s1 = [next() % M1, next() % M1, next() % M1];
            let s2 = [next() % M2, next() % M2, next() % M2];
            let cursor = StreamCursor { s1, s2 };
            if cursor.seed().validate().is_ok() {
                return cursor;
            }
        }
    }

    fn seed(&self) -> StreamSeed {
        StreamSeed([
            self.s1[0], self.s1[1], self.s1[2], self.s2[0], self.s2[1], self.s2[2],
        ])
    }

    /// The current stream's seed; the cursor then jumps to the next
    /// disjoint stream.
    pub fn next_stream(&mut self) -> StreamSeed {
        let seed = self.seed();
        let (j1, j2) = jump_matrices();
        self.s1 = mat_vec(j1, &self.s1, M1);
        self.s2 = mat_vec(j2, &self.s2, M2);
        seed
    }
}

/// The generator itself, for daemons that want draws straight from
/// their assigned stream.
#[derive(Debug, Clone)]
pub struct CmrgRng {
    s1: [u64; 3],
    s2: [u64; 3],
}

impl CmrgRng {
    pub fn from_stream(seed: StreamSeed) -> Result<Self, SeedError> {
        seed.validate()?;
        let s = seed.0;
        Ok(CmrgRng {
            s1: [s[0], s[1], s[2]],
            s2: [s[3], s[4], s[5]],
        })
    }

    /// One combined draw in `[0, m1)`.
    fn step(&mut self) -> u64 {
        let p1 = ((A12 as u128 * self.s1[1] as u128
            + (M1 - A13N) as u128 * self.s1[0] as u128)
            % M1 as u128) as u64;
        self.s1 = [self.s1[1], self.s1[2], p1];

        let p2 = ((A21 as u128 * self.s2[2] as u128
            + (M2 - A23N) as u128 * self.s2[0] as u128)
            % M2 as u128) as u64;
        self.s2 = [self.s2[1], self.s2[2], p2];

        (p1 + M1 - p2) % M1
    }

    pub fn next_u64(&mut self) -> u64 {
        (self.step() << 32) ^ self.step()
    }

    /// Uniform draw in `[0, 1)`.
    pub fn next_f64(&mut self) -> f64 {
        self.step() as f64 / M1 as f64
    }
}

// One cursor per process so parallel pools never collide on seeds.
static CURSOR: Mutex<Option<StreamCursor>> = Mutex::new(None);

/// Seed for the next launched daemon, advancing the process-wide
/// cursor.
pub fn next_daemon_seed() -> StreamSeed {
    let mut guard = CURSOR.lock().expect("rng cursor lock poisoned");
    guard
        .get_or_insert_with(StreamCursor::from_entropy)
        .next_stream()
}

/// Pin the process-wide cursor to a deterministic state.
pub fn seed_process_cursor(seed: u64) {
    let mut guard = CURSOR.lock().expect("rng cursor lock poisoned");
    *guard = Some(StreamCursor::from_seed(seed));
}

/// Drop the cursor; the next configure re-seeds from entropy. Called
/// when the last pool is reset.
pub fn teardown_process_cursor() {
    let mut guard = CURSOR.lock().expect("rng cursor lock poisoned");
    *guard = None;
}
