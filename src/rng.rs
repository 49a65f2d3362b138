//! Source of randomness for the address manager.

/// Random number source used for bucketing, selection and consistency
/// checking.
///
/// Two instances created with the same seed produce identical sequences,
/// which is what makes deterministic replay of a whole table possible.
#[derive(Debug, Clone)]
pub struct Rng {
    inner: fastrand::Rng,
}

impl Rng {
    /// Create a generator seeded from system entropy.
    pub fn new() -> Self {
        Self {
            inner: fastrand::Rng::new(),
        }
    }

    /// Create a generator with a fixed seed.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            inner: fastrand::Rng::with_seed(seed),
        }
    }

    /// A uniformly random boolean.
    pub fn rand_bool(&self) -> bool {
        self.inner.bool()
    }

    /// A uniformly random integer in `[0, n)`. `n` must be non-zero.
    pub fn randrange(&self, n: u64) -> u64 {
        debug_assert!(n > 0, "Rng::randrange: empty range");
        self.inner.u64(..n)
    }

    /// A uniformly random integer with the given number of bits, `bits <= 64`.
    pub fn randbits(&self, bits: u32) -> u64 {
        debug_assert!(bits >= 1 && bits <= 64);
        self.inner.u64(..) >> (64 - bits)
    }

    /// 256 uniformly random bits, little-endian.
    pub fn rand_u256(&self) -> [u8; 32] {
        let mut out = [0; 32];
        for chunk in out.chunks_mut(8) {
            chunk.copy_from_slice(&self.inner.u64(..).to_le_bytes());
        }
        out
    }
}

impl Default for Rng {
    fn default() -> Self {
        Self::new()
    }
}
