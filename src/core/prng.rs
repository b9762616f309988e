// Seeded PRNG for trial order and weight initialization.
//
// Not cryptographically secure. A run must replay exactly from its seed, so
// the stream depends on nothing but the seed.

#[derive(Debug, Clone)]
pub struct Prng {
    state: u64,
}

/// splitmix64 finalizer; spreads small consecutive seeds (run 0, 1, 2...)
/// across the state space.
fn mix(seed: u64) -> u64 {
    let mut z = seed.wrapping_add(0x9E3779B97F4A7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
    z ^ (z >> 31)
}

impl Prng {
    pub fn new(seed: u64) -> Self {
        // xorshift must never hold zero.
        let state = match mix(seed) {
            0 => 0x9E3779B97F4A7C15,
            s => s,
        };
        Self { state }
    }

    pub fn reseed(&mut self, seed: u64) {
        *self = Self::new(seed);
    }

    #[inline]
    fn next_u64(&mut self) -> u64 {
        // xorshift64*
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545F4914F6CDD1D)
    }

    /// Uniform in `[low, high)`.
    #[inline]
    pub fn gen_range_f32(&mut self, low: f32, high: f32) -> f32 {
        let unit = (self.next_u64() >> 40) as f32 / (1u64 << 24) as f32;
        low + (high - low) * unit
    }

    /// Uniform in `[0, n)`; `n` must be positive.
    #[inline]
    fn below(&mut self, n: usize) -> usize {
        (self.next_u64() % n as u64) as usize
    }

    /// A random permutation of `0..n` (Fisher-Yates).
    pub fn permutation(&mut self, n: usize) -> Vec<usize> {
        let mut order: Vec<usize> = (0..n).collect();
        for i in (1..n).rev() {
            let j = self.below(i + 1);
            order.swap(i, j);
        }
        order
    }
}
