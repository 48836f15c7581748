//! Non-compressible payload generation
//!
//! Outbound traffic is cut from one shared buffer filled by a fast
//! xorshift generator. The buffer is reused across sends and regenerated
//! only occasionally; its content merely has to defeat transport-level
//! compression, not be unpredictable.

use bytes::Bytes;
use parking_lot::Mutex;

/// Two-word xorshift generator.
///
/// Each step applies `s1 ^= s1 << 23; s1 ^= s1 >> 17; s1 ^= s0;
/// s1 ^= s0 >> 26` to the swapped state and yields the wrapping sum of both
/// words.
#[derive(Debug, Clone)]
pub struct XorShiftPair {
    s0: u32,
    s1: u32,
}

impl XorShiftPair {
    /// Creates a generator from a 64-bit seed.
    ///
    /// An all-zero state would only ever produce zeros, so it is replaced
    /// by a fixed non-zero word.
    pub fn new(seed: u64) -> Self {
        let mut s0 = (seed >> 32) as u32;
        let mut s1 = seed as u32;
        if s0 == 0 && s1 == 0 {
            s0 = 0x9E37_79B9;
            s1 = 0x7F4A_7C15;
        }
        Self { s0, s1 }
    }

    /// Advances the state and returns the next word.
    pub fn next_u32(&mut self) -> u32 {
        let mut s1 = self.s0;
        let s0 = self.s1;
        self.s0 = s0;
        s1 ^= s1 << 23;
        s1 ^= s1 >> 17;
        s1 ^= s0;
        s1 ^= s0 >> 26;
        self.s1 = s1;
        self.s0.wrapping_add(self.s1)
    }

    /// Returns a value uniformly spread over `[0, 1]`.
    pub fn next_unit(&mut self) -> f64 {
        self.next_u32() as f64 / u32::MAX as f64
    }

    /// Fills `buf` with generated bytes, four per word, little-endian.
    pub fn fill(&mut self, buf: &mut [u8]) {
        let mut chunks = buf.chunks_exact_mut(4);
        for chunk in &mut chunks {
            chunk.copy_from_slice(&self.next_u32().to_le_bytes());
        }
        let tail = chunks.into_remainder();
        if !tail.is_empty() {
            let word = self.next_u32().to_le_bytes();
            tail.copy_from_slice(&word[..tail.len()]);
        }
    }
}

struct PayloadState {
    rng: XorShiftPair,
    buffer: Bytes,
}

/// Shared source of outbound payload chunks.
///
/// Stream tasks call [`next_chunk`](Self::next_chunk) concurrently. A
/// refresh swaps in a freshly generated buffer; chunks handed out earlier
/// keep pointing at the previous one, so in-flight sends always read
/// complete, if stale, bytes.
///
/// # Examples
///
/// ```
/// use pathprobe::payload::PayloadGenerator;
///
/// let payload = PayloadGenerator::with_seed(64 * 1024, 0.1, 42);
/// let chunk = payload.next_chunk(1500);
/// assert_eq!(chunk.len(), 1500);
/// ```
pub struct PayloadGenerator {
    state: Mutex<PayloadState>,
    size: usize,
    refresh_probability: f64,
}

impl PayloadGenerator {
    /// Creates a generator seeded from the thread RNG.
    pub fn new(size: usize, refresh_probability: f64) -> Self {
        Self::with_seed(size, refresh_probability, rand::random())
    }

    /// Creates a generator with a fixed seed, producing reproducible buffers.
    pub fn with_seed(size: usize, refresh_probability: f64, seed: u64) -> Self {
        let mut rng = XorShiftPair::new(seed);
        let buffer = generate(&mut rng, size);
        Self {
            state: Mutex::new(PayloadState { rng, buffer }),
            size,
            refresh_probability,
        }
    }

    /// Size of the shared buffer in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Returns the current buffer without any chance of refreshing it.
    pub fn current(&self) -> Bytes {
        self.state.lock().buffer.clone()
    }

    /// Returns a chunk of at most `len` bytes for the next send.
    ///
    /// With probability `refresh_probability` the shared buffer is
    /// regenerated first.
    pub fn next_chunk(&self, len: usize) -> Bytes {
        let mut state = self.state.lock();
        if self.refresh_probability > 0.0 && state.rng.next_unit() < self.refresh_probability {
            let fresh = generate(&mut state.rng, self.size);
            state.buffer = fresh;
        }
        state.buffer.slice(..len.min(self.size))
    }
}

fn generate(rng: &mut XorShiftPair, size: usize) -> Bytes {
    let mut buf = vec![0u8; size];
    rng.fill(&mut buf);
    Bytes::from(buf)
}
