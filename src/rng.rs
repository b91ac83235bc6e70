use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

const GOLDEN_GAMMA: u64 = 0x9E3779B97F4A7C15;

/// Mix a master seed with a stream index (SplitMix64 finalizer), so every
/// worker gets a well-separated ChaCha stream from one user-facing seed.
pub fn derive_stream_seed(master_seed: u64, stream: u64) -> u64 {
    let mut z = master_seed ^ stream.wrapping_mul(GOLDEN_GAMMA);
    z = z.wrapping_add(GOLDEN_GAMMA);
    let mut mixed = z;
    mixed = (mixed ^ (mixed >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
    mixed = (mixed ^ (mixed >> 27)).wrapping_mul(0x94D049BB133111EB);
    mixed ^ (mixed >> 31)
}

/// The private random stream of one worker.
///
/// Streams are keyed to the worker's static chunk index, never to the OS
/// thread, so a run replays bit-identically under the same seed, worker
/// count, and node partition. Changing the worker count reassigns streams
/// and changes the sample path.
pub struct WorkerRng {
    inner: ChaCha8Rng,
}

impl WorkerRng {
    pub fn for_worker(master_seed: u64, worker: usize) -> Self {
        Self {
            inner: ChaCha8Rng::seed_from_u64(derive_stream_seed(master_seed, worker as u64)),
        }
    }

    /// Uniform draw in `[0, 1)`.
    pub fn uniform(&mut self) -> f64 {
        self.inner.r#gen::<f64>()
    }

    /// Exponential waiting time with the given rate. `rate` must be
    /// positive; a zero-sum node never reaches this call.
    pub fn exponential(&mut self, rate: f64) -> f64 {
        -(1.0 - self.uniform()).ln() / rate
    }

    /// Draw `k` individuals without replacement from bins holding
    /// `counts[i]` each: every draw is uniform over the remaining multiset,
    /// and the chosen bin is decremented before the next draw. Returns how
    /// many came out of each bin.
    ///
    /// The caller guarantees `k <= sum(counts)`.
    pub fn sample_without_replacement(&mut self, counts: &[i32], k: i32) -> Vec<i32> {
        let mut remaining: i64 = counts.iter().map(|&c| c as i64).sum();
        debug_assert!(k as i64 <= remaining);
        let mut left = counts.to_vec();
        let mut taken = vec![0i32; counts.len()];
        for _ in 0..k {
            let mut target = ((self.uniform() * remaining as f64) as i64).min(remaining - 1);
            for (bin, count) in left.iter_mut().enumerate() {
                if target < *count as i64 {
                    *count -= 1;
                    taken[bin] += 1;
                    remaining -= 1;
                    break;
                }
                target -= *count as i64;
            }
        }
        taken
    }
}
