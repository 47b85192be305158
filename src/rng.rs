use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// The randomness threaded through argument generation. Seeded explicitly
/// so a run can be reproduced.
pub type FuzzRng = ChaCha8Rng;

/// A fresh seed from the OS.
pub fn random_seed() -> u64 {
  rand::rngs::OsRng.next_u64()
}

/// Each worker gets its own stream derived from the run seed.
pub fn worker_rng(seed: u64, worker: usize) -> FuzzRng {
  let mut rng = FuzzRng::seed_from_u64(seed);
  rng.set_stream(worker as u64);
  rng
}
