//! Helpers shared by unit tests.

use rand_core::{CryptoRng, RngCore};

/// A randomness source that always fails
pub(crate) struct BrokenRng;

impl RngCore for BrokenRng {
    fn next_u32(&mut self) -> u32 {
        0
    }

    fn next_u64(&mut self) -> u64 {
        0
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        dest.fill(0);
    }

    fn try_fill_bytes(&mut self, _dest: &mut [u8]) -> Result<(), rand_core::Error> {
        Err(rand_core::Error::new(std::io::Error::new(
            std::io::ErrorKind::Other,
            "entropy source unavailable",
        )))
    }
}

impl CryptoRng for BrokenRng {}
