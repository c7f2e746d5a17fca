//! Random one-time trip codes.

use rand::Rng;
use ride_dispatch_core::environment::CodeGenerator;
use ride_dispatch_core::ride::TripCode;

/// Draws uniformly from `000000..=999999` using the thread-local RNG.
#[derive(Clone, Copy, Debug, Default)]
pub struct RandomCodeGenerator;

impl RandomCodeGenerator {
    /// Create a generator
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl CodeGenerator for RandomCodeGenerator {
    fn next_code(&self) -> TripCode {
        let mut rng = rand::thread_rng();
        loop {
            if let Some(code) = TripCode::from_number(rng.gen_range(0..1_000_000)) {
                return code;
            }
        }
    }
}
