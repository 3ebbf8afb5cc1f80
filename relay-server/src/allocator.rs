//! Random subdomain allocation.

use rand::Rng;
use thiserror::Error;

/// Lowercase alphanumerics only; subdomains are DNS labels.
const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Default retry cap. With length 12 a collision is ~1 in 3.6e9 per draw,
/// so exhaustion means the registry is effectively full.
const DEFAULT_MAX_ATTEMPTS: usize = 100;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AllocError {
    #[error("subdomain length must be positive")]
    ZeroLength,
    #[error("no free subdomain after {0} attempts")]
    Exhausted(usize),
}

/// Draws candidate subdomains from a CSPRNG and retries on collision.
#[derive(Debug, Clone)]
pub struct SubdomainAllocator {
    length: usize,
    max_attempts: usize,
}

impl SubdomainAllocator {
    pub fn new(length: usize) -> Self {
        Self {
            length,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    #[cfg(test)]
    fn with_max_attempts(length: usize, max_attempts: usize) -> Self {
        Self {
            length,
            max_attempts,
        }
    }

    /// Allocate a subdomain not currently occupied according to `occupied`.
    /// The caller still races the registry's atomic insert and must retry the
    /// whole pair if it loses.
    pub fn allocate(&self, occupied: impl Fn(&str) -> bool) -> Result<String, AllocError> {
        if self.length == 0 {
            return Err(AllocError::ZeroLength);
        }
        for _ in 0..self.max_attempts {
            let candidate = self.candidate();
            if !occupied(&candidate) {
                return Ok(candidate);
            }
        }
        Err(AllocError::Exhausted(self.max_attempts))
    }

    fn candidate(&self) -> String {
        let mut rng = rand::thread_rng();
        (0..self.length)
            .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
            .collect()
    }
}
