//! BLAKE3 key derivation.
//!
//! Context strings follow the BLAKE3 `derive_key` convention: globally unique,
//! hardcoded, and never reused across purposes.

/// BLAKE3 hash output (32 bytes).
pub type HashOutput = [u8; 32];

/// Compute BLAKE3 hash of input data.
#[must_use]
pub fn hash(data: &[u8]) -> HashOutput {
    *blake3::hash(data).as_bytes()
}

/// BLAKE3 key derivation function bound to a context string.
pub struct Kdf {
    context: &'static str,
}

impl Kdf {
    /// Create a KDF with a specific context string.
    #[must_use]
    pub const fn new(context: &'static str) -> Self {
        Self { context }
    }

    /// Derive `output.len()` bytes from the concatenation of `parts`.
    pub fn derive(&self, parts: &[&[u8]], output: &mut [u8]) {
        let mut hasher = blake3::Hasher::new_derive_key(self.context);
        for part in parts {
            // Length-prefix each part so boundaries cannot be shifted.
            hasher.update(&(part.len() as u64).to_le_bytes());
            hasher.update(part);
        }
        hasher.finalize_xof().fill(output);
    }

    /// Derive a 32-byte key.
    #[must_use]
    pub fn derive_key(&self, parts: &[&[u8]]) -> [u8; 32] {
        let mut output = [0u8; 32];
        self.derive(parts, &mut output);
        output
    }
}
