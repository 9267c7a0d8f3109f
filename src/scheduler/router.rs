//! Affinity routing from session id to slot index.

use std::num::NonZeroUsize;

use sha2::{Digest, Sha256};

/// Deterministic session → slot mapping.
///
/// The slot is the first eight bytes of the SHA-256 digest of the session
/// id, read big-endian, modulo the pool size. No routing state exists:
/// every session with the same id lands on the same slot for the lifetime
/// of the pool.
#[derive(Debug, Clone, Copy)]
pub struct AffinityRouter {
    pool_size: NonZeroUsize,
}

impl AffinityRouter {
    /// Router over `pool_size` slots.
    #[must_use]
    pub fn new(pool_size: NonZeroUsize) -> Self {
        Self { pool_size }
    }

    /// Number of slots.
    #[must_use]
    pub fn pool_size(&self) -> usize {
        self.pool_size.get()
    }

    /// Slot index in `0..pool_size` owning `session_id`.
    #[must_use]
    pub fn route(&self, session_id: &str) -> usize {
        let digest = Sha256::digest(session_id.as_bytes());
        let mut lead = [0u8; 8];
        lead.copy_from_slice(&digest[..8]);
        let hash = u64::from_be_bytes(lead);

        let size = u64::try_from(self.pool_size.get()).unwrap_or(u64::MAX);
        usize::try_from(hash % size).unwrap_or(0)
    }
}
