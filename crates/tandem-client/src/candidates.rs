//! Buffering of early ICE candidates.
//!
//! A peer may trickle ICE candidates before this side has applied the remote
//! session description. Those candidates cannot be added to the peer
//! connection yet, so they are held here and released in arrival order once
//! the description is set.

/// Holds ICE candidates until the remote description is known.
#[derive(Debug, Clone)]
pub struct CandidateQueue<C> {
    pending: Vec<C>,
    remote_set: bool,
}

impl<C> Default for CandidateQueue<C> {
    fn default() -> Self {
        Self {
            pending: Vec::new(),
            remote_set: false,
        }
    }
}

impl<C> CandidateQueue<C> {
    /// Create an empty queue for a call that has no remote description yet.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Offer a received candidate.
    ///
    /// Returns the candidate back if it can be applied right away, or
    /// `None` if it was queued.
    pub fn push(&mut self, candidate: C) -> Option<C> {
        if self.remote_set {
            Some(candidate)
        } else {
            self.pending.push(candidate);
            None
        }
    }

    /// Mark the remote description as applied and release queued candidates.
    pub fn remote_description_set(&mut self) -> Vec<C> {
        self.remote_set = true;
        std::mem::take(&mut self.pending)
    }

    /// Forget queued candidates and wait for a new remote description.
    pub fn reset(&mut self) {
        self.pending.clear();
        self.remote_set = false;
    }

    /// Check if the remote description has been applied.
    #[must_use]
    pub fn is_remote_set(&self) -> bool {
        self.remote_set
    }

    /// Number of queued candidates.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}
