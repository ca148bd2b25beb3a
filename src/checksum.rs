use std::collections::BTreeMap;

use tracing::warn;

use crate::frame_info::SavedChecksum;
use crate::Frame;

/// A small pending-checksum ledger for cross-peer desync detection.
///
/// Both the locally computed checkpoints and the ones a peer reports are fed
/// through [`add`](Self::add). The first pair seen for a frame is held pending;
/// when the other side's pair for the same frame arrives, the two are compared.
/// A match settles the frame (everything at or before it is pruned), a mismatch
/// means the two simulations have silently diverged — the caller treats that as
/// a fatal desync and force-disconnects the peer.
#[derive(Debug, Clone)]
pub struct ChecksumVerifier {
    pending: BTreeMap<Frame, String>,
    last_verified: Frame,
}

impl Default for ChecksumVerifier {
    fn default() -> Self {
        Self::new()
    }
}

impl ChecksumVerifier {
    /// Creates an empty verifier.
    #[must_use]
    pub fn new() -> Self {
        Self {
            pending: BTreeMap::new(),
            last_verified: Frame::NULL,
        }
    }

    /// The highest frame at which both sides' checksums matched, or
    /// [`Frame::NULL`] if nothing has been verified yet.
    #[must_use]
    pub fn last_verified_frame(&self) -> Frame {
        self.last_verified
    }

    /// Folds a batch of checkpoints into the ledger. Returns `false` if any
    /// pair disagrees with an already-held checksum for the same frame.
    ///
    /// Pairs at or before the last verified frame are already settled and are
    /// trivially accepted. After the batch, all entries at or before the last
    /// verified frame are pruned.
    #[must_use]
    pub fn add(&mut self, checksums: &[SavedChecksum]) -> bool {
        let mut all_match = true;
        for entry in checksums {
            if !self.last_verified.is_null() && entry.frame <= self.last_verified {
                continue;
            }
            match self.pending.get(&entry.frame) {
                Some(held) => {
                    if *held == entry.checksum {
                        self.last_verified = self.last_verified.max(entry.frame);
                    } else {
                        warn!(
                            frame = entry.frame.as_i32(),
                            held = held.as_str(),
                            received = entry.checksum.as_str(),
                            "checksum mismatch: simulations have diverged"
                        );
                        all_match = false;
                    }
                }
                None => {
                    self.pending.insert(entry.frame, entry.checksum.clone());
                }
            }
        }
        let last_verified = self.last_verified;
        if !last_verified.is_null() {
            self.pending.retain(|frame, _| *frame > last_verified);
        }
        all_match
    }
}

// #########
// # TESTS #
// #########
