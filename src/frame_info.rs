use serde::{Deserialize, Serialize};

use crate::Frame;

/// Represents an input for a single player in a single frame. The associated
/// frame is denoted with `frame`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PlayerInput<I>
where
    I: Copy + Clone + PartialEq,
{
    /// The frame to which this info belongs to. [`Frame::NULL`] represents an invalid frame.
    pub frame: Frame,
    /// The input struct given by the user.
    pub input: I,
}

impl<I: Copy + Clone + PartialEq + Default> PlayerInput<I> {
    /// Creates a new `PlayerInput` with the given frame and input.
    pub fn new(frame: Frame, input: I) -> Self {
        Self { frame, input }
    }

    /// Creates a blank input with the default value for the input type.
    #[must_use]
    pub fn blank_input(frame: Frame) -> Self {
        Self {
            frame,
            input: I::default(),
        }
    }

    pub(crate) fn equal(&self, other: &Self, input_only: bool) -> bool {
        (input_only || self.frame == other.frame) && self.input == other.input
    }
}

/// Session parameters negotiated between all peers during the handshake.
///
/// Every participant announces its own `SyncData`; once every endpoint has
/// completed the data-sync phase, all peers deterministically elect a single
/// winner — highest `rank` wins, ties are broken by comparing peer identifiers
/// — and apply the winner's `delay` and `rollback` locally. Because every
/// participant runs the identical comparison over the identical candidates, all
/// peers converge without a coordinator.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncData {
    /// Tie-break priority for the parameter election; highest wins.
    pub rank: i32,
    /// Local input delay in frames.
    pub delay: usize,
    /// Maximum rollback window in frames.
    pub rollback: usize,
}

impl Default for SyncData {
    fn default() -> Self {
        Self {
            rank: 0,
            delay: 2,
            rollback: 8,
        }
    }
}

/// A checksum of the simulation state at a checkpoint frame, exchanged between
/// peers for desync detection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedChecksum {
    /// The checkpointed frame.
    pub frame: Frame,
    /// The host-computed checksum of the state at that frame.
    pub checksum: String,
}

impl SavedChecksum {
    /// Creates a new `SavedChecksum`.
    #[must_use]
    pub fn new(frame: Frame, checksum: String) -> Self {
        Self { frame, checksum }
    }
}

// #########
// # TESTS #
// #########
