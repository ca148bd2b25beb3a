//! The synchronization/rollback controller.
//!
//! Owns one [`InputQueue`] per player plus the periodic save-state timeline and
//! guarantees that after each tick the simulation reflects the best currently
//! available information for every frame: predictions are handed out while
//! remote input is missing, and the moment a confirmed input contradicts a
//! prediction the simulation is rewound to the offending frame and replayed
//! with corrected history — synchronously, through the host's
//! [`SessionHandler`] callbacks, before the tick returns.

use std::collections::BTreeMap;

use tracing::debug;

use crate::frame_info::{PlayerInput, SavedChecksum};
use crate::input_queue::InputQueue;
use crate::network::messages::ConnectionStatus;
use crate::{
    Config, Frame, HeliographError, InputStatus, InputVec, SessionHandler, CHECKSUM_INTERVAL,
};

/// Circular store of host snapshots, one slot per frame of the rollback
/// window plus the current frame.
#[derive(Debug, Clone)]
struct SavedStates<S> {
    slots: Vec<Option<(Frame, S)>>,
}

impl<S: Clone> SavedStates<S> {
    fn new(rollback_window: usize) -> Self {
        let mut slots = Vec::with_capacity(rollback_window + 1);
        slots.resize_with(rollback_window + 1, || None);
        Self { slots }
    }

    fn save(&mut self, frame: Frame, state: S) {
        let index = frame.as_i32() as usize % self.slots.len();
        self.slots[index] = Some((frame, state));
    }

    fn get(&self, frame: Frame) -> Option<&S> {
        let index = frame.as_i32() as usize % self.slots.len();
        match &self.slots[index] {
            Some((saved_frame, state)) if *saved_frame == frame => Some(state),
            _ => None,
        }
    }
}

/// Owns the per-player input queues and the save-state timeline, and drives
/// predict → detect-misprediction → rewind → replay.
pub struct RollbackController<T>
where
    T: Config,
{
    num_players: usize,
    /// Maximum frames the simulation may run ahead of confirmed input; also
    /// how far back a rewind can reach.
    frame_rollback: usize,
    /// The current simulation frame.
    current_frame: Frame,
    /// The last frame for which every connected player's input is confirmed.
    last_confirmed_frame: Frame,
    /// True while a rewind/replay is in progress.
    in_rollback: bool,

    input_queues: Vec<InputQueue<T>>,
    saved_states: SavedStates<T::State>,

    /// Host checksums recorded at interval frames, awaiting broadcast.
    checksum_history: BTreeMap<Frame, String>,
    /// The newest checkpoint frame already handed out for broadcast.
    last_advertised_checksum: Frame,
}

impl<T: Config> RollbackController<T> {
    /// Creates a controller for `num_players` players with the given rollback
    /// window.
    #[must_use]
    pub fn new(num_players: usize, frame_rollback: usize) -> Self {
        let input_queues = (0..num_players).map(|_| InputQueue::new()).collect();
        Self {
            num_players,
            frame_rollback,
            current_frame: Frame::new(0),
            last_confirmed_frame: Frame::NULL,
            in_rollback: false,
            input_queues,
            saved_states: SavedStates::new(frame_rollback),
            checksum_history: BTreeMap::new(),
            last_advertised_checksum: Frame::NULL,
        }
    }

    /// The current simulation frame.
    #[must_use]
    pub fn current_frame(&self) -> Frame {
        self.current_frame
    }

    /// The last frame for which all connected players' inputs are confirmed.
    #[must_use]
    pub fn last_confirmed_frame(&self) -> Frame {
        self.last_confirmed_frame
    }

    /// True while a rewind/replay is in progress.
    #[must_use]
    pub fn in_rollback(&self) -> bool {
        self.in_rollback
    }

    /// Sets the input delay for one player's queue.
    ///
    /// # Errors
    /// [`HeliographError::InvalidRequest`] if the delay exceeds the queue
    /// capacity.
    pub fn set_frame_delay(
        &mut self,
        queue_index: usize,
        delay: usize,
    ) -> Result<(), HeliographError> {
        self.input_queues[queue_index].set_frame_delay(delay)
    }

    /// The input delay of one player's queue.
    #[must_use]
    pub fn frame_delay(&self, queue_index: usize) -> usize {
        self.input_queues[queue_index].frame_delay()
    }

    /// Sets the global rollback window. Re-allocates the snapshot timeline, so
    /// this is only meant to be applied while no snapshots are live (i.e. when
    /// the parameter election completes, before the session runs).
    pub fn set_frame_rollback(&mut self, rollback: usize) {
        self.frame_rollback = rollback;
        self.saved_states = SavedStates::new(rollback);
    }

    /// The global rollback window.
    #[must_use]
    pub fn frame_rollback(&self) -> usize {
        self.frame_rollback
    }

    /// Adds a local player's input for the current frame.
    ///
    /// # Errors
    /// [`HeliographError::InRollback`] while a rollback is in progress: the
    /// history that input would belong to is being rewritten.
    pub fn add_local_input(
        &mut self,
        queue_index: usize,
        input: PlayerInput<T::Input>,
    ) -> Result<Frame, HeliographError> {
        if self.in_rollback {
            return Err(HeliographError::InRollback);
        }
        debug_assert!(input.frame == self.current_frame);
        Ok(self.input_queues[queue_index].add_input(input))
    }

    /// Adds a remote player's confirmed input. Always accepted; if it
    /// disagrees with an existing prediction this is what arms the rewind.
    pub fn add_remote_input(&mut self, queue_index: usize, input: PlayerInput<T::Input>) {
        self.input_queues[queue_index].add_input(input);
    }

    /// Returns, for the current simulation frame, one input per player —
    /// confirmed if present, else predicted — without advancing anything.
    /// Players disconnected before the current frame yield the default input.
    pub fn synchronized_inputs(
        &mut self,
        connect_status: &[ConnectionStatus],
    ) -> InputVec<T::Input> {
        let mut inputs = InputVec::with_capacity(self.num_players);
        for (i, status) in connect_status.iter().enumerate() {
            if status.disconnected && status.last_frame < self.current_frame {
                inputs.push((T::Input::default(), InputStatus::Disconnected));
            } else {
                inputs.push(self.input_queues[i].input(self.current_frame));
            }
        }
        inputs
    }

    /// Snapshots the current frame via the host, recording a checksum when the
    /// frame is a checkpoint (multiple of [`CHECKSUM_INTERVAL`]).
    pub fn save_current_state(&mut self, handler: &mut impl SessionHandler<T>) {
        let state = handler.save_state();
        if self.current_frame % CHECKSUM_INTERVAL == 0 {
            let checksum = handler.checksum(&state);
            self.checksum_history.insert(self.current_frame, checksum);
        }
        self.saved_states.save(self.current_frame, state);
    }

    /// Advances the frame counter after the host has simulated the current
    /// frame, and snapshots the new frame for future rollback.
    pub fn increment_frame(&mut self, handler: &mut impl SessionHandler<T>) {
        self.current_frame += 1;
        self.save_current_state(handler);
    }

    /// The earliest frame any queue has flagged as mispredicted, or
    /// [`Frame::NULL`] if every prediction so far held up.
    #[must_use]
    pub fn first_incorrect_frame(&self) -> Frame {
        let mut first_incorrect = Frame::NULL;
        for queue in &self.input_queues {
            let incorrect = queue.first_incorrect_frame();
            if !incorrect.is_null() && (first_incorrect.is_null() || incorrect < first_incorrect) {
                first_incorrect = incorrect;
            }
        }
        first_incorrect
    }

    /// Checks all queues for a detected misprediction and, if one exists,
    /// rewinds to the earliest incorrect frame and replays forward with
    /// corrected history. Synchronous: all host callbacks complete before this
    /// returns.
    pub fn check_simulation(
        &mut self,
        handler: &mut impl SessionHandler<T>,
        connect_status: &[ConnectionStatus],
    ) {
        let first_incorrect = self.first_incorrect_frame();
        if first_incorrect.is_null() {
            return;
        }
        self.rewind_and_replay(handler, first_incorrect, connect_status);
    }

    /// Forced rollback to `target_frame`, triggered externally (e.g. a player
    /// disconnected as of an earlier frame than currently simulated).
    pub fn adjust_simulation(
        &mut self,
        handler: &mut impl SessionHandler<T>,
        target_frame: Frame,
        connect_status: &[ConnectionStatus],
    ) {
        self.rewind_and_replay(handler, target_frame, connect_status);
    }

    fn rewind_and_replay(
        &mut self,
        handler: &mut impl SessionHandler<T>,
        frame_to_load: Frame,
        connect_status: &[ConnectionStatus],
    ) {
        let resume_frame = self.current_frame;
        if frame_to_load >= resume_frame {
            // the misprediction is at the frame we haven't simulated yet;
            // clearing the prediction state is all that's needed
            for queue in &mut self.input_queues {
                queue.reset_prediction(frame_to_load);
            }
            return;
        }
        assert!(
            resume_frame - frame_to_load <= self.frame_rollback as i32,
            "rollback to frame {} exceeds the {}-frame window (current frame {})",
            frame_to_load,
            self.frame_rollback,
            resume_frame
        );

        debug!(
            from = resume_frame.as_i32(),
            to = frame_to_load.as_i32(),
            "rolling back"
        );

        self.in_rollback = true;

        // restore the snapshot captured at the frame to correct
        let state = self
            .saved_states
            .get(frame_to_load)
            .cloned()
            .unwrap_or_else(|| {
                panic!("no saved state for frame {} within the rollback window", frame_to_load)
            });
        handler.load_state(&state);
        self.current_frame = frame_to_load;

        // drop out of prediction mode before replaying; the queues serve
        // confirmed data for the frames we are about to revisit
        for queue in &mut self.input_queues {
            queue.reset_prediction(frame_to_load);
        }

        // replay forward to where we were, with corrected history
        while self.current_frame < resume_frame {
            let inputs = self.synchronized_inputs(connect_status);
            handler.advance_frame(&inputs);
            self.increment_frame(handler);
        }

        self.in_rollback = false;
    }

    /// Raises the last confirmed frame and discards queue history before it.
    /// Clamped so nothing the simulation still needs — the current frame, or a
    /// pending incorrect frame — is ever discarded.
    pub fn set_last_confirmed_frame(&mut self, mut frame: Frame) {
        let first_incorrect = self.first_incorrect_frame();
        if !first_incorrect.is_null() {
            frame = frame.min(first_incorrect);
        }
        frame = frame.min(self.current_frame);

        self.last_confirmed_frame = frame;
        if frame.as_i32() > 0 {
            for queue in &mut self.input_queues {
                queue.discard_confirmed_frames(frame - 1);
            }
        }
    }

    /// Returns the recorded checksums for all checkpoint frames between the
    /// last broadcast and `min_confirmed` (inclusive), and marks them
    /// advertised. Checkpoints are only handed out once their frame is
    /// confirmed by every connected peer — rewinds can no longer change them.
    pub fn checksums_to_broadcast(&mut self, min_confirmed: Frame) -> Vec<SavedChecksum> {
        let mut batch = Vec::new();
        for (&frame, checksum) in &self.checksum_history {
            if frame > min_confirmed {
                break;
            }
            if self.last_advertised_checksum.is_null() || frame > self.last_advertised_checksum {
                batch.push(SavedChecksum::new(frame, checksum.clone()));
            }
        }
        if let Some(last) = batch.last() {
            self.last_advertised_checksum = last.frame;
            let last_advertised = self.last_advertised_checksum;
            self.checksum_history
                .retain(|&frame, _| frame > last_advertised);
        }
        batch
    }

    #[cfg(test)]
    pub(crate) fn force_in_rollback(&mut self, value: bool) {
        self.in_rollback = value;
    }
}

// #########
// # TESTS #
// #########
