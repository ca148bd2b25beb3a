use tracing::debug;

use crate::frame_info::PlayerInput;
use crate::{Config, Frame, HeliographError, InputStatus};
use std::cmp;

/// The length of the input queue. This describes the number of inputs the
/// engine can hold at the same time per player. At 60fps, 128 frames is about
/// 2.1 seconds of input history; rollback windows and frame delay are assumed
/// to never approach this.
pub const INPUT_QUEUE_LENGTH: usize = 128;

/// The maximum allowed frame delay. Must be less than [`INPUT_QUEUE_LENGTH`] so
/// the circular buffer cannot overflow while the delay gap is being filled.
pub const MAX_FRAME_DELAY: usize = INPUT_QUEUE_LENGTH - 1;

/// `InputQueue` handles inputs for a single player and saves them in a circular
/// array. Valid inputs are between `head` and `tail`.
///
/// It covers four concerns:
/// - input storage, delayed by a configurable frame delay
/// - prediction ("repeat the most recently stored input") when the actual
///   input has not arrived
/// - detection of the first frame whose confirmed input contradicts the
///   prediction that was handed out for it
/// - a discard policy that never drops a frame the simulation still needs
///
/// # Panics
///
/// Frame-ordering violations by the producer, requesting a frame older than
/// the retained window, and overflowing the 128-frame ring are programmer
/// errors and panic.
#[derive(Debug, Clone)]
pub struct InputQueue<T>
where
    T: Config,
{
    /// The head of the queue. The newest input is saved here.
    head: usize,
    /// The tail of the queue. The oldest input still valid is saved here.
    tail: usize,
    /// The current length of the queue.
    length: usize,
    /// Denotes if we still are in the first frame, an edge case to be considered
    /// by some methods.
    first_frame: bool,

    /// The last (delay-adjusted) frame stored in the queue.
    last_added_frame: Frame,
    /// The last frame number handed in by the producer, before delay. Producer
    /// frames must arrive in strict +1 order.
    last_producer_frame: Frame,
    /// The first frame in the queue that is known to be an incorrect prediction.
    first_incorrect_frame: Frame,
    /// The last frame that has been requested. We make sure to never delete
    /// anything at or after this, as we would throw away data the simulation
    /// has already consumed.
    last_requested_frame: Frame,

    /// The delay in frames by which this player's inputs are held back.
    frame_delay: usize,

    /// Our cyclic input queue.
    inputs: Vec<PlayerInput<T::Input>>,
    /// The active prediction, if any (`prediction.frame` is NULL otherwise).
    prediction: PlayerInput<T::Input>,
    /// The most recently stored input, used as the prediction basis.
    last_stored_input: Option<T::Input>,
}

impl<T: Config> InputQueue<T> {
    /// Creates a new input queue.
    #[must_use]
    pub fn new() -> Self {
        Self {
            head: 0,
            tail: 0,
            length: 0,
            first_frame: true,
            last_added_frame: Frame::NULL,
            last_producer_frame: Frame::NULL,
            first_incorrect_frame: Frame::NULL,
            last_requested_frame: Frame::NULL,
            frame_delay: 0,
            inputs: vec![PlayerInput::blank_input(Frame::NULL); INPUT_QUEUE_LENGTH],
            prediction: PlayerInput::blank_input(Frame::NULL),
            last_stored_input: None,
        }
    }

    /// Returns the first frame in the queue that is known to be an incorrect
    /// prediction, or [`Frame::NULL`] if none is pending.
    #[must_use]
    pub fn first_incorrect_frame(&self) -> Frame {
        self.first_incorrect_frame
    }

    /// Returns the configured frame delay.
    #[must_use]
    pub fn frame_delay(&self) -> usize {
        self.frame_delay
    }

    /// Sets the frame delay for this input queue. Takes effect on the next
    /// [`add_input`](Self::add_input) call.
    ///
    /// # Errors
    /// Returns [`HeliographError::InvalidRequest`] if `delay` exceeds
    /// [`MAX_FRAME_DELAY`].
    pub fn set_frame_delay(&mut self, delay: usize) -> Result<(), HeliographError> {
        if delay > MAX_FRAME_DELAY {
            return Err(HeliographError::InvalidRequest {
                info: format!(
                    "Frame delay {} exceeds maximum allowed value of {}.",
                    delay, MAX_FRAME_DELAY
                ),
            });
        }
        self.frame_delay = delay;
        Ok(())
    }

    /// Clears the prediction state after a rollback has corrected history up to
    /// (and including) `frame`.
    ///
    /// # Panics
    /// Panics if `frame` is after an already-recorded misprediction frame —
    /// resetting there would hide the error instead of correcting it.
    pub fn reset_prediction(&mut self, frame: Frame) {
        assert!(
            self.first_incorrect_frame.is_null() || frame <= self.first_incorrect_frame,
            "cannot reset prediction at frame {} past recorded misprediction at frame {}",
            frame,
            self.first_incorrect_frame
        );
        self.prediction.frame = Frame::NULL;
        self.first_incorrect_frame = Frame::NULL;
        self.last_requested_frame = Frame::NULL;
    }

    /// Discards confirmed frames up to the given `frame` from the queue. All
    /// confirmed frames are guaranteed to be synchronized between players, so
    /// the inputs don't need to be kept around anymore.
    ///
    /// The discard target is clamped to the highest frame ever requested, so
    /// data the simulation has not consumed yet is never thrown away.
    pub fn discard_confirmed_frames(&mut self, mut frame: Frame) {
        if !self.last_requested_frame.is_null() {
            frame = cmp::min(frame, self.last_requested_frame);
        }

        // move the tail to "delete" inputs, wrapping around if necessary
        if frame >= self.last_added_frame {
            // delete all but the most recent input; tail points at (head - 1)
            self.tail = if self.head == 0 {
                INPUT_QUEUE_LENGTH - 1
            } else {
                self.head - 1
            };
            self.length = 1;
        } else if self.length == 0 || frame <= self.inputs[self.tail].frame {
            // target is at or before the current tail, nothing to delete
        } else {
            let offset = (frame - self.inputs[self.tail].frame) as usize;
            self.tail = (self.tail + offset) % INPUT_QUEUE_LENGTH;
            self.length -= offset;
        }
    }

    /// Returns the input of this player for the given frame together with its
    /// status. If the frame is confirmed, the stored input is returned;
    /// otherwise a prediction is started (or continued): repeat the most
    /// recently stored input, advanced one frame per call.
    ///
    /// # Panics
    /// Panics if a misprediction is pending (the caller must roll back first)
    /// or if `requested_frame` is older than the retained window.
    pub fn input(&mut self, requested_frame: Frame) -> (T::Input, InputStatus) {
        // no one should ever try to grab any input when we have a prediction
        // error; doing so means we're just going further down the wrong path
        assert!(
            self.first_incorrect_frame.is_null(),
            "requested input for frame {} while misprediction at frame {} is unresolved",
            requested_frame,
            self.first_incorrect_frame
        );

        // remember the last requested frame number for later; the discard
        // policy must never delete at or beyond it
        self.last_requested_frame = requested_frame;

        assert!(
            requested_frame >= self.inputs[self.tail].frame,
            "requested frame {} is older than the oldest retained frame {}",
            requested_frame,
            self.inputs[self.tail].frame
        );

        if self.prediction.frame.is_null() {
            // if the requested frame is in our range, fetch it out of the queue
            let mut offset = (requested_frame - self.inputs[self.tail].frame) as usize;
            if offset < self.length {
                offset = (offset + self.tail) % INPUT_QUEUE_LENGTH;
                debug_assert!(self.inputs[offset].frame == requested_frame);
                return (self.inputs[offset].input, InputStatus::Confirmed);
            }

            // the requested frame isn't in the queue; start predicting by
            // repeating the most recently stored input
            self.prediction = PlayerInput {
                frame: requested_frame,
                input: self.last_stored_input.unwrap_or_default(),
            };
        }

        (self.prediction.input, InputStatus::Predicted)
    }

    /// Adds an input for the next producer frame to the queue, re-targeted by
    /// the configured frame delay. Returns the frame the input was actually
    /// stored at, or [`Frame::NULL`] if the input was dropped because a shrunk
    /// frame delay put its target behind what is already stored.
    ///
    /// # Panics
    /// Panics if the producer violates the strict +1 frame order, or if the
    /// queue overflows its 128-frame capacity.
    pub fn add_input(&mut self, input: PlayerInput<T::Input>) -> Frame {
        assert!(
            self.last_producer_frame.is_null() || input.frame == self.last_producer_frame + 1,
            "non-sequential input: got frame {}, expected frame {}",
            input.frame,
            self.last_producer_frame + 1
        );
        self.last_producer_frame = input.frame;

        let new_frame = self.advance_queue_head(input.frame);
        if new_frame.is_null() {
            debug!(
                producer_frame = input.frame.as_i32(),
                frame_delay = self.frame_delay,
                "dropping input: target frame is behind the stored sequence"
            );
            return Frame::NULL;
        }
        self.add_input_by_frame(input, new_frame);
        new_frame
    }

    /// Adds an input to the queue at the given (delay-adjusted) frame number.
    /// If a prediction is active, checks it against the confirmed input and
    /// records the first disagreement.
    fn add_input_by_frame(&mut self, input: PlayerInput<T::Input>, frame_number: Frame) {
        assert!(
            self.last_added_frame.is_null() || frame_number == self.last_added_frame + 1,
            "stored frames must be contiguous: got {}, last added {}",
            frame_number,
            self.last_added_frame
        );

        // add the frame to the back of the queue
        self.inputs[self.head] = input;
        self.inputs[self.head].frame = frame_number;
        self.head = (self.head + 1) % INPUT_QUEUE_LENGTH;
        self.length += 1;
        assert!(
            self.length <= INPUT_QUEUE_LENGTH,
            "input queue overflow: rollback window or frame delay exceeded {} frames",
            INPUT_QUEUE_LENGTH
        );

        self.first_frame = false;
        self.last_added_frame = frame_number;
        self.last_stored_input = Some(input.input);

        // we have been predicting; see if the inputs we've gotten match what
        // we've been predicting
        if !self.prediction.frame.is_null() {
            debug_assert!(frame_number == self.prediction.frame);

            // remember the first input which was incorrect so the controller
            // knows how far back to rewind
            if self.first_incorrect_frame.is_null() && !self.prediction.equal(&input, true) {
                self.first_incorrect_frame = frame_number;
            }

            // if this input is the same frame as the last one requested and we
            // still haven't found any mispredictions, we can exit prediction
            // mode; otherwise the prediction advances one frame
            if self.prediction.frame == self.last_requested_frame
                && self.first_incorrect_frame.is_null()
            {
                self.prediction.frame = Frame::NULL;
            } else {
                self.prediction.frame += 1;
            }
        }
    }

    /// Moves the queue head to the delay-adjusted target frame, replicating the
    /// previous input forward if the delay grew since the last call. Returns
    /// [`Frame::NULL`] if the delay shrank so far that the target is behind the
    /// stored sequence.
    fn advance_queue_head(&mut self, input_frame: Frame) -> Frame {
        let previous_position = match self.head {
            0 => INPUT_QUEUE_LENGTH - 1,
            _ => self.head - 1,
        };

        let mut expected_frame = if self.first_frame {
            Frame::new(0)
        } else {
            self.inputs[previous_position].frame + 1
        };

        let target_frame = input_frame + self.frame_delay as i32;

        if expected_frame > target_frame {
            // the frame delay shrank since the last call; the re-targeted frame
            // is behind what is already stored
            return Frame::NULL;
        }

        // the frame delay grew (or this is the initial delay gap); replicate
        // the previous frame's input forward so the stored sequence stays
        // contiguous
        let input_to_replicate = self.inputs[previous_position];
        while expected_frame < target_frame {
            self.add_input_by_frame(input_to_replicate, expected_frame);
            expected_frame += 1;
        }

        target_frame
    }
}

impl<T: Config> Default for InputQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

// #########
// # TESTS #
// #########

#[cfg(test)]
mod input_queue_tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Copy, Clone, PartialEq, Default, Serialize, Deserialize, Debug)]
    struct TestInput {
        inp: u8,
    }

    struct TestConfig;

    impl Config for TestConfig {
        type Input = TestInput;
        type State = Vec<u8>;
        type Address = String;
    }

    fn test_queue() -> InputQueue<TestConfig> {
        InputQueue::new()
    }

    #[test]
    #[should_panic(expected = "non-sequential input")]
    fn add_input_skipping_frames_panics() {
        let mut queue = test_queue();
        queue.add_input(PlayerInput::new(Frame::new(0), TestInput { inp: 0 }));
        queue.add_input(PlayerInput::new(Frame::new(3), TestInput { inp: 0 }));
    }

    #[test]
    #[should_panic(expected = "non-sequential input")]
    fn add_input_twice_for_same_frame_panics() {
        let mut queue = test_queue();
        let input = PlayerInput::new(Frame::new(0), TestInput { inp: 0 });
        queue.add_input(input);
        queue.add_input(input);
    }

    #[test]
    fn add_and_get_inputs_sequentially() {
        let mut queue = test_queue();
        for i in 0..10i32 {
            let input = PlayerInput::new(Frame::new(i), TestInput { inp: i as u8 });
            assert_eq!(queue.add_input(input), Frame::new(i));
            assert_eq!(queue.last_added_frame, Frame::new(i));
            let (stored, status) = queue.input(Frame::new(i));
            assert_eq!(status, InputStatus::Confirmed);
            assert_eq!(stored.inp, i as u8);
        }
    }

    #[test]
    fn delayed_inputs_are_retargeted() {
        let mut queue = test_queue();
        let delay: i32 = 2;
        queue.set_frame_delay(delay as usize).expect("valid delay");
        for i in 0..10i32 {
            let input = PlayerInput::new(Frame::new(i), TestInput { inp: i as u8 });
            assert_eq!(queue.add_input(input), Frame::new(i + delay));
            let (stored, _) = queue.input(Frame::new(i));
            let correct = std::cmp::max(0, i - delay) as u8;
            assert_eq!(stored.inp, correct);
        }
    }

    #[test]
    fn growing_delay_replicates_previous_input_forward() {
        let mut queue = test_queue();
        queue.add_input(PlayerInput::new(Frame::new(0), TestInput { inp: 7 }));
        // raise the delay mid-session: frame 1 now targets frame 3, and the gap
        // (frames 1 and 2) is filled with the previous input
        queue.set_frame_delay(2).expect("valid delay");
        let stored_at = queue.add_input(PlayerInput::new(Frame::new(1), TestInput { inp: 9 }));
        assert_eq!(stored_at, Frame::new(3));
        assert_eq!(
            queue.input(Frame::new(1)),
            (TestInput { inp: 7 }, InputStatus::Confirmed)
        );
        assert_eq!(
            queue.input(Frame::new(2)),
            (TestInput { inp: 7 }, InputStatus::Confirmed)
        );
        assert_eq!(
            queue.input(Frame::new(3)),
            (TestInput { inp: 9 }, InputStatus::Confirmed)
        );
    }

    #[test]
    fn shrinking_delay_drops_input_without_breaking_the_queue() {
        let mut queue = test_queue();
        queue.set_frame_delay(3).expect("valid delay");
        // frame 0 stored at 3 (frames 0-2 filled with blanks)
        assert_eq!(
            queue.add_input(PlayerInput::new(Frame::new(0), TestInput { inp: 1 })),
            Frame::new(3)
        );
        // shrink the delay: frame 1 targets frame 1, which is behind frame 3
        queue.set_frame_delay(0).expect("valid delay");
        assert_eq!(
            queue.add_input(PlayerInput::new(Frame::new(1), TestInput { inp: 2 })),
            Frame::NULL
        );
        // the stored sequence is still contiguous and intact
        assert_eq!(queue.last_added_frame, Frame::new(3));
        // a later producer frame targeting past the stored head is accepted again
        queue.set_frame_delay(2).expect("valid delay");
        assert_eq!(
            queue.add_input(PlayerInput::new(Frame::new(2), TestInput { inp: 3 })),
            Frame::new(4)
        );
    }

    #[test]
    fn prediction_repeats_most_recently_stored_input() {
        let mut queue = test_queue();
        for i in 0..3i32 {
            queue.add_input(PlayerInput::new(Frame::new(i), TestInput { inp: 42 }));
        }
        let (predicted, status) = queue.input(Frame::new(5));
        assert_eq!(status, InputStatus::Predicted);
        assert_eq!(predicted.inp, 42);
    }

    #[test]
    fn prediction_before_any_input_is_default() {
        let mut queue = test_queue();
        let (predicted, status) = queue.input(Frame::new(0));
        assert_eq!(status, InputStatus::Predicted);
        assert_eq!(predicted, TestInput::default());
    }

    #[test]
    fn correct_prediction_leaves_no_incorrect_frame() {
        let mut queue = test_queue();
        queue.add_input(PlayerInput::new(Frame::new(0), TestInput { inp: 42 }));
        let _ = queue.input(Frame::new(1));
        queue.add_input(PlayerInput::new(Frame::new(1), TestInput { inp: 42 }));
        assert_eq!(queue.first_incorrect_frame(), Frame::NULL);
    }

    #[test]
    fn misprediction_records_first_incorrect_frame() {
        let mut queue = test_queue();
        queue.add_input(PlayerInput::new(Frame::new(0), TestInput { inp: 10 }));
        let (predicted, _) = queue.input(Frame::new(1));
        assert_eq!(predicted.inp, 10);
        queue.add_input(PlayerInput::new(Frame::new(1), TestInput { inp: 99 }));
        assert_eq!(queue.first_incorrect_frame(), Frame::new(1));
    }

    #[test]
    fn misprediction_is_detected_at_the_earliest_differing_frame() {
        let mut queue = test_queue();
        queue.add_input(PlayerInput::new(Frame::new(0), TestInput { inp: 5 }));
        // predict frames 1..=3
        let _ = queue.input(Frame::new(1));
        let _ = queue.input(Frame::new(2));
        let _ = queue.input(Frame::new(3));
        // frame 1 confirms the prediction, frame 2 contradicts it
        queue.add_input(PlayerInput::new(Frame::new(1), TestInput { inp: 5 }));
        queue.add_input(PlayerInput::new(Frame::new(2), TestInput { inp: 6 }));
        queue.add_input(PlayerInput::new(Frame::new(3), TestInput { inp: 6 }));
        assert_eq!(queue.first_incorrect_frame(), Frame::new(2));
    }

    #[test]
    fn reset_prediction_clears_misprediction_state() {
        let mut queue = test_queue();
        queue.add_input(PlayerInput::new(Frame::new(0), TestInput { inp: 1 }));
        let _ = queue.input(Frame::new(1));
        queue.add_input(PlayerInput::new(Frame::new(1), TestInput { inp: 2 }));
        assert_eq!(queue.first_incorrect_frame(), Frame::new(1));

        queue.reset_prediction(Frame::new(1));
        assert_eq!(queue.first_incorrect_frame(), Frame::NULL);
        assert_eq!(queue.prediction.frame, Frame::NULL);
        assert_eq!(queue.last_requested_frame, Frame::NULL);
    }

    #[test]
    #[should_panic(expected = "cannot reset prediction")]
    fn reset_prediction_past_misprediction_panics() {
        let mut queue = test_queue();
        queue.add_input(PlayerInput::new(Frame::new(0), TestInput { inp: 1 }));
        let _ = queue.input(Frame::new(1));
        queue.add_input(PlayerInput::new(Frame::new(1), TestInput { inp: 2 }));
        queue.reset_prediction(Frame::new(5));
    }

    #[test]
    fn discard_respects_last_requested_frame() {
        let mut queue = test_queue();
        for i in 0..10i32 {
            queue.add_input(PlayerInput::new(Frame::new(i), TestInput { inp: i as u8 }));
        }
        // request frame 3, then try to discard up to frame 8
        let _ = queue.input(Frame::new(3));
        queue.discard_confirmed_frames(Frame::new(8));
        // frame 3 must still be retrievable
        let (stored, status) = queue.input(Frame::new(3));
        assert_eq!(status, InputStatus::Confirmed);
        assert_eq!(stored.inp, 3);
    }

    #[test]
    fn discard_all_keeps_the_most_recent_input() {
        let mut queue = test_queue();
        for i in 0..10i32 {
            queue.add_input(PlayerInput::new(Frame::new(i), TestInput { inp: i as u8 }));
        }
        queue.discard_confirmed_frames(Frame::new(100));
        assert_eq!(queue.length, 1);
        let (stored, status) = queue.input(Frame::new(9));
        assert_eq!(status, InputStatus::Confirmed);
        assert_eq!(stored.inp, 9);
    }

    #[test]
    fn discard_before_tail_discards_nothing() {
        let mut queue = test_queue();
        for i in 0..10i32 {
            queue.add_input(PlayerInput::new(Frame::new(i), TestInput { inp: i as u8 }));
        }
        let length_before = queue.length;
        queue.discard_confirmed_frames(Frame::new(-1));
        assert_eq!(queue.length, length_before);
    }

    #[test]
    fn queue_survives_wraparound() {
        let mut queue = test_queue();
        for i in 0..64i32 {
            queue.add_input(PlayerInput::new(Frame::new(i), TestInput { inp: i as u8 }));
        }
        queue.discard_confirmed_frames(Frame::new(60));
        for i in 64..150i32 {
            queue.add_input(PlayerInput::new(Frame::new(i), TestInput { inp: i as u8 }));
            queue.discard_confirmed_frames(Frame::new(i - 3));
        }
        let (stored, status) = queue.input(Frame::new(149));
        assert_eq!(status, InputStatus::Confirmed);
        assert_eq!(stored.inp, 149);
    }

    #[test]
    #[should_panic(expected = "input queue overflow")]
    fn exceeding_queue_capacity_panics() {
        let mut queue = test_queue();
        for i in 0..=(INPUT_QUEUE_LENGTH as i32) {
            queue.add_input(PlayerInput::new(Frame::new(i), TestInput { inp: 0 }));
        }
    }

    #[test]
    fn set_frame_delay_rejects_excessive_delay() {
        let mut queue = test_queue();
        assert!(queue.set_frame_delay(MAX_FRAME_DELAY).is_ok());
        assert!(queue.set_frame_delay(INPUT_QUEUE_LENGTH).is_err());
        // original delay preserved after the rejected call
        assert_eq!(queue.frame_delay(), MAX_FRAME_DELAY);
    }
}
