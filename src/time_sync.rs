use crate::Frame;

/// Number of frame-advantage samples kept in each sliding window.
pub const TIME_SYNC_WINDOW: usize = 40;

/// Recommendations below this many frames are not worth correcting.
pub const MIN_FRAME_ADVANTAGE: i32 = 3;

/// Recommendations are clamped to this many frames of local sleep.
pub const MAX_FRAME_ADVANTAGE: i32 = 9;

/// Decides, from each side's view of "how far ahead" it is, whether the local
/// side should insert idle frames to let the remote side catch up.
///
/// Two fixed-size circular sample windows are kept, one for the local frame
/// advantage and one for the remote-reported one, indexed by
/// `frame % TIME_SYNC_WINDOW`. Both sides compute the same recommendation
/// independently, but only the side that is ahead gets a nonzero result, so no
/// coordination message is needed.
#[derive(Debug, Clone)]
pub struct TimeSync {
    local: Vec<i32>,
    remote: Vec<i32>,
}

impl Default for TimeSync {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSync {
    /// Creates a new `TimeSync` with zeroed sample windows.
    #[must_use]
    pub fn new() -> Self {
        Self {
            local: vec![0; TIME_SYNC_WINDOW],
            remote: vec![0; TIME_SYNC_WINDOW],
        }
    }

    /// Records one sample of local and remote frame advantage for the frame.
    ///
    /// Invalid frames are skipped; this can happen while an input was dropped
    /// during a delay change.
    pub fn advance_frame(&mut self, frame: Frame, local_advantage: i32, remote_advantage: i32) {
        if !frame.is_valid() {
            return;
        }
        let idx = frame.as_i32() as usize % TIME_SYNC_WINDOW;
        self.local[idx] = local_advantage;
        self.remote[idx] = remote_advantage;
    }

    /// Recommends how many frames the local side should idle to let the remote
    /// side catch up. Returns 0 if the local side is not ahead, if the
    /// difference is below [`MIN_FRAME_ADVANTAGE`], and never more than
    /// [`MAX_FRAME_ADVANTAGE`].
    #[must_use]
    pub fn recommend_frame_wait_duration(&self) -> u32 {
        let local_sum: i32 = self.local.iter().sum();
        let local_avg = local_sum as f32 / self.local.len() as f32;
        let remote_sum: i32 = self.remote.iter().sum();
        let remote_avg = remote_sum as f32 / self.remote.len() as f32;

        // the local side is not ahead, nothing to do
        if local_avg >= remote_avg {
            return 0;
        }

        // meet the remote side in the middle
        let sleep_frames = ((remote_avg - local_avg) / 2.0).round() as i32;
        if sleep_frames < MIN_FRAME_ADVANTAGE {
            return 0;
        }
        sleep_frames.min(MAX_FRAME_ADVANTAGE) as u32
    }
}

// #########
// # TESTS #
// #########
