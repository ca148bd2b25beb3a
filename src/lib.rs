//! # Heliograph
//!
//! Heliograph is a peer-to-peer rollback netcode engine written in 100% safe Rust.
//! Two (eventually N) participants run identical deterministic simulations in
//! lockstep over an unreliable, possibly high-latency link. Each side predicts the
//! inputs it has not received yet and transparently rewinds and replays the
//! simulation whenever a prediction turns out wrong.
//!
//! The host application supplies its simulation through the [`SessionHandler`]
//! callback trait (save, load, advance, checksum, events) and a transport through
//! the [`MessageTransport`] trait. Everything else — input history and prediction,
//! the per-peer handshake (parameter negotiation, then clock calibration), the
//! steady-state input/quality/keepalive/checksum exchange, frame pacing and desync
//! detection — lives in this crate.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

use std::{fmt::Debug, hash::Hash};

use serde::{de::DeserializeOwned, Serialize};

pub use error::HeliographError;
pub use frame_info::{PlayerInput, SavedChecksum, SyncData};
pub use network::loopback::{LinkConfig, LoopbackSocket};
pub use network::messages::Message;
pub use network::stats::NetworkStats;
pub use sessions::builder::SessionBuilder;
pub use sessions::p2p_session::P2PSession;

#[doc(hidden)]
pub mod checksum;
#[doc(hidden)]
pub mod error;
#[doc(hidden)]
pub mod frame_info;
#[doc(hidden)]
pub mod input_queue;
#[doc(hidden)]
pub mod ring_buffer;
/// Internal random number generator based on PCG32.
///
/// Provides a minimal, high-quality PRNG used for handshake nonces and the
/// deterministic loss model of the loopback transport, replacing a `rand`
/// crate dependency.
pub mod rng;
#[doc(hidden)]
pub mod rollback;
#[doc(hidden)]
pub mod time_sync;
#[doc(hidden)]
pub mod sessions {
    #[doc(hidden)]
    pub mod builder;
    #[doc(hidden)]
    pub mod p2p_session;
}
#[doc(hidden)]
pub mod network {
    #[doc(hidden)]
    pub mod chunk;
    /// Binary codec for network message serialization.
    ///
    /// Centralized encoding and decoding of wire messages using bincode.
    pub mod codec;
    #[doc(hidden)]
    pub mod endpoint;
    #[doc(hidden)]
    pub mod loopback;
    #[doc(hidden)]
    pub mod messages;
    #[doc(hidden)]
    pub mod stats;
}

// #############
// # CONSTANTS #
// #############

/// Internally, -1 represents no frame / invalid frame.
pub const NULL_FRAME: i32 = -1;

/// Interval, in frames, at which state checksums are recorded and exchanged
/// between peers for desync detection. Frames that are multiples of this value
/// are checkpointed.
pub const CHECKSUM_INTERVAL: i32 = 60;

/// A frame is a single step of game execution.
///
/// Frames are the fundamental unit of time in rollback networking. Frame numbers
/// start at 0 and increment sequentially; the special value [`Frame::NULL`] (-1)
/// represents "no frame" or "uninitialized".
///
/// `Frame` is a newtype wrapper around `i32` so that frame numbers cannot be
/// accidentally mixed with other integers.
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct Frame(i32);

impl Frame {
    /// The null frame constant, representing "no frame" or "uninitialized".
    pub const NULL: Frame = Frame(NULL_FRAME);

    /// Creates a new `Frame` from an `i32` value.
    ///
    /// This does not validate the frame number; use [`Frame::is_valid`] to check
    /// for a non-negative frame.
    #[inline]
    #[must_use]
    pub const fn new(frame: i32) -> Self {
        Frame(frame)
    }

    /// Returns the underlying `i32` value.
    #[inline]
    #[must_use]
    pub const fn as_i32(self) -> i32 {
        self.0
    }

    /// Returns `true` if this frame is the null frame.
    #[inline]
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == NULL_FRAME
    }

    /// Returns `true` if this frame is valid (non-negative).
    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 >= 0
    }
}

impl std::fmt::Display for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_null() {
            write!(f, "NULL_FRAME")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl std::ops::Add<i32> for Frame {
    type Output = Frame;

    #[inline]
    fn add(self, rhs: i32) -> Self::Output {
        Frame(self.0 + rhs)
    }
}

impl std::ops::AddAssign<i32> for Frame {
    #[inline]
    fn add_assign(&mut self, rhs: i32) {
        self.0 += rhs;
    }
}

impl std::ops::Sub<i32> for Frame {
    type Output = Frame;

    #[inline]
    fn sub(self, rhs: i32) -> Self::Output {
        Frame(self.0 - rhs)
    }
}

impl std::ops::Sub<Frame> for Frame {
    type Output = i32;

    #[inline]
    fn sub(self, rhs: Frame) -> Self::Output {
        self.0 - rhs.0
    }
}

impl std::ops::Rem<i32> for Frame {
    type Output = i32;

    #[inline]
    fn rem(self, rhs: i32) -> Self::Output {
        self.0 % rhs
    }
}

impl From<i32> for Frame {
    #[inline]
    fn from(value: i32) -> Self {
        Frame(value)
    }
}

impl From<Frame> for i32 {
    #[inline]
    fn from(frame: Frame) -> Self {
        frame.0
    }
}

impl PartialEq<i32> for Frame {
    #[inline]
    fn eq(&self, other: &i32) -> bool {
        self.0 == *other
    }
}

impl PartialOrd<i32> for Frame {
    #[inline]
    fn partial_cmp(&self, other: &i32) -> Option<std::cmp::Ordering> {
        self.0.partial_cmp(other)
    }
}

/// A unique identifier for a player in a session.
///
/// Player handles are **1-based** and stable for the lifetime of the session:
/// handle `h` maps to the zero-based internal queue index `h - 1`. A session
/// with `n` players uses handles `1..=n`.
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct PlayerHandle(usize);

impl PlayerHandle {
    /// Creates a new `PlayerHandle` from a 1-based `usize` value.
    ///
    /// This does not validate the handle against a specific session; use
    /// [`PlayerHandle::is_valid_for`] for that.
    #[inline]
    #[must_use]
    pub const fn new(handle: usize) -> Self {
        PlayerHandle(handle)
    }

    /// Creates the handle for a zero-based queue index (`index + 1`).
    #[inline]
    #[must_use]
    pub const fn from_queue_index(index: usize) -> Self {
        PlayerHandle(index + 1)
    }

    /// Returns the underlying 1-based `usize` value.
    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// Returns the zero-based queue index this handle maps to.
    #[inline]
    #[must_use]
    pub const fn queue_index(self) -> usize {
        debug_assert!(self.0 >= 1, "player handles are 1-based");
        self.0 - 1
    }

    /// Returns `true` if this handle refers to a valid player for a session
    /// with the given number of players.
    #[inline]
    #[must_use]
    pub const fn is_valid_for(self, num_players: usize) -> bool {
        self.0 >= 1 && self.0 <= num_players
    }
}

impl std::fmt::Display for PlayerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// #############
// #   ENUMS   #
// #############

/// Defines the two kinds of participants a session considers:
/// local players, who play on the local device, and remote players, who play
/// on other devices identified by a peer address.
#[derive(Debug, Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub enum PlayerType<A>
where
    A: Clone + PartialEq + Eq + PartialOrd + Ord + Hash,
{
    /// This player plays on the local device.
    Local,
    /// This player plays on a remote device identified by the peer address.
    Remote(A),
}

/// A session is always in one of these states.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// The session is still establishing connections to the remote clients
    /// (exchanging parameters, then calibrating round-trip time).
    Synchronizing,
    /// The session has synchronized and is ready to take and transmit player input.
    Running,
}

/// [`InputStatus`] accompanies every player input handed to
/// [`SessionHandler::advance_frame`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum InputStatus {
    /// The input of this player for this frame was actually received from its source.
    Confirmed,
    /// The input of this player for this frame is predicted.
    Predicted,
    /// The player has disconnected at or prior to this frame, so this input is a dummy.
    Disconnected,
}

/// Stack-allocated row of per-player inputs for a single frame.
///
/// Avoids heap allocation for the common 1-4 player case.
pub type InputVec<I> = smallvec::SmallVec<[(I, InputStatus); 4]>;

/// Notifications delivered to the host through [`SessionHandler::on_event`].
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum HeliographEvent {
    /// The handshake with this player's peer answered its first clock-calibration
    /// roundtrip; the connection is live.
    Connected {
        /// The handle of the player.
        player_handle: PlayerHandle,
    },
    /// The session made progress synchronizing clocks with this player's peer.
    /// After `total` roundtrips the peers are synchronized.
    Synchronizing {
        /// The handle of the player.
        player_handle: PlayerHandle,
        /// Current number of successful roundtrips.
        count: u32,
        /// Total number of required roundtrips.
        total: u32,
    },
    /// The clock-calibration roundtrips with this player's peer are complete.
    Synchronized {
        /// The handle of the player.
        player_handle: PlayerHandle,
    },
    /// All peers have exchanged their session parameters and the deterministic
    /// election has been applied; input delay and rollback window are final.
    DataSynchronized,
    /// Every endpoint is synchronized; the session accepts and transmits input.
    Running,
    /// No packet has arrived from this player's peer for a while; the peer will
    /// be disconnected in `disconnect_timeout` ms unless traffic resumes.
    ConnectionInterrupted {
        /// The handle of the player.
        player_handle: PlayerHandle,
        /// Remaining time until disconnect, in milliseconds.
        disconnect_timeout: u128,
    },
    /// Sent only after a [`HeliographEvent::ConnectionInterrupted`] event, when
    /// traffic from that peer has resumed.
    ConnectionResumed {
        /// The handle of the player.
        player_handle: PlayerHandle,
    },
    /// The remote player has disconnected (timeout, request, or desync).
    Disconnected {
        /// The handle of the player.
        player_handle: PlayerHandle,
    },
    /// The local side is ahead of its peers; consider idling for `frames_ahead`
    /// frames to let them catch up.
    TimeSync {
        /// Recommended number of frames to idle.
        frames_ahead: u32,
    },
    /// A peer restarted its side of the session; the whole session has been
    /// reset and is re-synchronizing from scratch.
    Restart,
}

// #############
// #  TRAITS   #
// #############

/// Compile time parameterization for sessions.
///
/// This trait bundles the generic types needed for a session. Implement it on
/// a marker struct to configure your session types.
///
/// # Example
///
/// ```
/// use heliograph::Config;
/// use serde::{Deserialize, Serialize};
///
/// // Your game's per-player input word
/// #[derive(Copy, Clone, PartialEq, Default, Serialize, Deserialize)]
/// struct GameInput {
///     buttons: u16,
/// }
///
/// // Your game's state snapshot (for save/load)
/// #[derive(Clone)]
/// struct GameState {
///     frame: i32,
///     // ... game-specific state
/// }
///
/// struct GameConfig;
///
/// impl Config for GameConfig {
///     type Input = GameInput;
///     type State = GameState;
///     type Address = String; // peer id handed out by your signaling layer
/// }
/// ```
pub trait Config: 'static {
    /// The input type for a session. This is the only game-related data
    /// transmitted over the network.
    ///
    /// The [`Default`] implementation represents "no input" for a player,
    /// including when a player is disconnected. Equality on this type is the
    /// misprediction check, so `PartialEq` must be an exact value comparison.
    type Input: Copy + Clone + PartialEq + Default + Serialize + DeserializeOwned;

    /// The opaque state snapshot type produced by [`SessionHandler::save_state`].
    type State: Clone;

    /// The identifier for remote peers.
    ///
    /// `Ord` on this type is the deterministic tie-break of the parameter
    /// election, so identifiers **must be unique** across all participants of a
    /// session; this is a precondition, not something the engine can verify on
    /// its own.
    type Address: Clone + PartialEq + Eq + PartialOrd + Ord + Hash + Debug;
}

/// The host callback contract.
///
/// The engine drives the host simulation exclusively through this trait:
/// snapshots for rollback, replays after a misprediction, periodic checksums for
/// desync detection and all session notifications. Rollbacks are synchronous —
/// a single [`P2PSession::advance_frame`] call may invoke `load_state` once and
/// `advance_frame` several times before it returns.
pub trait SessionHandler<T: Config> {
    /// Produce a snapshot of the current simulation state.
    fn save_state(&mut self) -> T::State;

    /// Restore the simulation to a previously saved snapshot.
    fn load_state(&mut self, state: &T::State);

    /// Simulate exactly one frame using the given synchronized inputs,
    /// one `(input, status)` pair per player in handle order.
    fn advance_frame(&mut self, inputs: &[(T::Input, InputStatus)]);

    /// Compute a checksum over a snapshot. Must be deterministic across peers:
    /// identical states must produce identical strings.
    fn checksum(&mut self, state: &T::State) -> String;

    /// Receive a session notification.
    fn on_event(&mut self, event: HeliographEvent);
}

/// The transport seam.
///
/// However you wish to send and receive messages, implement it through these two
/// methods. The transport is assumed to deliver structured messages reliably and
/// in order per peer pair once connected (a WebRTC-style data channel); the
/// engine adds its own monotonic-sequence gate on top defensively, so stray
/// duplicates or stale packets are tolerated.
pub trait MessageTransport<A>
where
    A: Clone + PartialEq + Eq + Hash,
{
    /// Takes a [`Message`] and sends it to the given peer.
    fn send_to(&mut self, msg: &Message, addr: &A);

    /// Returns all messages received since the last call, paired with the peer
    /// each was received from.
    fn receive_all(&mut self) -> Vec<(A, Message)>;
}

// ###################
// # UNIT TESTS      #
// ###################
