use std::error::Error;
use std::fmt;
use std::fmt::Display;

use crate::PlayerHandle;

/// This enum contains all error conditions the public API can return. Most API
/// functions return a [`Result<(), HeliographError>`].
///
/// Programmer errors — violating the frame-ordering contract, overflowing a
/// bounded ring — are not represented here: those are invariant violations and
/// panic (see the `# Panics` sections on the offending methods).
///
/// [`Result<(), HeliographError>`]: std::result::Result
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HeliographError {
    /// The given player handle does not refer to a player this operation can
    /// target (e.g. local input for a remote player).
    InvalidPlayerHandle {
        /// The offending handle.
        handle: PlayerHandle,
    },
    /// The given player handle is outside the session's `1..=num_players` range.
    PlayerOutOfRange {
        /// The offending handle.
        handle: PlayerHandle,
        /// The number of players in the session.
        num_players: usize,
    },
    /// The player targeted by a disconnect request has already been disconnected.
    PlayerAlreadyDisconnected {
        /// The offending handle.
        handle: PlayerHandle,
    },
    /// The session is not synchronized yet. Keep polling and wait for the
    /// handshake with every peer to complete.
    NotSynchronized,
    /// A rollback is currently in progress; input cannot be accepted while the
    /// history it belongs to is being rewritten.
    InRollback,
    /// The local side is too many frames ahead of its slowest peer; idle until
    /// remote input catches up.
    PredictionThreshold,
    /// You made an invalid request, usually by using wrong parameters for
    /// function calls.
    InvalidRequest {
        /// Further specifies why the request was invalid.
        info: String,
    },
    /// Serialization or deserialization of data failed.
    SerializationError {
        /// A description of what failed to serialize or deserialize.
        context: String,
    },
}

impl Display for HeliographError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeliographError::InvalidPlayerHandle { handle } => {
                write!(f, "Player handle {} is not valid for this operation.", handle)
            }
            HeliographError::PlayerOutOfRange {
                handle,
                num_players,
            } => {
                write!(
                    f,
                    "Player handle {} is out of range for a session with {} players.",
                    handle, num_players
                )
            }
            HeliographError::PlayerAlreadyDisconnected { handle } => {
                write!(f, "Player {} has already been disconnected.", handle)
            }
            HeliographError::NotSynchronized => {
                write!(
                    f,
                    "The session is not yet synchronized with all remote sessions."
                )
            }
            HeliographError::InRollback => {
                write!(f, "Cannot accept input while a rollback is in progress.")
            }
            HeliographError::PredictionThreshold => {
                write!(
                    f,
                    "Prediction threshold reached, cannot proceed without remote input catching up."
                )
            }
            HeliographError::InvalidRequest { info } => {
                write!(f, "Invalid request: {}", info)
            }
            HeliographError::SerializationError { context } => {
                write!(f, "Serialization error: {}", context)
            }
        }
    }
}

impl Error for HeliographError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_mentions_the_handle() {
        let err = HeliographError::PlayerOutOfRange {
            handle: PlayerHandle::new(4),
            num_players: 2,
        };
        let text = err.to_string();
        assert!(text.contains('4'));
        assert!(text.contains('2'));
    }

    #[test]
    fn errors_compare_by_value() {
        assert_eq!(
            HeliographError::NotSynchronized,
            HeliographError::NotSynchronized
        );
        assert_ne!(
            HeliographError::NotSynchronized,
            HeliographError::InRollback
        );
    }
}
