use std::collections::BTreeMap;

use web_time::Duration;

use crate::frame_info::SyncData;
use crate::input_queue::MAX_FRAME_DELAY;
use crate::sessions::p2p_session::P2PSession;
use crate::{Config, HeliographError, MessageTransport, PlayerHandle, PlayerType};

/// Default time without packets before a peer is considered gone.
const DEFAULT_DISCONNECT_TIMEOUT: Duration = Duration::from_millis(5000);
/// Default time without packets before the host is warned.
const DEFAULT_DISCONNECT_NOTIFY_START: Duration = Duration::from_millis(750);

/// The `SessionBuilder` builds a [`P2PSession`]: register every player
/// (1-based handles), set the timeouts and the locally announced [`SyncData`],
/// name the local peer identifier, then start the session with a transport.
///
/// # Example
///
/// ```
/// # use heliograph::{Config, LoopbackSocket, PlayerHandle, PlayerType, SessionBuilder, SyncData};
/// # use serde::{Deserialize, Serialize};
/// # #[derive(Copy, Clone, PartialEq, Default, Serialize, Deserialize)]
/// # struct Input(u8);
/// # struct GameConfig;
/// # impl Config for GameConfig {
/// #     type Input = Input;
/// #     type State = u64;
/// #     type Address = String;
/// # }
/// let (socket, _peer_socket) = LoopbackSocket::pair("alice".to_owned(), "bob".to_owned());
/// let session = SessionBuilder::<GameConfig>::new()
///     .with_num_players(2)
///     .with_sync_data(SyncData { rank: 5, delay: 2, rollback: 8 })
///     .with_local_peer_id("alice".to_owned())
///     .add_player(PlayerType::Local, PlayerHandle::new(1))
///     .unwrap()
///     .add_player(PlayerType::Remote("bob".to_owned()), PlayerHandle::new(2))
///     .unwrap()
///     .start_p2p_session(socket)
///     .unwrap();
/// ```
pub struct SessionBuilder<T>
where
    T: Config,
{
    num_players: usize,
    disconnect_timeout: Duration,
    disconnect_notify_start: Duration,
    sync_data: SyncData,
    local_peer_id: Option<T::Address>,
    players: BTreeMap<PlayerHandle, PlayerType<T::Address>>,
}

impl<T: Config> Default for SessionBuilder<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Config> SessionBuilder<T> {
    /// Creates a builder with two players, default timeouts and default
    /// [`SyncData`].
    #[must_use]
    pub fn new() -> Self {
        Self {
            num_players: 2,
            disconnect_timeout: DEFAULT_DISCONNECT_TIMEOUT,
            disconnect_notify_start: DEFAULT_DISCONNECT_NOTIFY_START,
            sync_data: SyncData::default(),
            local_peer_id: None,
            players: BTreeMap::new(),
        }
    }

    /// Sets the number of players. Every handle `1..=num_players` must be
    /// registered before the session can start.
    #[must_use]
    pub fn with_num_players(mut self, num_players: usize) -> Self {
        self.num_players = num_players;
        self
    }

    /// Time without packets from a peer after which it is disconnected.
    #[must_use]
    pub fn with_disconnect_timeout(mut self, timeout: Duration) -> Self {
        self.disconnect_timeout = timeout;
        self
    }

    /// Time without packets from a peer after which the host is warned with a
    /// [`HeliographEvent::ConnectionInterrupted`] event.
    ///
    /// [`HeliographEvent::ConnectionInterrupted`]: crate::HeliographEvent::ConnectionInterrupted
    #[must_use]
    pub fn with_disconnect_notify_start(mut self, notify_start: Duration) -> Self {
        self.disconnect_notify_start = notify_start;
        self
    }

    /// The parameters this participant announces for the election.
    #[must_use]
    pub fn with_sync_data(mut self, sync_data: SyncData) -> Self {
        self.sync_data = sync_data;
        self
    }

    /// The identifier under which the other participants know this peer.
    ///
    /// Identifiers **must be unique** across the session — they are the
    /// deterministic tie-break of the parameter election.
    #[must_use]
    pub fn with_local_peer_id(mut self, peer_id: T::Address) -> Self {
        self.local_peer_id = Some(peer_id);
        self
    }

    /// Registers a player under a 1-based handle.
    ///
    /// # Errors
    /// - [`HeliographError::PlayerOutOfRange`] if the handle is outside
    ///   `1..=num_players`.
    /// - [`HeliographError::InvalidRequest`] if the handle is already taken.
    pub fn add_player(
        mut self,
        player_type: PlayerType<T::Address>,
        handle: PlayerHandle,
    ) -> Result<Self, HeliographError> {
        if !handle.is_valid_for(self.num_players) {
            return Err(HeliographError::PlayerOutOfRange {
                handle,
                num_players: self.num_players,
            });
        }
        if self.players.contains_key(&handle) {
            return Err(HeliographError::InvalidRequest {
                info: format!("Player handle {} is already registered.", handle),
            });
        }
        self.players.insert(handle, player_type);
        Ok(self)
    }

    /// Consumes the builder and starts a [`P2PSession`] using the transport.
    ///
    /// # Errors
    /// [`HeliographError::InvalidRequest`] if players are missing, the local
    /// peer id is unset, or the announced parameters are out of range.
    pub fn start_p2p_session(
        self,
        socket: impl MessageTransport<T::Address> + 'static,
    ) -> Result<P2PSession<T>, HeliographError> {
        for i in 1..=self.num_players {
            if !self.players.contains_key(&PlayerHandle::new(i)) {
                return Err(HeliographError::InvalidRequest {
                    info: format!("Player handle {} has not been registered.", i),
                });
            }
        }
        let Some(local_peer_id) = self.local_peer_id else {
            return Err(HeliographError::InvalidRequest {
                info: "The local peer id must be set before starting a session.".to_owned(),
            });
        };
        if self.sync_data.delay > MAX_FRAME_DELAY {
            return Err(HeliographError::InvalidRequest {
                info: format!(
                    "Announced input delay {} exceeds the maximum of {}.",
                    self.sync_data.delay, MAX_FRAME_DELAY
                ),
            });
        }
        if self.sync_data.rollback == 0 || self.sync_data.rollback > MAX_FRAME_DELAY {
            return Err(HeliographError::InvalidRequest {
                info: format!(
                    "Announced rollback window {} is outside 1..={}.",
                    self.sync_data.rollback, MAX_FRAME_DELAY
                ),
            });
        }

        Ok(P2PSession::new(
            self.num_players,
            Box::new(socket),
            self.players,
            local_peer_id,
            self.sync_data,
            self.disconnect_timeout,
            self.disconnect_notify_start,
        ))
    }
}

// #########
// # TESTS #
// #########

#[cfg(test)]
mod builder_tests {
    use super::*;
    use crate::LoopbackSocket;
    use serde::{Deserialize, Serialize};

    #[derive(Copy, Clone, PartialEq, Default, Serialize, Deserialize, Debug)]
    struct TestInput {
        inp: u8,
    }

    struct TestConfig;

    impl Config for TestConfig {
        type Input = TestInput;
        type State = u64;
        type Address = String;
    }

    fn sockets() -> (LoopbackSocket<String>, LoopbackSocket<String>) {
        LoopbackSocket::pair("a".to_owned(), "b".to_owned())
    }

    #[test]
    fn out_of_range_handle_is_rejected() {
        let result = SessionBuilder::<TestConfig>::new()
            .with_num_players(2)
            .add_player(PlayerType::Local, PlayerHandle::new(3));
        assert!(matches!(
            result,
            Err(HeliographError::PlayerOutOfRange { .. })
        ));

        let result = SessionBuilder::<TestConfig>::new()
            .with_num_players(2)
            .add_player(PlayerType::Local, PlayerHandle::new(0));
        assert!(matches!(
            result,
            Err(HeliographError::PlayerOutOfRange { .. })
        ));
    }

    #[test]
    fn duplicate_handle_is_rejected() {
        let result = SessionBuilder::<TestConfig>::new()
            .add_player(PlayerType::Local, PlayerHandle::new(1))
            .unwrap()
            .add_player(PlayerType::Remote("b".to_owned()), PlayerHandle::new(1));
        assert!(matches!(result, Err(HeliographError::InvalidRequest { .. })));
    }

    #[test]
    fn missing_player_fails_to_start() {
        let (socket, _peer) = sockets();
        let result = SessionBuilder::<TestConfig>::new()
            .with_local_peer_id("a".to_owned())
            .add_player(PlayerType::Local, PlayerHandle::new(1))
            .unwrap()
            .start_p2p_session(socket);
        assert!(matches!(result, Err(HeliographError::InvalidRequest { .. })));
    }

    #[test]
    fn missing_local_peer_id_fails_to_start() {
        let (socket, _peer) = sockets();
        let result = SessionBuilder::<TestConfig>::new()
            .add_player(PlayerType::Local, PlayerHandle::new(1))
            .unwrap()
            .add_player(PlayerType::Remote("b".to_owned()), PlayerHandle::new(2))
            .unwrap()
            .start_p2p_session(socket);
        assert!(matches!(result, Err(HeliographError::InvalidRequest { .. })));
    }

    #[test]
    fn complete_builder_starts() {
        let (socket, _peer) = sockets();
        let session = SessionBuilder::<TestConfig>::new()
            .with_local_peer_id("a".to_owned())
            .add_player(PlayerType::Local, PlayerHandle::new(1))
            .unwrap()
            .add_player(PlayerType::Remote("b".to_owned()), PlayerHandle::new(2))
            .unwrap()
            .start_p2p_session(socket);
        assert!(session.is_ok());
    }

    #[test]
    fn absurd_sync_data_is_rejected() {
        let (socket, _peer) = sockets();
        let result = SessionBuilder::<TestConfig>::new()
            .with_sync_data(SyncData {
                rank: 0,
                delay: 0,
                rollback: 0,
            })
            .with_local_peer_id("a".to_owned())
            .add_player(PlayerType::Local, PlayerHandle::new(1))
            .unwrap()
            .add_player(PlayerType::Remote("b".to_owned()), PlayerHandle::new(2))
            .unwrap()
            .start_p2p_session(socket);
        assert!(matches!(result, Err(HeliographError::InvalidRequest { .. })));
    }
}
