use std::collections::BTreeMap;

use tracing::{debug, trace, warn};
use web_time::Duration;

use crate::frame_info::{PlayerInput, SyncData};
use crate::network::endpoint::{Event, MessageOutcome, PeerEndpoint};
use crate::network::messages::{ConnectionStatus, Message};
use crate::network::stats::NetworkStats;
use crate::rollback::RollbackController;
use crate::{
    Config, Frame, HeliographError, HeliographEvent, MessageTransport, PlayerHandle, PlayerType,
    SessionHandler, SessionState,
};

/// Minimum frames between two `TimeSync` recommendations surfaced to the host,
/// so the event stream isn't flooded while the link is uneven.
const RECOMMENDATION_INTERVAL: i32 = 60;

/// A `P2PSession` provides all functionality to connect to remote clients in a
/// peer-to-peer fashion, exchange inputs, negotiate session parameters and
/// drive the host gamestate — saving, loading and advancing it through the
/// [`SessionHandler`] callbacks.
///
/// Call [`poll_remote_clients`](Self::poll_remote_clients) once per tick,
/// register local input with [`add_local_input`](Self::add_local_input) and
/// step the simulation with [`advance_frame`](Self::advance_frame). Rollbacks
/// happen synchronously inside `advance_frame`.
pub struct P2PSession<T>
where
    T: Config,
{
    /// The number of players of the session.
    num_players: usize,
    /// Internal state of the session.
    state: SessionState,
    /// All messages to and from remote players go through this transport.
    socket: Box<dyn MessageTransport<T::Address>>,
    /// How the other participants identify this peer; tie-break of the election.
    local_peer_id: T::Address,
    /// The parameters this participant announces.
    sync_data: SyncData,
    /// The election winner, once every peer finished its parameter exchange.
    elected: Option<SyncData>,
    /// Registered players by handle.
    players: BTreeMap<PlayerHandle, PlayerType<T::Address>>,
    /// One endpoint per remote peer.
    endpoints: BTreeMap<T::Address, PeerEndpoint<T>>,
    /// Input queues, snapshot timeline and the rewind/replay machinery.
    controller: RollbackController<T>,
    /// Per-player slot: the highest frame known safe, and whether the player
    /// is disconnected. Written by the controller path for local players and
    /// by endpoint events for remote ones.
    local_connect_status: Vec<ConnectionStatus>,
    /// Local inputs for the current frame, not yet fed into the controller.
    local_inputs: BTreeMap<PlayerHandle, PlayerInput<T::Input>>,
    /// A disconnect happened at an earlier frame than currently simulated; the
    /// simulation must be rewound there before the tick completes.
    disconnect_frame: Frame,
    /// The soonest frame at which the next pacing recommendation may fire.
    next_recommendation_check: Frame,
    /// Whether the frame-0 snapshot has been captured yet.
    first_frame_saved: bool,
    /// Whether `DataSynchronized` was delivered for the current election.
    data_sync_event_sent: bool,
    /// Whether `Running` was delivered for the current synchronization.
    running_event_sent: bool,
}

impl<T: Config> P2PSession<T> {
    pub(crate) fn new(
        num_players: usize,
        socket: Box<dyn MessageTransport<T::Address>>,
        players: BTreeMap<PlayerHandle, PlayerType<T::Address>>,
        local_peer_id: T::Address,
        sync_data: SyncData,
        disconnect_timeout: Duration,
        disconnect_notify_start: Duration,
    ) -> Self {
        // group remote players by peer address; one endpoint per peer
        let mut remote_handles: BTreeMap<T::Address, Vec<PlayerHandle>> = BTreeMap::new();
        for (handle, player_type) in &players {
            if let PlayerType::Remote(addr) = player_type {
                remote_handles.entry(addr.clone()).or_default().push(*handle);
            }
        }
        let endpoints: BTreeMap<T::Address, PeerEndpoint<T>> = remote_handles
            .into_iter()
            .map(|(addr, handles)| {
                let endpoint = PeerEndpoint::new(
                    handles,
                    addr.clone(),
                    num_players,
                    sync_data,
                    disconnect_timeout,
                    disconnect_notify_start,
                );
                (addr, endpoint)
            })
            .collect();

        let mut controller = RollbackController::new(num_players, sync_data.rollback);
        for (handle, player_type) in &players {
            if matches!(player_type, PlayerType::Local) {
                // validated by the builder, cannot fail
                let _ = controller.set_frame_delay(handle.queue_index(), sync_data.delay);
            }
        }

        // without remote peers there is nothing to synchronize with
        let state = if endpoints.is_empty() {
            SessionState::Running
        } else {
            SessionState::Synchronizing
        };

        Self {
            num_players,
            state,
            socket,
            local_peer_id,
            sync_data,
            elected: None,
            players,
            endpoints,
            controller,
            local_connect_status: vec![ConnectionStatus::default(); num_players],
            local_inputs: BTreeMap::new(),
            disconnect_frame: Frame::NULL,
            next_recommendation_check: Frame::new(0),
            first_frame_saved: false,
            data_sync_event_sent: false,
            running_event_sent: false,
        }
    }

    /*
     *  ACCESSORS
     */

    /// The current simulation frame.
    #[must_use]
    pub fn current_frame(&self) -> Frame {
        self.controller.current_frame()
    }

    /// The current [`SessionState`].
    #[must_use]
    pub fn current_state(&self) -> SessionState {
        self.state
    }

    /// True while a rewind/replay is in progress (only observable from within
    /// the [`SessionHandler`] callbacks).
    #[must_use]
    pub fn in_rollback(&self) -> bool {
        self.controller.in_rollback()
    }

    /// The number of players in the session.
    #[must_use]
    pub fn num_players(&self) -> usize {
        self.num_players
    }

    /// The parameters the election settled on, once every peer finished its
    /// exchange.
    #[must_use]
    pub fn elected_sync_data(&self) -> Option<SyncData> {
        self.elected
    }

    /// Handles of the players on this device.
    #[must_use]
    pub fn local_player_handles(&self) -> Vec<PlayerHandle> {
        self.players
            .iter()
            .filter(|(_, t)| matches!(t, PlayerType::Local))
            .map(|(h, _)| *h)
            .collect()
    }

    /// Handles of the players on remote devices.
    #[must_use]
    pub fn remote_player_handles(&self) -> Vec<PlayerHandle> {
        self.players
            .iter()
            .filter(|(_, t)| matches!(t, PlayerType::Remote(_)))
            .map(|(h, _)| *h)
            .collect()
    }

    /// Network quality figures for the peer serving the given player.
    ///
    /// # Errors
    /// - [`HeliographError::PlayerOutOfRange`] for a handle outside the session.
    /// - [`HeliographError::InvalidPlayerHandle`] for a local player.
    /// - [`HeliographError::NotSynchronized`] until that peer is running.
    pub fn network_stats(&self, handle: PlayerHandle) -> Result<NetworkStats, HeliographError> {
        if !handle.is_valid_for(self.num_players) {
            return Err(HeliographError::PlayerOutOfRange {
                handle,
                num_players: self.num_players,
            });
        }
        match self.players.get(&handle) {
            Some(PlayerType::Remote(addr)) => self
                .endpoints
                .get(addr)
                .ok_or(HeliographError::InvalidPlayerHandle { handle })?
                .network_stats(),
            _ => Err(HeliographError::InvalidPlayerHandle { handle }),
        }
    }

    /// The input delay currently applied to a player's queue.
    #[must_use]
    pub fn frame_delay(&self, handle: PlayerHandle) -> usize {
        self.controller.frame_delay(handle.queue_index())
    }

    /// The rollback window currently in effect.
    #[must_use]
    pub fn frame_rollback(&self) -> usize {
        self.controller.frame_rollback()
    }

    /*
     *  INPUT & SIMULATION
     */

    /// Registers local input for a player for the current frame. Call this for
    /// every local player before [`advance_frame`](Self::advance_frame);
    /// calling it twice for the same player overwrites the older input.
    ///
    /// # Errors
    /// - [`HeliographError::PlayerOutOfRange`] for a handle outside the session.
    /// - [`HeliographError::InvalidPlayerHandle`] for a non-local player.
    /// - [`HeliographError::NotSynchronized`] while the handshake is incomplete.
    /// - [`HeliographError::PlayerAlreadyDisconnected`] for a disconnected slot.
    /// - [`HeliographError::InRollback`] while a rollback is in progress.
    /// - [`HeliographError::PredictionThreshold`] when too far ahead of the
    ///   slowest peer; idle and retry next tick.
    pub fn add_local_input(
        &mut self,
        handle: PlayerHandle,
        input: T::Input,
    ) -> Result<(), HeliographError> {
        if !handle.is_valid_for(self.num_players) {
            return Err(HeliographError::PlayerOutOfRange {
                handle,
                num_players: self.num_players,
            });
        }
        if !matches!(self.players.get(&handle), Some(PlayerType::Local)) {
            return Err(HeliographError::InvalidPlayerHandle { handle });
        }
        if self.state != SessionState::Running {
            return Err(HeliographError::NotSynchronized);
        }
        if self.local_connect_status[handle.queue_index()].disconnected {
            return Err(HeliographError::PlayerAlreadyDisconnected { handle });
        }
        if self.controller.in_rollback() {
            return Err(HeliographError::InRollback);
        }

        let current = self.controller.current_frame();
        let last_confirmed = self.controller.last_confirmed_frame();
        let frames_ahead = if last_confirmed.is_null() {
            current.as_i32()
        } else {
            current - last_confirmed
        };
        if frames_ahead >= self.controller.frame_rollback() as i32 {
            return Err(HeliographError::PredictionThreshold);
        }

        self.local_inputs
            .insert(handle, PlayerInput::new(current, input));
        Ok(())
    }

    /// Advances the gamestate by a single frame: feeds the registered local
    /// inputs into the system, transmits them, asks the host to simulate the
    /// frame with the synchronized inputs, and — if a confirmed remote input
    /// contradicted a prediction — rewinds and replays synchronously before
    /// returning.
    ///
    /// # Errors
    /// - [`HeliographError::NotSynchronized`] while the handshake is incomplete.
    /// - [`HeliographError::InvalidRequest`] if a local player's input is
    ///   missing.
    pub fn advance_frame(
        &mut self,
        handler: &mut impl SessionHandler<T>,
    ) -> Result<(), HeliographError> {
        // drain the network first; this may resolve mispredictions (rollback)
        // and even restart the whole session
        self.poll_remote_clients(handler);

        if self.state != SessionState::Running {
            return Err(HeliographError::NotSynchronized);
        }

        for handle in self.local_player_handles() {
            if self.local_connect_status[handle.queue_index()].disconnected {
                continue;
            }
            if !self.local_inputs.contains_key(&handle) {
                return Err(HeliographError::InvalidRequest {
                    info: format!("Missing local input for player {} this frame.", handle),
                });
            }
        }

        // the frame-0 snapshot anchors the earliest possible rollback
        if !self.first_frame_saved {
            self.controller.save_current_state(handler);
            self.first_frame_saved = true;
        }

        // feed local inputs into the controller; delay retargeting may drop
        // them (delay shrank), in which case nothing is sent this frame
        let mut dropped = false;
        for (handle, player_input) in &mut self.local_inputs {
            let queue_index = handle.queue_index();
            let actual_frame = self.controller.add_local_input(queue_index, *player_input)?;
            player_input.frame = actual_frame;
            if actual_frame.is_null() {
                dropped = true;
            } else {
                let status = &mut self.local_connect_status[queue_index];
                status.last_frame = status.last_frame.max(actual_frame);
            }
        }
        if !dropped && !self.local_inputs.is_empty() {
            for endpoint in self.endpoints.values_mut() {
                endpoint.send_input(&self.local_inputs, &self.local_connect_status);
                endpoint.send_all_messages(self.socket.as_mut());
            }
        }

        // simulate the current frame with the best available information
        let inputs = self.controller.synchronized_inputs(&self.local_connect_status);
        handler.advance_frame(&inputs);
        self.controller.increment_frame(handler);
        self.local_inputs.clear();

        Ok(())
    }

    /// Gives the engine a chance to do its internal work; call once per tick.
    /// Receives packets and distributes them to the endpoints, handles all
    /// protocol events (delivering public ones through `handler.on_event`),
    /// performs due rollbacks, trims confirmed history, exchanges checksum
    /// checkpoints, surfaces pacing recommendations and flushes outgoing
    /// packets.
    pub fn poll_remote_clients(&mut self, handler: &mut impl SessionHandler<T>) {
        // distribute inbound messages; a reset signal restarts the session
        for (addr, msg) in self.socket.receive_all() {
            self.route_message(handler, &addr, &msg);
        }

        // update frame advantage estimates for running peers
        let current = self.controller.current_frame();
        for endpoint in self.endpoints.values_mut() {
            if endpoint.is_running() {
                endpoint.update_local_frame_advantage(current);
            }
        }

        // run endpoint timers/retries and collect their events
        let mut events = Vec::new();
        for endpoint in self.endpoints.values_mut() {
            let handles = endpoint.handles().to_vec();
            for event in endpoint.poll(&self.local_connect_status) {
                events.push((handles.clone(), event));
            }
        }
        for (handles, event) in events {
            self.handle_endpoint_event(handler, &handles, event);
        }

        // the deterministic parameter election, once every peer reported in
        self.check_data_sync(handler);
        // flip to Running once every endpoint finished its handshake
        self.check_initial_sync(handler);
        // adopt disconnects other peers know about but we missed
        self.propagate_remote_disconnects(handler);

        if self.state == SessionState::Running {
            // mispredictions and disconnect adjustments collected above are
            // corrected now, before any history is trimmed
            self.resolve_rollbacks(handler);

            let min_confirmed = self.min_confirmed_frame();
            if min_confirmed.is_valid() {
                self.controller.set_last_confirmed_frame(min_confirmed);
                let batch = self.controller.checksums_to_broadcast(min_confirmed);
                if !batch.is_empty() {
                    for endpoint in self.endpoints.values_mut() {
                        if endpoint.is_running() {
                            endpoint.record_local_checksums(&batch);
                        }
                    }
                }
            }

            self.check_wait_recommendation(handler);
        }

        // flush everything the above queued
        for endpoint in self.endpoints.values_mut() {
            endpoint.send_all_messages(self.socket.as_mut());
        }
    }

    /// Disconnects a remote player. The simulation is rolled back to the last
    /// frame confirmed for that player so it never commits to data the peer
    /// never actually sent.
    ///
    /// # Errors
    /// - [`HeliographError::PlayerOutOfRange`] for a handle outside the session.
    /// - [`HeliographError::InvalidPlayerHandle`] for a local player.
    /// - [`HeliographError::PlayerAlreadyDisconnected`] if already disconnected.
    pub fn disconnect_player(
        &mut self,
        handler: &mut impl SessionHandler<T>,
        handle: PlayerHandle,
    ) -> Result<(), HeliographError> {
        if !handle.is_valid_for(self.num_players) {
            return Err(HeliographError::PlayerOutOfRange {
                handle,
                num_players: self.num_players,
            });
        }
        if !matches!(self.players.get(&handle), Some(PlayerType::Remote(_))) {
            return Err(HeliographError::InvalidPlayerHandle { handle });
        }
        if self.local_connect_status[handle.queue_index()].disconnected {
            return Err(HeliographError::PlayerAlreadyDisconnected { handle });
        }

        let last_frame = self.local_connect_status[handle.queue_index()].last_frame;
        self.disconnect_player_at_frame(handle, last_frame);
        handler.on_event(HeliographEvent::Disconnected {
            player_handle: handle,
        });
        if self.state == SessionState::Running {
            self.resolve_rollbacks(handler);
        }
        Ok(())
    }

    /*
     *  INTERNALS
     */

    fn route_message(
        &mut self,
        handler: &mut impl SessionHandler<T>,
        addr: &T::Address,
        msg: &Message,
    ) {
        let Some(endpoint) = self.endpoints.get_mut(addr) else {
            trace!("message from unknown peer {:?}; dropping", addr);
            return;
        };
        if endpoint.handle_message(msg) == MessageOutcome::Reset {
            debug!("peer {:?} restarted; restarting the whole session", addr);
            self.restart(handler);
            // the reset floor each endpoint kept excludes everything older
            // than this message, so re-delivering it starts the new exchange
            if let Some(endpoint) = self.endpoints.get_mut(addr) {
                let _ = endpoint.handle_message(msg);
            }
        }
    }

    /// Re-creates the controller and resets every endpoint (identities
    /// persist), then re-runs the whole handshake from the parameter exchange.
    ///
    /// This is the "desynchronized transport → re-handshake" recovery path:
    /// call it after the transport had to reconnect. It also runs
    /// automatically when a peer is seen restarting (a fresh parameter
    /// exchange arriving from an already-synchronized peer) — every
    /// participant converges back onto a fresh, consistent session. The host
    /// receives a [`HeliographEvent::Restart`] either way and should treat the
    /// simulation as starting over from frame 0.
    pub fn restart(&mut self, handler: &mut impl SessionHandler<T>) {
        self.controller = RollbackController::new(self.num_players, self.sync_data.rollback);
        for (handle, player_type) in &self.players {
            if matches!(player_type, PlayerType::Local) {
                let _ = self
                    .controller
                    .set_frame_delay(handle.queue_index(), self.sync_data.delay);
            }
        }
        self.local_connect_status = vec![ConnectionStatus::default(); self.num_players];
        self.local_inputs.clear();
        self.elected = None;
        self.disconnect_frame = Frame::NULL;
        self.next_recommendation_check = Frame::new(0);
        self.first_frame_saved = false;
        self.data_sync_event_sent = false;
        self.running_event_sent = false;
        self.state = if self.endpoints.is_empty() {
            SessionState::Running
        } else {
            SessionState::Synchronizing
        };
        for endpoint in self.endpoints.values_mut() {
            endpoint.reset(None);
        }
        handler.on_event(HeliographEvent::Restart);
    }

    fn handle_endpoint_event(
        &mut self,
        handler: &mut impl SessionHandler<T>,
        handles: &[PlayerHandle],
        event: Event<T>,
    ) {
        match event {
            Event::Connected => {
                for &player_handle in handles {
                    handler.on_event(HeliographEvent::Connected { player_handle });
                }
            }
            Event::Synchronizing { total, count } => {
                for &player_handle in handles {
                    handler.on_event(HeliographEvent::Synchronizing {
                        player_handle,
                        count,
                        total,
                    });
                }
            }
            Event::Synchronized => {
                for &player_handle in handles {
                    handler.on_event(HeliographEvent::Synchronized { player_handle });
                }
            }
            // folded into check_data_sync, which waits for every endpoint
            Event::DataSynchronized => {}
            Event::NetworkInterrupted { disconnect_timeout } => {
                for &player_handle in handles {
                    handler.on_event(HeliographEvent::ConnectionInterrupted {
                        player_handle,
                        disconnect_timeout,
                    });
                }
            }
            Event::NetworkResumed => {
                for &player_handle in handles {
                    handler.on_event(HeliographEvent::ConnectionResumed { player_handle });
                }
            }
            Event::Disconnected | Event::DesyncDetected => {
                for &player_handle in handles {
                    if self.local_connect_status[player_handle.queue_index()].disconnected {
                        continue;
                    }
                    let last_frame =
                        self.local_connect_status[player_handle.queue_index()].last_frame;
                    self.disconnect_player_at_frame(player_handle, last_frame);
                    handler.on_event(HeliographEvent::Disconnected { player_handle });
                }
            }
            Event::Input { input, player } => {
                let queue_index = player.queue_index();
                let status = &mut self.local_connect_status[queue_index];
                if status.disconnected {
                    return;
                }
                // inputs must arrive gaplessly; anything else is a protocol
                // violation by the peer and is dropped
                if !status.last_frame.is_null() && status.last_frame + 1 != input.frame {
                    warn!(
                        "dropping out-of-sequence input for player {}: expected frame {}, got {}",
                        player,
                        status.last_frame + 1,
                        input.frame
                    );
                    return;
                }
                status.last_frame = input.frame;
                self.controller.add_remote_input(queue_index, input);
            }
        }
    }

    /// Runs the deterministic parameter election once every endpoint completed
    /// its exchange, and applies the winner locally. Every participant runs
    /// the identical comparison over the identical candidates, so all peers
    /// converge on the same winner without a coordinator.
    fn check_data_sync(&mut self, handler: &mut impl SessionHandler<T>) {
        if self.data_sync_event_sent {
            return;
        }
        if self.elected.is_none() {
            if self.endpoints.is_empty() {
                self.elected = Some(self.sync_data);
            } else {
                if !self
                    .endpoints
                    .values()
                    .all(PeerEndpoint::is_data_synchronized)
                {
                    return;
                }
                let mut winner = (self.sync_data, self.local_peer_id.clone());
                for endpoint in self.endpoints.values() {
                    let Some(data) = endpoint.remote_sync_data() else {
                        return;
                    };
                    let candidate = (data, endpoint.peer_addr());
                    debug_assert!(
                        candidate.1 != winner.1,
                        "peer identifiers must be unique across the session"
                    );
                    // highest rank wins, ties broken by the greater identifier
                    if (candidate.0.rank, &candidate.1) > (winner.0.rank, &winner.1) {
                        winner = candidate;
                    }
                }
                debug!(
                    rank = winner.0.rank,
                    delay = winner.0.delay,
                    rollback = winner.0.rollback,
                    "parameter election settled"
                );
                self.elected = Some(winner.0);
            }
        }

        let Some(data) = self.elected else { return };
        for (handle, player_type) in &self.players {
            if matches!(player_type, PlayerType::Local) {
                if let Err(e) = self
                    .controller
                    .set_frame_delay(handle.queue_index(), data.delay)
                {
                    warn!("elected delay rejected, keeping previous: {}", e);
                }
            }
        }
        self.controller.set_frame_rollback(data.rollback);
        self.data_sync_event_sent = true;
        handler.on_event(HeliographEvent::DataSynchronized);
    }

    /// Changes the session state to [`SessionState::Running`] once all
    /// endpoints are synchronized.
    fn check_initial_sync(&mut self, handler: &mut impl SessionHandler<T>) {
        if self.state == SessionState::Synchronizing {
            if !self.endpoints.values().all(PeerEndpoint::is_synchronized) {
                return;
            }
            self.state = SessionState::Running;
        }
        if self.state == SessionState::Running && !self.running_event_sent {
            self.running_event_sent = true;
            handler.on_event(HeliographEvent::Running);
        }
    }

    /// Adopts disconnects that other peers have already registered at earlier
    /// frames than we would have noticed ourselves.
    fn propagate_remote_disconnects(&mut self, handler: &mut impl SessionHandler<T>) {
        for queue_index in 0..self.num_players {
            let handle = PlayerHandle::from_queue_index(queue_index);
            if !matches!(self.players.get(&handle), Some(PlayerType::Remote(_))) {
                continue;
            }
            if self.local_connect_status[queue_index].disconnected {
                continue;
            }

            let mut remotely_disconnected = false;
            let mut min_reported = self.local_connect_status[queue_index].last_frame;
            for endpoint in self.endpoints.values() {
                if !endpoint.is_running() {
                    continue;
                }
                let reported = endpoint.peer_connect_status(queue_index);
                if reported.disconnected {
                    remotely_disconnected = true;
                    min_reported = min_reported.min(reported.last_frame);
                }
            }
            if remotely_disconnected {
                self.disconnect_player_at_frame(handle, min_reported);
                handler.on_event(HeliographEvent::Disconnected {
                    player_handle: handle,
                });
            }
        }
    }

    fn disconnect_player_at_frame(&mut self, handle: PlayerHandle, last_frame: Frame) {
        let Some(PlayerType::Remote(addr)) = self.players.get(&handle) else {
            return;
        };
        let addr = addr.clone();
        if let Some(endpoint) = self.endpoints.get_mut(&addr) {
            let handles = endpoint.handles().to_vec();
            endpoint.disconnect();
            for h in handles {
                self.local_connect_status[h.queue_index()].disconnected = true;
            }
        }

        // if the simulation already ran past the disconnect, it used predicted
        // inputs for a player who will never confirm them; rewind there
        if self.state == SessionState::Running && self.controller.current_frame() > last_frame {
            let target = last_frame + 1;
            if self.disconnect_frame.is_null() || target < self.disconnect_frame {
                self.disconnect_frame = target;
            }
        }
    }

    /// Performs the rollback that pending mispredictions and/or disconnect
    /// adjustments require, if any.
    fn resolve_rollbacks(&mut self, handler: &mut impl SessionHandler<T>) {
        let mut target = self.controller.first_incorrect_frame();
        let forced = self.disconnect_frame;
        self.disconnect_frame = Frame::NULL;
        if !forced.is_null() && (target.is_null() || forced < target) {
            target = forced;
        }
        if target.is_null() {
            return;
        }
        self.controller
            .adjust_simulation(handler, target, &self.local_connect_status);
    }

    /// The minimum confirmed frame across all connected players: per-queue,
    /// the highest frame known safe, skipping queues already disconnected.
    /// Works for any player count, not just two.
    fn min_confirmed_frame(&self) -> Frame {
        let mut min_confirmed = Frame::new(i32::MAX);
        let mut any_connected = false;
        for status in &self.local_connect_status {
            if status.disconnected {
                continue;
            }
            any_connected = true;
            min_confirmed = min_confirmed.min(status.last_frame);
        }
        if !any_connected {
            return Frame::NULL;
        }
        min_confirmed
    }

    /// At a fixed cadence, surfaces the largest nonzero per-endpoint pacing
    /// recommendation so the host can idle and let slower peers catch up.
    fn check_wait_recommendation(&mut self, handler: &mut impl SessionHandler<T>) {
        let current = self.controller.current_frame();
        if current < self.next_recommendation_check {
            return;
        }
        self.next_recommendation_check = current + RECOMMENDATION_INTERVAL;

        let mut frames_ahead = 0;
        for endpoint in self.endpoints.values() {
            if !endpoint.is_running() {
                continue;
            }
            let all_disconnected = endpoint
                .handles()
                .iter()
                .all(|h| self.local_connect_status[h.queue_index()].disconnected);
            if all_disconnected {
                continue;
            }
            frames_ahead = frames_ahead.max(endpoint.recommend_frame_wait_duration());
        }
        if frames_ahead > 0 {
            handler.on_event(HeliographEvent::TimeSync { frames_ahead });
        }
    }
}

// #########
// # TESTS #
// #########
