//! Per-peer protocol endpoint.
//!
//! One [`PeerEndpoint`] exists per remote peer. It is a state machine that
//! first negotiates session parameters (chunked [`SyncData`] exchange in both
//! directions), then calibrates round-trip time with a fixed count of nonce
//! roundtrips, and finally settles into the steady state: input exchange with
//! retransmission, periodic quality reports, keepalives, checksum comparison
//! and disconnect detection.
//!
//! Every inbound message passes three gates before it is routed to its
//! type-specific handler: its sequence number must be strictly newer than the
//! last accepted one from this peer, it must be beyond the floor recorded at
//! the last data-sync reset, and its type must belong to the current phase —
//! stray late `Input` messages during the handshake never reach simulation
//! state.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{trace, warn};
use web_time::{Duration, Instant};

use crate::checksum::ChecksumVerifier;
use crate::frame_info::{PlayerInput, SavedChecksum, SyncData};
use crate::network::chunk::{split_parts, PartAssembly};
use crate::network::codec;
use crate::network::messages::{
    ConnectionStatus, DataSyncReply, DataSyncRequest, Input, InputAck, Message, MessageBody,
    MessageHeader, QualityReply, QualityReport, SavedChecksums, SyncReply, SyncRequest,
};
use crate::network::stats::NetworkStats;
use crate::ring_buffer::RingBuffer;
use crate::rng::random;
use crate::time_sync::TimeSync;
use crate::{Config, Frame, HeliographError, MessageTransport, PlayerHandle};

/// Number of request/reply roundtrips required to finish clock calibration.
pub const NUM_SYNC_ROUNDTRIPS: u32 = 5;

/// Retry interval for the chunked parameter exchange.
const DATA_SYNC_RETRY_INTERVAL: Duration = Duration::from_millis(200);
/// Retry interval for clock-calibration requests.
const SYNC_RETRY_INTERVAL: Duration = Duration::from_millis(200);
/// Pending output is retransmitted when no input packet arrived for this long.
const RUNNING_RETRY_INTERVAL: Duration = Duration::from_millis(200);
/// Interval between quality reports.
const QUALITY_REPORT_INTERVAL: Duration = Duration::from_millis(1000);
/// A keepalive goes out when nothing else was sent for this long.
const KEEPALIVE_INTERVAL: Duration = Duration::from_millis(200);
/// Grace period between disconnecting and dropping all outbound traffic.
const SHUTDOWN_DELAY: Duration = Duration::from_millis(100);
/// A peer that lets this much pending output accumulate without acking is gone.
const PENDING_OUTPUT_LIMIT: usize = 128;
/// Slots in the outbound send queue and the event queue.
const QUEUE_SLOTS: usize = 256;
/// Simulation rate used to convert round-trip time into frames.
const FPS: i32 = 60;

/// Returns the current wall-clock time as milliseconds since UNIX_EPOCH, used
/// for ping/pong RTT measurement (must be comparable across sends). Returns 0
/// if the system clock is before the epoch; the resulting RTT sample is then
/// discarded by saturation rather than corrupting state.
fn millis_since_epoch() -> u128 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}

/// Internal transport-level events, drained by the session once per tick and
/// translated into public [`HeliographEvent`]s.
///
/// [`HeliographEvent`]: crate::HeliographEvent
pub(crate) enum Event<T>
where
    T: Config,
{
    /// The first clock-calibration reply arrived; the connection is live.
    Connected,
    /// One calibration roundtrip completed.
    Synchronizing { total: u32, count: u32 },
    /// All calibration roundtrips completed; the endpoint is running.
    Synchronized,
    /// Both directions of the parameter exchange are complete.
    DataSynchronized,
    /// A confirmed remote input arrived.
    Input {
        input: PlayerInput<T::Input>,
        player: PlayerHandle,
    },
    /// No packet arrived for `disconnect_notify_start`; the peer will be
    /// disconnected in `disconnect_timeout` ms unless traffic resumes.
    NetworkInterrupted { disconnect_timeout: u128 },
    /// Traffic resumed after an interruption.
    NetworkResumed,
    /// The peer timed out, requested a disconnect, or desynced.
    Disconnected,
    /// Checksum comparison failed: the simulations have diverged.
    DesyncDetected,
}

// manual impl: a derive would demand `T: PartialEq` on the Config marker
impl<T: Config> PartialEq for Event<T> {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Event::Connected, Event::Connected)
            | (Event::Synchronized, Event::Synchronized)
            | (Event::DataSynchronized, Event::DataSynchronized)
            | (Event::NetworkResumed, Event::NetworkResumed)
            | (Event::Disconnected, Event::Disconnected)
            | (Event::DesyncDetected, Event::DesyncDetected) => true,
            (
                Event::Synchronizing {
                    total: total_a,
                    count: count_a,
                },
                Event::Synchronizing {
                    total: total_b,
                    count: count_b,
                },
            ) => total_a == total_b && count_a == count_b,
            (
                Event::Input {
                    input: input_a,
                    player: player_a,
                },
                Event::Input {
                    input: input_b,
                    player: player_b,
                },
            ) => input_a == input_b && player_a == player_b,
            (
                Event::NetworkInterrupted {
                    disconnect_timeout: timeout_a,
                },
                Event::NetworkInterrupted {
                    disconnect_timeout: timeout_b,
                },
            ) => timeout_a == timeout_b,
            _ => false,
        }
    }
}

/// What the caller must do with a message after the endpoint looked at it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MessageOutcome {
    /// The message was consumed (possibly dropped by a gate).
    Consumed,
    /// The message is a fresh data-sync request from a restarted peer. The
    /// owning session must fully restart and re-deliver this message.
    Reset,
}

/// Progress of the chunked parameter exchange, in both directions.
#[derive(Debug)]
struct DataSyncProgress {
    /// Sequence number of our part 0; identifies our exchange. 0 until the
    /// first transmission assigns it.
    first_part_seq: u32,
    /// The chunked local `SyncData` payload.
    local_parts: Vec<Vec<u8>>,
    /// Which of our parts the peer has acknowledged.
    acked_parts: Vec<bool>,
    /// The peer's exchange, once its first part arrived.
    remote: Option<RemoteExchange>,
    /// Last transmission of our parts; `None` means send immediately.
    last_send: Option<Instant>,
}

#[derive(Debug)]
struct RemoteExchange {
    first_part_seq: u32,
    assembly: PartAssembly,
}

/// Progress of the clock-calibration roundtrips.
#[derive(Debug)]
struct TimeSyncProgress {
    remaining_roundtrips: u32,
    /// Outstanding nonces; a reply must echo one of these exactly.
    random_requests: BTreeSet<u32>,
    connected_event_sent: bool,
    /// Last request transmission; `None` means send immediately.
    last_send: Option<Instant>,
}

/// Timers of the steady state.
#[derive(Debug)]
struct RunningTimers {
    last_input_recv: Instant,
    last_quality_report: Instant,
}

/// The connection state machine. No transition skips a state except an
/// explicit [`PeerEndpoint::reset`]; `Disconnected` is terminal. Each state
/// carries only the fields relevant to it.
#[derive(Debug)]
enum EndpointState {
    SynchronizingData(DataSyncProgress),
    SynchronizingTime(TimeSyncProgress),
    Running(RunningTimers),
    Disconnected { shutdown_at: Instant },
}

/// Lightweight discriminant of [`EndpointState`] for routing decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Data,
    Time,
    Running,
    Disconnected,
}

/// Protocol endpoint for a single remote peer.
pub(crate) struct PeerEndpoint<T>
where
    T: Config,
{
    /// Handles of the remote players behind this peer, in ascending order.
    /// Inbound input rows map onto these.
    handles: Vec<PlayerHandle>,
    peer_addr: T::Address,
    num_players: usize,

    state: EndpointState,
    /// Our announced parameters; kept for rebuilding the exchange on reset.
    local_sync_data: SyncData,
    /// The peer's parameters, once its exchange completed.
    remote_sync_data: Option<SyncData>,
    /// `first_part_seq` of the completed remote exchange; a strictly newer one
    /// arriving later means the peer restarted.
    remote_exchange_seq: u32,

    // sequence gates
    next_send_seq: u32,
    last_recv_seq: u32,
    /// Messages at or below this sequence predate the last data-sync reset.
    reset_floor: u32,

    send_queue: RingBuffer<Message>,
    event_queue: RingBuffer<Event<T>>,

    // steady-state input exchange
    pending_output: BTreeMap<Frame, Vec<u8>>,
    last_recv_frame: Frame,
    peer_connect_status: Vec<ConnectionStatus>,

    // frame pacing
    time_sync: TimeSync,
    local_frame_advantage: i32,
    remote_frame_advantage: i32,

    // desync detection
    checksum_verifier: ChecksumVerifier,

    // connection health
    disconnect_timeout: Duration,
    disconnect_notify_start: Duration,
    disconnect_notify_sent: bool,
    disconnect_event_sent: bool,
    last_send_time: Instant,
    last_recv_time: Instant,
    round_trip_time: u128,
}

impl<T: Config> PeerEndpoint<T> {
    pub(crate) fn new(
        mut handles: Vec<PlayerHandle>,
        peer_addr: T::Address,
        num_players: usize,
        local_sync_data: SyncData,
        disconnect_timeout: Duration,
        disconnect_notify_start: Duration,
    ) -> Self {
        handles.sort_unstable();
        let now = Instant::now();
        Self {
            handles,
            peer_addr,
            num_players,
            state: EndpointState::SynchronizingData(Self::fresh_data_sync(&local_sync_data)),
            local_sync_data,
            remote_sync_data: None,
            remote_exchange_seq: 0,
            next_send_seq: 1,
            last_recv_seq: 0,
            reset_floor: 0,
            send_queue: RingBuffer::new(QUEUE_SLOTS),
            event_queue: RingBuffer::new(QUEUE_SLOTS),
            pending_output: BTreeMap::new(),
            last_recv_frame: Frame::NULL,
            peer_connect_status: vec![ConnectionStatus::default(); num_players],
            time_sync: TimeSync::new(),
            local_frame_advantage: 0,
            remote_frame_advantage: 0,
            checksum_verifier: ChecksumVerifier::new(),
            disconnect_timeout,
            disconnect_notify_start,
            disconnect_notify_sent: false,
            disconnect_event_sent: false,
            last_send_time: now,
            last_recv_time: now,
            round_trip_time: 0,
        }
    }

    fn fresh_data_sync(sync_data: &SyncData) -> DataSyncProgress {
        // SyncData serialization cannot fail; fall back to an empty payload if
        // it somehow does so the handshake still completes
        let payload = codec::encode(sync_data).unwrap_or_default();
        let local_parts = split_parts(&payload);
        let part_count = local_parts.len();
        DataSyncProgress {
            first_part_seq: 0,
            local_parts,
            acked_parts: vec![false; part_count],
            remote: None,
            last_send: None,
        }
    }

    fn phase(&self) -> Phase {
        match self.state {
            EndpointState::SynchronizingData(_) => Phase::Data,
            EndpointState::SynchronizingTime(_) => Phase::Time,
            EndpointState::Running(_) => Phase::Running,
            EndpointState::Disconnected { .. } => Phase::Disconnected,
        }
    }

    /// Fully resets the endpoint back to a fresh parameter exchange without
    /// destroying its identity. The outbound sequence counter is NOT reset, so
    /// the peer's monotonic gate keeps working across the restart.
    ///
    /// `floor` becomes the inbound gate: anything at or below it (stale
    /// messages from before the reset) is dropped. `None` keeps the current
    /// high-water mark as the floor.
    pub(crate) fn reset(&mut self, floor: Option<u32>) {
        let floor = floor.unwrap_or(self.last_recv_seq);
        self.state = EndpointState::SynchronizingData(Self::fresh_data_sync(&self.local_sync_data));
        self.remote_sync_data = None;
        self.remote_exchange_seq = 0;
        self.last_recv_seq = floor;
        self.reset_floor = floor;
        self.send_queue.clear();
        self.event_queue.clear();
        self.pending_output.clear();
        self.last_recv_frame = Frame::NULL;
        self.peer_connect_status = vec![ConnectionStatus::default(); self.num_players];
        self.time_sync = TimeSync::new();
        self.local_frame_advantage = 0;
        self.remote_frame_advantage = 0;
        self.checksum_verifier = ChecksumVerifier::new();
        self.disconnect_notify_sent = false;
        self.disconnect_event_sent = false;
        self.last_send_time = Instant::now();
        self.last_recv_time = Instant::now();
        self.round_trip_time = 0;
    }

    pub(crate) fn peer_addr(&self) -> T::Address {
        self.peer_addr.clone()
    }

    pub(crate) fn handles(&self) -> &[PlayerHandle] {
        &self.handles
    }

    pub(crate) fn is_running(&self) -> bool {
        self.phase() == Phase::Running
    }

    pub(crate) fn is_synchronized(&self) -> bool {
        matches!(self.phase(), Phase::Running | Phase::Disconnected)
    }

    pub(crate) fn is_data_synchronized(&self) -> bool {
        self.remote_sync_data.is_some()
    }

    /// The peer's announced parameters, once its exchange completed.
    pub(crate) fn remote_sync_data(&self) -> Option<SyncData> {
        self.remote_sync_data
    }

    pub(crate) fn peer_connect_status(&self, queue_index: usize) -> ConnectionStatus {
        self.peer_connect_status
            .get(queue_index)
            .copied()
            .unwrap_or_default()
    }

    /// One-way, local-authoritative disconnect. Stops all future sends after a
    /// grace shutdown delay; not reversible.
    pub(crate) fn disconnect(&mut self) {
        if self.phase() == Phase::Disconnected {
            return;
        }
        self.state = EndpointState::Disconnected {
            shutdown_at: Instant::now() + SHUTDOWN_DELAY,
        };
    }

    /// This side's frame-pacing recommendation for this peer.
    pub(crate) fn recommend_frame_wait_duration(&self) -> u32 {
        self.time_sync.recommend_frame_wait_duration()
    }

    /// Estimates how far behind this peer the local side is, from the last
    /// received frame plus half the measured round-trip time.
    pub(crate) fn update_local_frame_advantage(&mut self, local_frame: Frame) {
        if local_frame.is_null() || self.last_recv_frame.is_null() {
            return;
        }
        let ping = i32::try_from(self.round_trip_time / 2).unwrap_or(i32::MAX);
        let remote_frame = self.last_recv_frame + (ping * FPS) / 1000;
        self.local_frame_advantage = remote_frame - local_frame;
    }

    /// Network quality figures for this peer.
    ///
    /// # Errors
    /// [`HeliographError::NotSynchronized`] until the endpoint is running.
    pub(crate) fn network_stats(&self) -> Result<NetworkStats, HeliographError> {
        if !self.is_running() {
            return Err(HeliographError::NotSynchronized);
        }
        Ok(NetworkStats {
            ping: self.round_trip_time,
            send_queue_len: self.pending_output.len(),
            local_frames_behind: self.local_frame_advantage,
            remote_frames_behind: self.remote_frame_advantage,
        })
    }

    /// Folds locally produced checkpoints into this peer's ledger and queues
    /// them for transmission. A mismatch with checksums the peer already
    /// reported is a desync.
    pub(crate) fn record_local_checksums(&mut self, checksums: &[SavedChecksum]) {
        if checksums.is_empty() {
            return;
        }
        if !self.checksum_verifier.add(checksums) {
            self.push_event(Event::DesyncDetected);
        }
        let body = SavedChecksums {
            checksums: checksums.to_vec(),
        };
        self.queue_message(MessageBody::SavedChecksums(body));
    }

    /*
     *  SENDING
     */

    /// Flushes the send queue into the socket. Once the post-disconnect grace
    /// period has elapsed, outbound traffic is dropped instead.
    pub(crate) fn send_all_messages<S>(&mut self, socket: &mut S)
    where
        S: MessageTransport<T::Address> + ?Sized,
    {
        if let EndpointState::Disconnected { shutdown_at } = &self.state {
            if Instant::now() > *shutdown_at {
                trace!(
                    "endpoint shut down; dropping {} messages",
                    self.send_queue.len()
                );
                self.send_queue.clear();
                return;
            }
        }
        while let Some(msg) = self.send_queue.pop() {
            socket.send_to(&msg, &self.peer_addr);
        }
    }

    /// Registers local input for one frame and transmits all pending rows.
    pub(crate) fn send_input(
        &mut self,
        inputs: &BTreeMap<PlayerHandle, PlayerInput<T::Input>>,
        connect_status: &[ConnectionStatus],
    ) {
        if !self.is_running() {
            return;
        }
        let Some(first) = inputs.values().next() else {
            return;
        };
        let frame = first.frame;

        // one row per frame: every local player's input in handle order
        let row: Vec<T::Input> = inputs.values().map(|pi| pi.input).collect();
        let bytes = match codec::encode(&row) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("failed to encode input row, skipping frame {}: {}", frame, e);
                return;
            }
        };

        self.time_sync.advance_frame(
            frame,
            self.local_frame_advantage,
            self.remote_frame_advantage,
        );

        self.pending_output.insert(frame, bytes);
        if self.pending_output.len() > PENDING_OUTPUT_LIMIT {
            // the peer stopped acknowledging long past any rollback window
            self.push_event(Event::Disconnected);
        }

        self.send_pending_output(connect_status);
    }

    fn send_pending_output(&mut self, connect_status: &[ConnectionStatus]) {
        let Some((&start_frame, _)) = self.pending_output.iter().next() else {
            return;
        };
        let body = Input {
            peer_connect_status: connect_status.to_vec(),
            disconnect_requested: self.phase() == Phase::Disconnected,
            start_frame,
            ack_frame: self.last_recv_frame,
            inputs: self.pending_output.values().cloned().collect(),
        };
        self.queue_message(MessageBody::Input(body));
    }

    fn send_input_ack(&mut self) {
        let body = InputAck {
            ack_frame: self.last_recv_frame,
        };
        self.queue_message(MessageBody::InputAck(body));
    }

    fn send_keep_alive(&mut self) {
        self.queue_message(MessageBody::KeepAlive);
    }

    fn send_quality_report(&mut self) {
        let clamped = self
            .local_frame_advantage
            .clamp(i32::from(i16::MIN), i32::from(i16::MAX));
        let body = QualityReport {
            frame_advantage: clamped as i16,
            ping: millis_since_epoch(),
        };
        self.queue_message(MessageBody::QualityReport(body));
    }

    fn send_data_sync_parts(&mut self) {
        let (parts, acked, mut first_part_seq) = match &self.state {
            EndpointState::SynchronizingData(ds) => (
                ds.local_parts.clone(),
                ds.acked_parts.clone(),
                ds.first_part_seq,
            ),
            _ => return,
        };
        // the exchange is identified by the sequence number of its part 0; fix
        // it on the first transmission and keep it across retries
        if first_part_seq == 0 {
            first_part_seq = self.next_send_seq;
        }
        let part_count = parts.len() as u32;
        for (index, part) in parts.into_iter().enumerate() {
            if acked[index] {
                continue;
            }
            self.queue_message(MessageBody::DataSyncRequest(DataSyncRequest {
                first_part_seq,
                part_count,
                part_index: index as u32,
                part,
            }));
        }
        if let EndpointState::SynchronizingData(ds) = &mut self.state {
            ds.first_part_seq = first_part_seq;
            ds.last_send = Some(Instant::now());
        }
    }

    fn send_sync_request(&mut self) {
        let nonce = random();
        if let EndpointState::SynchronizingTime(ts) = &mut self.state {
            ts.random_requests.insert(nonce);
            ts.last_send = Some(Instant::now());
        } else {
            return;
        }
        self.queue_message(MessageBody::SyncRequest(SyncRequest {
            random_request: nonce,
        }));
    }

    fn queue_message(&mut self, body: MessageBody) {
        let header = MessageHeader {
            sequence: self.next_send_seq,
        };
        self.next_send_seq += 1;
        self.last_send_time = Instant::now();
        trace!("queuing message to {:?}: {:?}", self.peer_addr, body);
        self.send_queue.push(Message { header, body });
    }

    fn push_event(&mut self, event: Event<T>) {
        if self.event_queue.is_full() {
            // drop the oldest; the session drains every tick, so this only
            // triggers if the host stops polling entirely
            let _ = self.event_queue.pop();
        }
        self.event_queue.push(event);
    }

    /*
     *  PER-TICK DRIVING
     */

    /// Runs retries and timers for the current state and drains the events
    /// that accumulated since the last poll. Timeouts are detected here, by
    /// comparing stored timestamps against "now" — never mid-rollback.
    pub(crate) fn poll(&mut self, connect_status: &[ConnectionStatus]) -> Vec<Event<T>> {
        let now = Instant::now();

        let mut send_parts = false;
        let mut send_sync_request = false;
        let mut resend_pending = false;
        let mut send_quality = false;
        let mut notify_interrupted = false;
        let mut notify_disconnected = false;

        match &self.state {
            EndpointState::SynchronizingData(ds) => {
                let all_acked = ds.acked_parts.iter().all(|a| *a);
                let due = ds
                    .last_send
                    .map_or(true, |t| t + DATA_SYNC_RETRY_INTERVAL < now);
                send_parts = !all_acked && due;
            }
            EndpointState::SynchronizingTime(ts) => {
                send_sync_request = ts.last_send.map_or(true, |t| t + SYNC_RETRY_INTERVAL < now);
            }
            EndpointState::Running(timers) => {
                resend_pending = timers.last_input_recv + RUNNING_RETRY_INTERVAL < now
                    && !self.pending_output.is_empty();
                send_quality = timers.last_quality_report + QUALITY_REPORT_INTERVAL < now;
                notify_interrupted = !self.disconnect_notify_sent
                    && self.last_recv_time + self.disconnect_notify_start < now;
                notify_disconnected = !self.disconnect_event_sent
                    && self.last_recv_time + self.disconnect_timeout < now;
            }
            EndpointState::Disconnected { .. } => {}
        }

        if send_parts {
            self.send_data_sync_parts();
        }
        if send_sync_request {
            self.send_sync_request();
        }
        if resend_pending {
            self.send_pending_output(connect_status);
            if let EndpointState::Running(timers) = &mut self.state {
                timers.last_input_recv = now;
            }
        }
        if send_quality {
            if let EndpointState::Running(timers) = &mut self.state {
                timers.last_quality_report = now;
            }
            self.send_quality_report();
        }
        // keepalive only if the steps above (or earlier traffic) didn't send
        if self.phase() == Phase::Running && self.last_send_time + KEEPALIVE_INTERVAL < now {
            self.send_keep_alive();
        }
        if notify_interrupted {
            let remaining = self.disconnect_timeout - self.disconnect_notify_start;
            self.push_event(Event::NetworkInterrupted {
                disconnect_timeout: remaining.as_millis(),
            });
            self.disconnect_notify_sent = true;
        }
        if notify_disconnected {
            self.push_event(Event::Disconnected);
            self.disconnect_event_sent = true;
        }

        let mut events = Vec::with_capacity(self.event_queue.len());
        while let Some(event) = self.event_queue.pop() {
            events.push(event);
        }
        events
    }

    /*
     *  RECEIVING
     */

    /// Routes one inbound message through the ordering/staleness gates and to
    /// its type-specific handler.
    pub(crate) fn handle_message(&mut self, msg: &Message) -> MessageOutcome {
        let phase = self.phase();
        if phase == Phase::Disconnected {
            trace!("endpoint disconnected; ignoring message");
            return MessageOutcome::Consumed;
        }

        let seq = msg.header.sequence;
        // gate 1: strictly newer than anything accepted from this peer
        if seq <= self.last_recv_seq {
            trace!("dropping stale message (seq {} <= {})", seq, self.last_recv_seq);
            return MessageOutcome::Consumed;
        }
        // gate 2: from after the last data-sync reset
        if seq <= self.reset_floor {
            trace!(
                "dropping pre-reset message (seq {} <= floor {})",
                seq,
                self.reset_floor
            );
            return MessageOutcome::Consumed;
        }

        // a fresh exchange from a peer we already synchronized with means the
        // peer restarted; surface it instead of consuming the message
        if let MessageBody::DataSyncRequest(body) = &msg.body {
            if phase != Phase::Data && body.first_part_seq > self.remote_exchange_seq {
                trace!(
                    "peer restarted (exchange {} > {})",
                    body.first_part_seq,
                    self.remote_exchange_seq
                );
                return MessageOutcome::Reset;
            }
        }

        self.last_recv_seq = seq;
        self.last_recv_time = Instant::now();
        if self.disconnect_notify_sent && phase == Phase::Running {
            self.disconnect_notify_sent = false;
            self.push_event(Event::NetworkResumed);
        }

        // gate 3: phase filter — route only message types that belong to the
        // current phase, silently ignore the rest
        match (phase, &msg.body) {
            (Phase::Data, MessageBody::DataSyncRequest(body)) => {
                self.on_data_sync_request(body);
            }
            (Phase::Data, MessageBody::DataSyncReply(body)) => {
                self.on_data_sync_reply(*body);
            }
            // a late retry of the exchange we already completed: re-ack it so a
            // peer whose acks were lost can finish its side
            (Phase::Time | Phase::Running, MessageBody::DataSyncRequest(body)) => {
                if body.first_part_seq == self.remote_exchange_seq {
                    self.queue_message(MessageBody::DataSyncReply(DataSyncReply {
                        first_part_seq: body.first_part_seq,
                        ack_part_index: body.part_index,
                    }));
                }
            }
            (Phase::Time | Phase::Running, MessageBody::SyncRequest(body)) => {
                let reply = SyncReply {
                    random_reply: body.random_request,
                };
                self.queue_message(MessageBody::SyncReply(reply));
            }
            (Phase::Time, MessageBody::SyncReply(body)) => {
                self.on_sync_reply(*body);
            }
            (Phase::Running, MessageBody::Input(body)) => {
                self.on_input(body);
            }
            (Phase::Running, MessageBody::InputAck(body)) => {
                self.pop_pending_output(body.ack_frame);
            }
            (Phase::Running, MessageBody::QualityReport(body)) => {
                self.remote_frame_advantage = i32::from(body.frame_advantage);
                let reply = QualityReply { pong: body.ping };
                self.queue_message(MessageBody::QualityReply(reply));
            }
            (Phase::Running, MessageBody::QualityReply(body)) => {
                self.round_trip_time = millis_since_epoch().saturating_sub(body.pong);
            }
            (Phase::Running, MessageBody::SavedChecksums(body)) => {
                if !self.checksum_verifier.add(&body.checksums) {
                    self.push_event(Event::DesyncDetected);
                }
            }
            (_, MessageBody::KeepAlive) => {}
            (phase, body) => {
                trace!("ignoring {:?} outside its phase ({:?})", body, phase);
            }
        }
        MessageOutcome::Consumed
    }

    /// Stores one inbound part of the peer's parameter exchange and
    /// acknowledges it.
    fn on_data_sync_request(&mut self, body: &DataSyncRequest) {
        let completed;
        let exchange_seq;
        {
            let EndpointState::SynchronizingData(ds) = &mut self.state else {
                return;
            };

            let adopt = match &ds.remote {
                None => true,
                // the peer restarted mid-handshake: adopt its fresh exchange
                Some(ex) => body.first_part_seq > ex.first_part_seq,
            };
            if adopt {
                ds.remote = Some(RemoteExchange {
                    first_part_seq: body.first_part_seq,
                    assembly: PartAssembly::new(body.part_count as usize),
                });
            }
            let Some(exchange) = &mut ds.remote else {
                return;
            };
            if exchange.first_part_seq != body.first_part_seq {
                // stale part of an abandoned exchange
                return;
            }
            exchange
                .assembly
                .insert(body.part_index as usize, body.part.clone());
            completed = exchange.assembly.assemble();
            exchange_seq = exchange.first_part_seq;
        }

        self.queue_message(MessageBody::DataSyncReply(DataSyncReply {
            first_part_seq: body.first_part_seq,
            ack_part_index: body.part_index,
        }));

        if self.remote_sync_data.is_none() {
            if let Some(payload) = completed {
                match codec::decode::<SyncData>(&payload) {
                    Ok((sync_data, _)) => {
                        self.remote_sync_data = Some(sync_data);
                        self.remote_exchange_seq = exchange_seq;
                    }
                    Err(e) => {
                        warn!("peer sent undecodable sync data: {}", e);
                    }
                }
            }
        }
        self.try_finish_data_sync();
    }

    /// Marks one of our parts as acknowledged by the peer.
    fn on_data_sync_reply(&mut self, body: DataSyncReply) {
        {
            let EndpointState::SynchronizingData(ds) = &mut self.state else {
                return;
            };
            if ds.first_part_seq == 0 || body.first_part_seq != ds.first_part_seq {
                return;
            }
            if let Some(slot) = ds.acked_parts.get_mut(body.ack_part_index as usize) {
                *slot = true;
            }
        }
        self.try_finish_data_sync();
    }

    /// Transitions to clock calibration once both directions are complete.
    fn try_finish_data_sync(&mut self) {
        let EndpointState::SynchronizingData(ds) = &self.state else {
            return;
        };
        let local_done = ds.acked_parts.iter().all(|a| *a);
        if !local_done || self.remote_sync_data.is_none() {
            return;
        }
        self.state = EndpointState::SynchronizingTime(TimeSyncProgress {
            remaining_roundtrips: NUM_SYNC_ROUNDTRIPS,
            random_requests: BTreeSet::new(),
            connected_event_sent: false,
            last_send: None,
        });
        self.push_event(Event::DataSynchronized);
    }

    /// Checks a calibration reply's nonce and either continues the roundtrips
    /// or concludes the handshake.
    fn on_sync_reply(&mut self, body: SyncReply) {
        let first_reply;
        let remaining;
        {
            let EndpointState::SynchronizingTime(ts) = &mut self.state else {
                return;
            };
            if !ts.random_requests.remove(&body.random_reply) {
                // not an echo of anything we asked
                return;
            }
            ts.remaining_roundtrips -= 1;
            first_reply = !ts.connected_event_sent;
            ts.connected_event_sent = true;
            remaining = ts.remaining_roundtrips;
        }

        if first_reply {
            self.push_event(Event::Connected);
        }
        if remaining > 0 {
            self.push_event(Event::Synchronizing {
                total: NUM_SYNC_ROUNDTRIPS,
                count: NUM_SYNC_ROUNDTRIPS - remaining,
            });
            self.send_sync_request();
        } else {
            let now = Instant::now();
            self.state = EndpointState::Running(RunningTimers {
                last_input_recv: now,
                last_quality_report: now,
            });
            self.push_event(Event::Synchronized);
        }
    }

    fn on_input(&mut self, body: &Input) {
        // acks piggyback on input packets
        self.pop_pending_output(body.ack_frame);

        if body.disconnect_requested {
            if !self.disconnect_event_sent {
                self.push_event(Event::Disconnected);
                self.disconnect_event_sent = true;
            }
        } else {
            // merge the peer's view of everyone's progress; disconnects are
            // sticky and last frames never move backwards
            for (local, remote) in self
                .peer_connect_status
                .iter_mut()
                .zip(body.peer_connect_status.iter())
            {
                local.disconnected = remote.disconnected || local.disconnected;
                local.last_frame = std::cmp::max(local.last_frame, remote.last_frame);
            }
        }

        let mut received_new_input = false;
        let handles = self.handles.clone();
        for (offset, row_bytes) in body.inputs.iter().enumerate() {
            let frame = body.start_frame + offset as i32;
            // rows we already have are skipped, not re-applied
            if frame <= self.last_recv_frame {
                continue;
            }
            let row: Vec<T::Input> = match codec::decode(row_bytes) {
                Ok((row, _)) => row,
                Err(e) => {
                    warn!("undecodable input row for frame {}: {}", frame, e);
                    return;
                }
            };
            self.last_recv_frame = frame;
            received_new_input = true;
            for (player, input) in handles.iter().zip(row.into_iter()) {
                self.push_event(Event::Input {
                    input: PlayerInput::new(frame, input),
                    player: *player,
                });
            }
        }

        if received_new_input {
            if let EndpointState::Running(timers) = &mut self.state {
                timers.last_input_recv = Instant::now();
            }
            self.send_input_ack();
        }
    }

    fn pop_pending_output(&mut self, ack_frame: Frame) {
        self.pending_output.retain(|&frame, _| frame > ack_frame);
    }
}

// #########
// # TESTS #
// #########

#[cfg(test)]
mod endpoint_tests {
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

    struct VecSocket {
        sent: Vec<(String, Message)>,
    }

    impl MessageTransport<String> for VecSocket {
        fn send_to(&mut self, msg: &Message, addr: &String) {
            self.sent.push((addr.clone(), msg.clone()));
        }

        fn receive_all(&mut self) -> Vec<(String, Message)> {
            Vec::new()
        }
    }

    fn endpoint(local_rank: i32) -> PeerEndpoint<TestConfig> {
        PeerEndpoint::new(
            vec![PlayerHandle::new(2)],
            "peer".to_owned(),
            2,
            SyncData {
                rank: local_rank,
                delay: 2,
                rollback: 8,
            },
            Duration::from_millis(5000),
            Duration::from_millis(3000),
        )
    }

    fn no_status() -> Vec<ConnectionStatus> {
        vec![ConnectionStatus::default(); 2]
    }

    /// Ferries every queued message from `from` into `to`, returning events
    /// raised by `to` plus whether a reset was signaled.
    fn pump(
        from: &mut PeerEndpoint<TestConfig>,
        to: &mut PeerEndpoint<TestConfig>,
    ) -> (Vec<Event<TestConfig>>, bool) {
        let mut socket = VecSocket { sent: Vec::new() };
        from.send_all_messages(&mut socket);
        let mut reset = false;
        for (_, msg) in &socket.sent {
            if to.handle_message(msg) == MessageOutcome::Reset {
                reset = true;
            }
        }
        let events = to.poll(&no_status());
        (events, reset)
    }

    /// Runs the full handshake between two endpoints and returns all events
    /// seen on each side.
    fn handshake(
        a: &mut PeerEndpoint<TestConfig>,
        b: &mut PeerEndpoint<TestConfig>,
    ) -> (Vec<Event<TestConfig>>, Vec<Event<TestConfig>>) {
        let mut events_a = Vec::new();
        let mut events_b = Vec::new();
        // kick both sides
        events_a.extend(a.poll(&no_status()));
        events_b.extend(b.poll(&no_status()));
        for _ in 0..20 {
            let (eb, _) = pump(a, b);
            events_b.extend(eb);
            let (ea, _) = pump(b, a);
            events_a.extend(ea);
            if a.is_running() && b.is_running() {
                break;
            }
        }
        (events_a, events_b)
    }

    #[test]
    fn fresh_endpoint_is_not_synchronized() {
        let endpoint = endpoint(1);
        assert!(!endpoint.is_running());
        assert!(!endpoint.is_synchronized());
        assert!(!endpoint.is_data_synchronized());
    }

    #[test]
    fn full_handshake_reaches_running_on_both_sides() {
        let mut a = endpoint(1);
        let mut b = endpoint(2);
        let (events_a, events_b) = handshake(&mut a, &mut b);

        assert!(a.is_running());
        assert!(b.is_running());
        assert_eq!(a.remote_sync_data().map(|d| d.rank), Some(2));
        assert_eq!(b.remote_sync_data().map(|d| d.rank), Some(1));

        for events in [&events_a, &events_b] {
            assert!(events.contains(&Event::DataSynchronized));
            assert!(events.contains(&Event::Connected));
            assert!(events.contains(&Event::Synchronized));
            // one Synchronizing event per non-final roundtrip
            let roundtrips = events
                .iter()
                .filter(|e| matches!(e, Event::Synchronizing { .. }))
                .count();
            assert_eq!(roundtrips, (NUM_SYNC_ROUNDTRIPS - 1) as usize);
        }
    }

    #[test]
    fn stale_sequence_numbers_are_dropped() {
        let mut a = endpoint(1);
        let mut b = endpoint(2);
        handshake(&mut a, &mut b);

        // capture a's input message, deliver it, then replay it
        let mut socket = VecSocket { sent: Vec::new() };
        a.send_input(
            &BTreeMap::from([(
                PlayerHandle::new(1),
                PlayerInput::new(Frame::new(0), TestInput { inp: 3 }),
            )]),
            &no_status(),
        );
        a.send_all_messages(&mut socket);
        assert!(!socket.sent.is_empty());

        for (_, msg) in &socket.sent {
            assert_eq!(b.handle_message(msg), MessageOutcome::Consumed);
        }
        let events_first = b.poll(&no_status());
        let inputs_first = events_first
            .iter()
            .filter(|e| matches!(e, Event::Input { .. }))
            .count();
        assert_eq!(inputs_first, 1);

        // replaying the identical messages is a no-op
        for (_, msg) in &socket.sent {
            assert_eq!(b.handle_message(msg), MessageOutcome::Consumed);
        }
        let events_replay = b.poll(&no_status());
        assert!(events_replay
            .iter()
            .all(|e| !matches!(e, Event::Input { .. })));
    }

    #[test]
    fn input_messages_are_ignored_during_handshake() {
        let mut b = endpoint(2);
        // craft an input message with a high sequence while b is still in the
        // parameter exchange
        let msg = Message {
            header: MessageHeader { sequence: 999 },
            body: MessageBody::Input(Input {
                peer_connect_status: no_status(),
                disconnect_requested: false,
                start_frame: Frame::new(0),
                ack_frame: Frame::NULL,
                inputs: vec![codec::encode(&vec![TestInput { inp: 1 }]).expect("encode")],
            }),
        };
        assert_eq!(b.handle_message(&msg), MessageOutcome::Consumed);
        let events = b.poll(&no_status());
        assert!(events.iter().all(|e| !matches!(e, Event::Input { .. })));
        assert_eq!(b.last_recv_frame, Frame::NULL);
    }

    #[test]
    fn input_roundtrip_delivers_per_player_events() {
        let mut a = endpoint(1);
        let mut b = endpoint(2);
        handshake(&mut a, &mut b);

        for frame in 0..3 {
            a.send_input(
                &BTreeMap::from([(
                    PlayerHandle::new(1),
                    PlayerInput::new(Frame::new(frame), TestInput { inp: frame as u8 }),
                )]),
                &no_status(),
            );
        }
        let (events, _) = pump(&mut a, &mut b);
        let inputs: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                Event::Input { input, player } => Some((*player, input.frame, input.input.inp)),
                _ => None,
            })
            .collect();
        assert_eq!(
            inputs,
            vec![
                (PlayerHandle::new(2), Frame::new(0), 0),
                (PlayerHandle::new(2), Frame::new(1), 1),
                (PlayerHandle::new(2), Frame::new(2), 2),
            ]
        );
    }

    #[test]
    fn acked_input_is_dropped_from_pending_output() {
        let mut a = endpoint(1);
        let mut b = endpoint(2);
        handshake(&mut a, &mut b);

        for frame in 0..3 {
            a.send_input(
                &BTreeMap::from([(
                    PlayerHandle::new(1),
                    PlayerInput::new(Frame::new(frame), TestInput { inp: 0 }),
                )]),
                &no_status(),
            );
        }
        assert_eq!(a.pending_output.len(), 3);
        // deliver to b (which acks), then deliver b's ack back to a
        let _ = pump(&mut a, &mut b);
        let _ = pump(&mut b, &mut a);
        assert!(a.pending_output.is_empty());
    }

    #[test]
    fn fresh_exchange_after_sync_signals_reset() {
        let mut a = endpoint(1);
        let mut b = endpoint(2);
        handshake(&mut a, &mut b);

        // a restarts: a new exchange with a strictly newer first_part_seq
        a.reset(None);
        a.poll(&no_status());
        let mut socket = VecSocket { sent: Vec::new() };
        a.send_all_messages(&mut socket);
        assert!(!socket.sent.is_empty());
        let mut saw_reset = false;
        for (_, msg) in &socket.sent {
            if b.handle_message(msg) == MessageOutcome::Reset {
                saw_reset = true;
            }
        }
        assert!(saw_reset);
    }

    #[test]
    fn reset_endpoints_can_handshake_again() {
        let mut a = endpoint(1);
        let mut b = endpoint(2);
        handshake(&mut a, &mut b);

        a.reset(None);
        b.reset(None);
        handshake(&mut a, &mut b);
        assert!(a.is_running());
        assert!(b.is_running());
    }

    #[test]
    fn checksum_mismatch_raises_desync_event() {
        let mut a = endpoint(1);
        let mut b = endpoint(2);
        handshake(&mut a, &mut b);

        // each side records its own checkpoint for frame 60
        a.record_local_checksums(&[SavedChecksum::new(Frame::new(60), "aaaa".to_owned())]);
        b.record_local_checksums(&[SavedChecksum::new(Frame::new(60), "bbbb".to_owned())]);

        // exchanging them must surface the divergence on both sides
        let (events_b, _) = pump(&mut a, &mut b);
        let (events_a, _) = pump(&mut b, &mut a);
        assert!(events_b.contains(&Event::DesyncDetected));
        assert!(events_a.contains(&Event::DesyncDetected));
    }

    #[test]
    fn matching_checksums_raise_nothing() {
        let mut a = endpoint(1);
        let mut b = endpoint(2);
        handshake(&mut a, &mut b);

        a.record_local_checksums(&[SavedChecksum::new(Frame::new(60), "same".to_owned())]);
        b.record_local_checksums(&[SavedChecksum::new(Frame::new(60), "same".to_owned())]);

        let (events_b, _) = pump(&mut a, &mut b);
        let (events_a, _) = pump(&mut b, &mut a);
        assert!(!events_b.contains(&Event::DesyncDetected));
        assert!(!events_a.contains(&Event::DesyncDetected));
    }

    #[test]
    fn disconnect_stops_future_sends_after_grace() {
        let mut a = endpoint(1);
        let mut b = endpoint(2);
        handshake(&mut a, &mut b);

        // flush whatever the handshake left queued
        let mut drain = VecSocket { sent: Vec::new() };
        a.send_all_messages(&mut drain);

        a.disconnect();
        assert!(a.is_synchronized());
        assert!(!a.is_running());

        // after the grace period the queue is dropped rather than flushed
        std::thread::sleep(std::time::Duration::from_millis(150));
        a.send_input(
            &BTreeMap::from([(
                PlayerHandle::new(1),
                PlayerInput::new(Frame::new(0), TestInput { inp: 0 }),
            )]),
            &no_status(),
        );
        let mut socket = VecSocket { sent: Vec::new() };
        a.send_all_messages(&mut socket);
        assert!(socket.sent.is_empty());
    }

    #[test]
    fn silence_raises_interrupted_then_disconnected() {
        let mut a = PeerEndpoint::<TestConfig>::new(
            vec![PlayerHandle::new(2)],
            "peer".to_owned(),
            2,
            SyncData::default(),
            Duration::from_millis(50),
            Duration::from_millis(20),
        );
        let mut b = endpoint(2);
        handshake(&mut a, &mut b);
        assert!(a.is_running());

        // nothing arrives; both thresholds pass
        std::thread::sleep(std::time::Duration::from_millis(70));
        let events = a.poll(&no_status());
        assert!(events
            .iter()
            .any(|e| matches!(e, Event::NetworkInterrupted { .. })));
        assert!(events.contains(&Event::Disconnected));
    }

    #[test]
    fn traffic_after_interruption_raises_resumed() {
        let mut a = PeerEndpoint::<TestConfig>::new(
            vec![PlayerHandle::new(2)],
            "peer".to_owned(),
            2,
            SyncData::default(),
            Duration::from_millis(5000),
            Duration::from_millis(20),
        );
        let mut b = endpoint(2);
        handshake(&mut a, &mut b);

        std::thread::sleep(std::time::Duration::from_millis(40));
        let events = a.poll(&no_status());
        assert!(events
            .iter()
            .any(|e| matches!(e, Event::NetworkInterrupted { .. })));

        // any packet from the peer clears the interruption
        b.send_input(
            &BTreeMap::from([(
                PlayerHandle::new(2),
                PlayerInput::new(Frame::new(0), TestInput { inp: 0 }),
            )]),
            &no_status(),
        );
        let (events, _) = pump(&mut b, &mut a);
        assert!(events.contains(&Event::NetworkResumed));
    }

    #[test]
    fn disconnect_request_flag_disconnects_the_receiver() {
        let mut a = endpoint(1);
        let mut b = endpoint(2);
        handshake(&mut a, &mut b);

        let msg = Message {
            header: MessageHeader { sequence: 9999 },
            body: MessageBody::Input(Input {
                peer_connect_status: no_status(),
                disconnect_requested: true,
                start_frame: Frame::NULL,
                ack_frame: Frame::NULL,
                inputs: Vec::new(),
            }),
        };
        b.handle_message(&msg);
        let events = b.poll(&no_status());
        assert!(events.contains(&Event::Disconnected));
    }

    #[test]
    fn peer_connect_status_merges_monotonically() {
        let mut a = endpoint(1);
        let mut b = endpoint(2);
        handshake(&mut a, &mut b);

        let mut status = no_status();
        status[0].last_frame = Frame::new(12);
        a.send_input(
            &BTreeMap::from([(
                PlayerHandle::new(1),
                PlayerInput::new(Frame::new(0), TestInput { inp: 0 }),
            )]),
            &status,
        );
        let _ = pump(&mut a, &mut b);
        assert_eq!(b.peer_connect_status(0).last_frame, Frame::new(12));

        // a stale lower frame cannot move the merged view backwards
        let msg = Message {
            header: MessageHeader { sequence: 9999 },
            body: MessageBody::Input(Input {
                peer_connect_status: {
                    let mut status = no_status();
                    status[0].last_frame = Frame::new(4);
                    status
                },
                disconnect_requested: false,
                start_frame: Frame::NULL,
                ack_frame: Frame::NULL,
                inputs: Vec::new(),
            }),
        };
        b.handle_message(&msg);
        assert_eq!(b.peer_connect_status(0).last_frame, Frame::new(12));
    }
}
