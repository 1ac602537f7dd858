//! uTP Connection
//!
//! One peer association: handshake, ordered delivery through the local
//! window, congestion-controlled transmission through the remote window and
//! the FIN teardown. All state sits behind a single mutex; blocking callers
//! park on condition variables and re-check their predicate on every wakeup.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use parking_lot::{Condvar, Mutex};

use super::congestion::{LedbatController, RttEstimator};
use super::context::UtpContext;
use super::local_window::LocalWindow;
use super::packet::{decode_packet, encode_packet, seq_less_than, Header, PacketType};
use super::remote_window::{AckOutcome, RemoteWindow};
use super::state::{ConnectionState, ConnectionStats, ConnectionType};
use crate::error::{Result, UtpError};

/// Pending condition variable notifications
#[derive(Debug, Default)]
struct Wakeups {
    connected: bool,
    data_ready: bool,
}

/// Mutable connection state, guarded by `Connection::inner`
#[derive(Debug)]
struct ConnectionInner {
    conn_type: ConnectionType,

    /// Connection ID for receiving (we expect this)
    recv_connection_id: u16,

    /// Connection ID for sending (remote expects this)
    send_connection_id: u16,

    remote: SocketAddr,

    state: ConnectionState,

    /// Last sequence number we assigned
    seq_nr: u16,

    /// Sequence number of the peer's SYN (incoming only)
    peer_syn_seq_nr: Option<u16>,

    /// Sequence number of the peer's FIN
    eof_seq_nr: Option<u16>,

    /// Sequence number of our FIN once sent
    fin_seq_nr: Option<u16>,

    /// close() was called; our FIN goes out once the output buffer is empty
    fin_pending: bool,

    /// Receive window in the last packet we sent
    advertised_window: u32,

    /// Our latest one-way delay measurement, echoed to the peer
    reply_micro: u32,

    /// Origin of our wire timestamps
    epoch: Instant,

    rtt: RttEstimator,

    ledbat: LedbatController,

    /// Payload bytes per DATA packet
    packet_size: u32,

    /// Application bytes not yet packetized
    output_buffer: BytesMut,

    local_wnd: LocalWindow,

    remote_wnd: RemoteWindow,

    /// Last time the peer was heard from or the in-flight set became non-empty
    last_activity: Instant,

    syn_retries: u32,

    /// The handshake completed at some point
    established: bool,

    stats: ConnectionStats,

    context: UtpContext,

    wake: Wakeups,
}

impl ConnectionInner {
    fn new(
        recv_connection_id: u16,
        conn_type: ConnectionType,
        remote: SocketAddr,
        context: UtpContext,
        now: Instant,
    ) -> Self {
        let config = context.config();
        let rtt = RttEstimator::new(config);
        let ledbat = LedbatController::new(config);
        let packet_size = config.initial_packet_size;
        let advertised_window = config.recv_window;
        let local_wnd = LocalWindow::new(config.recv_window);
        let remote_wnd = RemoteWindow::new(config);

        Self {
            conn_type,
            recv_connection_id,
            send_connection_id: conn_type.send_connection_id(recv_connection_id),
            remote,
            state: conn_type.initial_state(),
            seq_nr: 1,
            peer_syn_seq_nr: None,
            eof_seq_nr: None,
            fin_seq_nr: None,
            fin_pending: false,
            advertised_window,
            reply_micro: 0,
            epoch: now,
            rtt,
            ledbat,
            packet_size,
            output_buffer: BytesMut::new(),
            local_wnd,
            remote_wnd,
            last_activity: now,
            syn_retries: 0,
            established: false,
            stats: ConnectionStats::new(),
            context,
            wake: Wakeups::default(),
        }
    }

    /// The peer will send nothing more we could read
    fn no_more_input(&self) -> bool {
        self.state == ConnectionState::Closed || self.input_finished()
    }

    fn timestamp_us(&self, now: Instant) -> u32 {
        (now.saturating_duration_since(self.epoch).as_micros() & 0xFFFF_FFFF) as u32
    }

    fn header(&self, packet_type: PacketType, seq_nr: u16, now: Instant) -> Header {
        let conn_id = if packet_type == PacketType::Syn {
            self.recv_connection_id
        } else {
            self.send_connection_id
        };

        Header::new(packet_type, conn_id, seq_nr, self.local_wnd.last_seq_nr())
            .with_timestamps(self.timestamp_us(now), self.reply_micro)
            .with_window(self.local_wnd.available_space())
    }

    /// Encode and hand a packet to the sink
    fn transmit(&mut self, header: Header, payload: &[u8]) -> bool {
        let sack = if self.context.config().enable_sack && header.packet_type != PacketType::Syn {
            self.local_wnd.selective_ack()
        } else {
            None
        };

        let raw = encode_packet(&header, sack.as_ref(), payload);
        self.advertised_window = header.wnd_size;
        if self.context.sink().send_to(&raw, self.remote) {
            self.stats.record_sent(payload.len() as u64);
            true
        } else {
            self.stats.send_failures += 1;
            tracing::warn!(
                "uTP {}: failed to send {} (seq {}) to {}",
                self.recv_connection_id,
                header.packet_type,
                header.seq_nr,
                self.remote
            );
            false
        }
    }

    fn send_syn(&mut self, now: Instant) -> bool {
        let header = self.header(PacketType::Syn, self.seq_nr, now);
        self.transmit(header, &[])
    }

    fn send_state(&mut self, now: Instant) -> bool {
        let header = self.header(PacketType::State, self.seq_nr, now);
        self.transmit(header, &[])
    }

    /// Packetize the output buffer while the remote window has room
    fn send_packets(&mut self, now: Instant) {
        while !self.output_buffer.is_empty() {
            let space = self.remote_wnd.available_space() as usize;
            if space == 0 {
                break;
            }

            let len = self
                .output_buffer
                .len()
                .min(space)
                .min(self.packet_size as usize);
            let chunk = self.output_buffer.split_to(len).freeze();
            if !self.track_and_send(PacketType::Data, chunk, now) {
                // Left in flight; the timeout path resends it
                break;
            }
        }
    }

    /// Assign the next sequence number, send, and record the packet as in flight
    fn track_and_send(&mut self, packet_type: PacketType, payload: Bytes, now: Instant) -> bool {
        self.seq_nr = self.seq_nr.wrapping_add(1);
        let seq_nr = self.seq_nr;

        let header = self.header(packet_type, seq_nr, now);
        let sent = self.transmit(header, &payload);

        if self.remote_wnd.all_packets_acked() {
            self.last_activity = now;
        }
        self.remote_wnd.add_packet(payload, seq_nr, now);
        sent
    }

    /// Piggyback the ack on data when possible
    fn send_state_or_data(&mut self, now: Instant) {
        if !self.output_buffer.is_empty() && self.remote_wnd.available_space() > 0 {
            self.send_packets(now);
        } else {
            self.send_state(now);
        }
    }

    /// Local close has started
    fn closing(&self) -> bool {
        self.fin_pending || self.fin_seq_nr.is_some()
    }

    /// Everything up to the peer's FIN has been received
    fn input_finished(&self) -> bool {
        self.eof_seq_nr == Some(self.local_wnd.last_seq_nr())
    }

    /// Let the peer's FIN consume its seq once the data before it is complete
    fn consume_fin(&mut self) {
        if let Some(eof) = self.eof_seq_nr {
            if self.local_wnd.advance_past(eof) {
                self.wake.data_ready = true;
            }
        }
    }

    fn receive_data(&mut self, seq_nr: u16, payload: &[u8], now: Instant) {
        if self.local_wnd.packet_received(seq_nr, payload) > 0 {
            self.wake.data_ready = true;
        }
        self.consume_fin();
        if self.remote_wnd.take_fast_retransmit() {
            self.retransmit_oldest(now);
        }
        self.send_state_or_data(now);
        self.flush_fin(now);
    }

    fn receive_fin(&mut self, seq_nr: u16, now: Instant) {
        self.eof_seq_nr = Some(seq_nr);
        self.consume_fin();
        self.state = ConnectionState::Finished;
        self.wake.data_ready = true;
        self.send_state(now);
        tracing::debug!(
            "uTP {}: peer finished at seq {}",
            self.recv_connection_id,
            seq_nr
        );
    }

    /// Close once both directions are done
    ///
    /// The peer's FIN and everything before it must have arrived and all we
    /// sent must be acked. Without a local close the reader must also have
    /// drained the local window.
    fn try_finish(&mut self) {
        let output_done = self.remote_wnd.all_packets_acked()
            && self.output_buffer.is_empty()
            && !self.fin_pending;
        let drained = self.fin_seq_nr.is_some() || self.local_wnd.is_empty();
        if output_done && self.input_finished() && drained {
            self.transition_closed("finished");
        }
    }

    /// Send our FIN once all buffered output has been packetized
    fn flush_fin(&mut self, now: Instant) {
        if self.fin_pending && self.output_buffer.is_empty() {
            self.fin_pending = false;
            self.track_and_send(PacketType::Fin, Bytes::new(), now);
            self.fin_seq_nr = Some(self.seq_nr);
        }
    }

    fn retransmit_oldest(&mut self, now: Instant) {
        let Some(pkt) = self.remote_wnd.oldest_unacked() else {
            return;
        };
        let (seq_nr, payload) = (pkt.seq_nr, pkt.payload.clone());

        let packet_type = if self.fin_seq_nr == Some(seq_nr) {
            PacketType::Fin
        } else {
            PacketType::Data
        };

        tracing::debug!(
            "uTP {}: retransmitting seq {} ({} bytes)",
            self.recv_connection_id,
            seq_nr,
            payload.len()
        );
        let header = self.header(packet_type, seq_nr, now);
        self.transmit(header, &payload);
        self.remote_wnd.mark_retransmitted(seq_nr, now);
        self.stats.record_retransmit();
    }

    fn update_delay_measurement(&mut self, header: &Header, now: Instant) {
        self.reply_micro = self.timestamp_us(now).wrapping_sub(header.timestamp_us);
        self.ledbat.on_delay_sample(now, header.timestamp_diff_us);
    }

    fn apply_ack_outcome(&mut self, outcome: &AckOutcome) {
        for sample in &outcome.rtt_samples {
            self.rtt.update(*sample);
        }

        if outcome.duplicate_ack {
            self.stats.record_duplicate_ack();
        }

        // Recover the MTU estimate after a timeout
        let initial = self.context.config().initial_packet_size;
        if outcome.bytes_acked > 0 && self.packet_size < initial {
            self.packet_size = (self.packet_size * 2).min(initial);
        }

        let gain = self.ledbat.gain(self.remote_wnd.window_usage_factor());
        self.remote_wnd.update_window_size(gain);
    }

    /// Spend freed window on fast retransmits and buffered output
    fn after_acks(&mut self, now: Instant) {
        if self.remote_wnd.take_fast_retransmit() {
            self.retransmit_oldest(now);
        }
        self.send_packets(now);
        self.flush_fin(now);
    }

    fn establish(&mut self, peer_seq_nr: u16) {
        self.local_wnd.set_last_seq_nr(peer_seq_nr);
        self.state = ConnectionState::Connected;
        self.established = true;
        self.wake.connected = true;
        tracing::info!(
            "uTP {}|{}: established connection with {}",
            self.recv_connection_id,
            self.send_connection_id,
            self.remote
        );
    }

    fn transition_closed(&mut self, reason: &str) {
        if self.state != ConnectionState::Closed {
            tracing::debug!(
                "uTP {}: {} -> CLOSED ({})",
                self.recv_connection_id,
                self.state,
                reason
            );
        }
        self.state = ConnectionState::Closed;
        self.wake.connected = true;
        self.wake.data_ready = true;
    }

    fn handle_packet(&mut self, raw: &[u8], now: Instant) -> ConnectionState {
        if self.state == ConnectionState::Closed {
            return self.state;
        }

        let parsed = match decode_packet(raw) {
            Ok(parsed) => parsed,
            Err(e) => {
                self.stats.malformed_packets += 1;
                tracing::debug!("uTP {}: dropping packet: {}", self.recv_connection_id, e);
                return self.state;
            }
        };
        let header = parsed.header;
        let payload = parsed.payload(raw);

        tracing::trace!(
            "uTP {}: {} conn_id={} seq={} ack={} wnd={} ts={} ts_diff={} len={}",
            self.recv_connection_id,
            header.packet_type,
            header.connection_id,
            header.seq_nr,
            header.ack_nr,
            header.wnd_size,
            header.timestamp_us,
            header.timestamp_diff_us,
            payload.len()
        );

        self.stats.record_received(payload.len() as u64);
        self.last_activity = now;
        self.update_delay_measurement(&header, now);
        let outcome = self
            .remote_wnd
            .packet_received(&header, parsed.selective_ack.as_ref(), now);
        self.apply_ack_outcome(&outcome);

        match self.state {
            ConnectionState::SynSent => {
                if header.packet_type == PacketType::State {
                    self.establish(header.seq_nr);
                } else {
                    self.transition_closed("handshake rejected");
                }
            }

            ConnectionState::Idle => {
                if header.packet_type == PacketType::Syn {
                    self.peer_syn_seq_nr = Some(header.seq_nr);
                    self.establish(header.seq_nr);
                    self.send_state(now);
                } else {
                    self.transition_closed("expected SYN");
                }
            }

            ConnectionState::Connected => match header.packet_type {
                PacketType::Data => self.receive_data(header.seq_nr, payload, now),
                PacketType::State => self.after_acks(now),
                PacketType::Fin => self.receive_fin(header.seq_nr, now),
                PacketType::Syn if self.peer_syn_seq_nr == Some(header.seq_nr) => {
                    // Our STATE reply was lost
                    self.send_state(now);
                }
                other => self.transition_closed(&format!("unexpected {}", other)),
            },

            // Entered by the peer's FIN, our close() or both
            ConnectionState::Finished => match header.packet_type {
                PacketType::State => {
                    self.after_acks(now);
                    self.try_finish();
                }
                // Data still owed to us: sent before the peer's FIN, or the
                // peer has not finished yet
                PacketType::Data
                    if self
                        .eof_seq_nr
                        .map_or(true, |eof| seq_less_than(header.seq_nr, eof)) =>
                {
                    self.receive_data(header.seq_nr, payload, now);
                    if self.closing() {
                        self.try_finish();
                    }
                }
                PacketType::Fin if self.eof_seq_nr.is_none() => {
                    self.receive_fin(header.seq_nr, now);
                    self.try_finish();
                }
                PacketType::Fin if self.eof_seq_nr == Some(header.seq_nr) => {
                    // Peer resent its FIN; our ack was lost
                    self.send_state(now);
                }
                other => self.transition_closed(&format!("{} after FIN", other)),
            },

            ConnectionState::Closed => {}
        }

        self.state
    }

    fn check_timeout(&mut self, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.last_activity);
        let timeout = self.rtt.timeout();

        match self.state {
            ConnectionState::SynSent => {
                if elapsed <= timeout {
                    return false;
                }
                self.stats.record_timeout();
                self.syn_retries += 1;
                if self.syn_retries > self.context.config().max_syn_retries {
                    self.transition_closed("no reply to SYN");
                } else {
                    tracing::debug!(
                        "uTP {}: resending SYN (attempt {})",
                        self.recv_connection_id,
                        self.syn_retries
                    );
                    self.send_syn(now);
                }
                self.last_activity = now;
                true
            }

            ConnectionState::Connected | ConnectionState::Finished => {
                if self.remote_wnd.all_packets_acked() {
                    return self.push_through_closed_window(elapsed > timeout, now);
                }
                if elapsed <= timeout {
                    return false;
                }
                self.stats.record_timeout();
                self.remote_wnd.timeout();
                self.packet_size = self.context.config().min_packet_size;
                tracing::debug!(
                    "uTP {}: timeout after {:?}, window now {} bytes",
                    self.recv_connection_id,
                    elapsed,
                    self.remote_wnd.window_size()
                );
                self.retransmit_oldest(now);
                self.last_activity = now;
                true
            }

            ConnectionState::Idle | ConnectionState::Closed => false,
        }
    }

    /// Nothing is in flight to draw the ack that would reopen a closed peer
    /// window, so push one packet through it
    fn push_through_closed_window(&mut self, expired: bool, now: Instant) -> bool {
        if !expired || self.output_buffer.is_empty() || self.remote_wnd.available_space() > 0 {
            return false;
        }

        tracing::debug!(
            "uTP {}: peer window closed, sending {} bytes through it",
            self.recv_connection_id,
            self.packet_size
        );
        self.remote_wnd.open_peer_window(self.packet_size);
        self.send_packets(now);
        self.last_activity = now;
        true
    }

    fn send(&mut self, data: &[u8], now: Instant) -> Result<usize> {
        if !self.state.can_send_data() {
            return Err(UtpError::NotConnected { state: self.state });
        }

        let capacity = self.context.config().send_buffer_size;
        let accepted = data.len().min(capacity.saturating_sub(self.output_buffer.len()));
        self.output_buffer.extend_from_slice(&data[..accepted]);
        self.send_packets(now);
        Ok(accepted)
    }

    fn recv(&mut self, max_len: usize, now: Instant) -> Result<Bytes> {
        if self.local_wnd.fill() > 0 {
            let data = self.local_wnd.read(max_len);
            self.send_window_update(now);
            return Ok(data);
        }

        match self.state {
            ConnectionState::SynSent | ConnectionState::Idle => {
                Err(UtpError::NotConnected { state: self.state })
            }
            ConnectionState::Closed => Err(UtpError::ConnectionClosed),
            _ => Ok(Bytes::new()),
        }
    }

    /// Tell the peer about space a read freed when our last advertisement
    /// could not fit a full packet
    fn send_window_update(&mut self, now: Instant) {
        if !matches!(self.state, ConnectionState::Connected | ConnectionState::Finished)
            || self.input_finished()
        {
            return;
        }

        let config = self.context.config();
        let threshold = config.initial_packet_size.min(config.recv_window);
        if self.advertised_window < threshold && self.local_wnd.available_space() >= threshold {
            tracing::trace!(
                "uTP {}: window update {} -> {}",
                self.recv_connection_id,
                self.advertised_window,
                self.local_wnd.available_space()
            );
            self.send_state(now);
        }
    }

    fn close(&mut self, now: Instant) {
        match self.state {
            ConnectionState::Connected => {
                self.fin_pending = true;
                self.state = ConnectionState::Finished;
                self.wake.data_ready = true;
                self.send_packets(now);
                self.flush_fin(now);
                tracing::debug!("uTP {}: closing, FIN queued", self.recv_connection_id);
            }
            // A second close() abandons the FIN handshake
            ConnectionState::Finished if self.closing() => {
                self.transition_closed("closed locally");
            }
            ConnectionState::Finished => {
                // The peer finished first; our FIN still follows our output
                self.fin_pending = true;
                self.send_packets(now);
                self.flush_fin(now);
                tracing::debug!("uTP {}: closing after peer FIN", self.recv_connection_id);
            }
            ConnectionState::SynSent | ConnectionState::Idle => {
                self.transition_closed("closed before handshake");
            }
            ConnectionState::Closed => {}
        }
    }
}

/// A single uTP connection
///
/// Shared between the thread delivering datagrams and the threads using the
/// stream API; wrap it in an `Arc` to share it.
#[derive(Debug)]
pub struct Connection {
    inner: Mutex<ConnectionInner>,
    connected: Condvar,
    data_ready: Condvar,
}

impl Connection {
    /// Create a connection; an outgoing one sends its SYN immediately
    pub fn new(
        recv_connection_id: u16,
        conn_type: ConnectionType,
        remote: SocketAddr,
        context: UtpContext,
    ) -> Self {
        let now = Instant::now();
        let mut inner = ConnectionInner::new(recv_connection_id, conn_type, remote, context, now);

        tracing::debug!(
            "uTP: connection {}|{} ({:?}) with {}",
            inner.recv_connection_id,
            inner.send_connection_id,
            conn_type,
            remote
        );

        if conn_type == ConnectionType::Outgoing {
            // A failed SYN is retried by check_timeout
            inner.send_syn(now);
        }

        Self {
            inner: Mutex::new(inner),
            connected: Condvar::new(),
            data_ready: Condvar::new(),
        }
    }

    /// Initiate a connection to `remote`
    pub fn outgoing(recv_connection_id: u16, remote: SocketAddr, context: UtpContext) -> Self {
        Self::new(recv_connection_id, ConnectionType::Outgoing, remote, context)
    }

    /// Wait for a SYN from `remote`
    pub fn incoming(recv_connection_id: u16, remote: SocketAddr, context: UtpContext) -> Self {
        Self::new(recv_connection_id, ConnectionType::Incoming, remote, context)
    }

    fn notify(&self, inner: &mut ConnectionInner) {
        if std::mem::take(&mut inner.wake.connected) {
            self.connected.notify_all();
        }
        if std::mem::take(&mut inner.wake.data_ready) {
            self.data_ready.notify_all();
        }
    }

    /// Process one inbound datagram addressed to this connection
    pub fn handle_packet(&self, raw: &[u8]) -> ConnectionState {
        self.handle_packet_at(raw, Instant::now())
    }

    pub fn handle_packet_at(&self, raw: &[u8], now: Instant) -> ConnectionState {
        let mut inner = self.inner.lock();
        let state = inner.handle_packet(raw, now);
        self.notify(&mut inner);
        state
    }

    /// Queue bytes for transmission; returns how many were accepted
    pub fn send(&self, data: &[u8]) -> Result<usize> {
        self.send_at(data, Instant::now())
    }

    pub fn send_at(&self, data: &[u8], now: Instant) -> Result<usize> {
        let mut inner = self.inner.lock();
        let result = inner.send(data, now);
        self.notify(&mut inner);
        result
    }

    /// Read up to `max_len` in-order bytes without blocking
    pub fn recv(&self, max_len: usize) -> Result<Bytes> {
        self.inner.lock().recv(max_len, Instant::now())
    }

    pub fn bytes_available(&self) -> usize {
        self.inner.lock().local_wnd.fill()
    }

    /// Block until the handshake completes or fails
    pub fn wait_until_connected(&self) -> bool {
        let mut inner = self.inner.lock();
        while inner.state.is_handshaking() {
            self.connected.wait(&mut inner);
        }
        inner.established && inner.state != ConnectionState::Closed
    }

    /// Like `wait_until_connected`, giving up after `timeout`
    pub fn wait_until_connected_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        while inner.state.is_handshaking() {
            if self.connected.wait_until(&mut inner, deadline).timed_out() {
                break;
            }
        }
        inner.established && inner.state != ConnectionState::Closed
    }

    /// Block until bytes are readable or no more can arrive
    ///
    /// Returns whether data is available.
    pub fn wait_for_data(&self) -> bool {
        let mut inner = self.inner.lock();
        while inner.local_wnd.fill() == 0 && !inner.no_more_input() {
            self.data_ready.wait(&mut inner);
        }
        inner.local_wnd.fill() > 0
    }

    /// Like `wait_for_data`, giving up after `timeout`
    pub fn wait_for_data_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        while inner.local_wnd.fill() == 0 && !inner.no_more_input() {
            if self.data_ready.wait_until(&mut inner, deadline).timed_out() {
                break;
            }
        }
        inner.local_wnd.fill() > 0
    }

    /// Start the FIN handshake (or abandon a pending one)
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.close(Instant::now());
        self.notify(&mut inner);
    }

    /// Drive loss detection; returns whether a timeout fired
    pub fn check_timeout(&self) -> bool {
        self.check_timeout_at(Instant::now())
    }

    pub fn check_timeout_at(&self, now: Instant) -> bool {
        let mut inner = self.inner.lock();
        let fired = inner.check_timeout(now);
        self.notify(&mut inner);
        fired
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    pub fn connection_type(&self) -> ConnectionType {
        self.inner.lock().conn_type
    }

    pub fn recv_connection_id(&self) -> u16 {
        self.inner.lock().recv_connection_id
    }

    pub fn send_connection_id(&self) -> u16 {
        self.inner.lock().send_connection_id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.inner.lock().remote
    }

    pub fn stats(&self) -> ConnectionStats {
        self.inner.lock().stats.clone()
    }

    pub fn rtt(&self) -> Duration {
        self.inner.lock().rtt.rtt()
    }

    /// Current retransmission timeout
    pub fn timeout(&self) -> Duration {
        self.inner.lock().rtt.timeout()
    }

    pub fn packet_size(&self) -> u32 {
        self.inner.lock().packet_size
    }

    /// Congestion window in bytes
    pub fn congestion_window(&self) -> u32 {
        self.inner.lock().remote_wnd.window_size()
    }

    pub fn bytes_in_flight(&self) -> usize {
        self.inner.lock().remote_wnd.bytes_in_flight()
    }

    /// Bytes accepted by `send` but not yet packetized
    pub fn pending_output(&self) -> usize {
        self.inner.lock().output_buffer.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UtpConfig;
    use crate::utp::context::PacketSink;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[derive(Default)]
    struct RecordingSink {
        sent: parking_lot::Mutex<Vec<Vec<u8>>>,
        fail: AtomicBool,
    }

    impl PacketSink for RecordingSink {
        fn send_to(&self, data: &[u8], _addr: SocketAddr) -> bool {
            if self.fail.load(Ordering::SeqCst) {
                return false;
            }
            self.sent.lock().push(data.to_vec());
            true
        }
    }

    impl RecordingSink {
        fn take(&self) -> Vec<Vec<u8>> {
            std::mem::take(&mut *self.sent.lock())
        }
    }

    fn peer() -> SocketAddr {
        "127.0.0.1:6881".parse().unwrap()
    }

    fn setup(conn_type: ConnectionType, recv_id: u16) -> (Connection, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        let context = UtpContext::new(UtpConfig::default(), sink.clone());
        (Connection::new(recv_id, conn_type, peer(), context), sink)
    }

    fn packet(packet_type: PacketType, conn_id: u16, seq: u16, ack: u16, payload: &[u8]) -> Vec<u8> {
        let header = Header::new(packet_type, conn_id, seq, ack)
            .with_timestamps(1_000, 0)
            .with_window(1024 * 1024);
        encode_packet(&header, None, payload).to_vec()
    }

    fn connected_outgoing() -> (Connection, Arc<RecordingSink>) {
        let (conn, sink) = setup(ConnectionType::Outgoing, 100);
        let state = conn.handle_packet(&packet(PacketType::State, 100, 1, 1, &[]));
        assert_eq!(state, ConnectionState::Connected);
        sink.take();
        (conn, sink)
    }

    #[test]
    fn test_outgoing_sends_syn_first() {
        let (conn, sink) = setup(ConnectionType::Outgoing, 100);
        assert_eq!(conn.state(), ConnectionState::SynSent);
        assert_eq!(conn.send_connection_id(), 101);

        let sent = sink.take();
        assert_eq!(sent.len(), 1);
        let syn = decode_packet(&sent[0]).unwrap().header;
        assert_eq!(syn.packet_type, PacketType::Syn);
        assert_eq!(syn.connection_id, 100);
        assert_eq!(syn.seq_nr, 1);
    }

    #[test]
    fn test_incoming_waits_for_syn() {
        let (conn, sink) = setup(ConnectionType::Incoming, 101);
        assert_eq!(conn.state(), ConnectionState::Idle);
        assert_eq!(conn.send_connection_id(), 100);
        assert!(sink.take().is_empty());

        let state = conn.handle_packet(&packet(PacketType::Syn, 100, 1, 0, &[]));
        assert_eq!(state, ConnectionState::Connected);

        let reply = decode_packet(&sink.take()[0]).unwrap().header;
        assert_eq!(reply.packet_type, PacketType::State);
        assert_eq!(reply.connection_id, 100);
        assert_eq!(reply.ack_nr, 1);
    }

    #[test]
    fn test_syn_sent_rejects_other_packets() {
        let (conn, _sink) = setup(ConnectionType::Outgoing, 100);
        let state = conn.handle_packet(&packet(PacketType::Reset, 100, 1, 1, &[]));
        assert_eq!(state, ConnectionState::Closed);
        assert!(!conn.wait_until_connected());
        assert!(!conn.wait_for_data());
    }

    #[test]
    fn test_idle_rejects_non_syn() {
        let (conn, _sink) = setup(ConnectionType::Incoming, 101);
        let state = conn.handle_packet(&packet(PacketType::Data, 100, 2, 0, b"x"));
        assert_eq!(state, ConnectionState::Closed);
    }

    #[test]
    fn test_send_requires_connection() {
        let (conn, _sink) = setup(ConnectionType::Outgoing, 100);
        let err = conn.send(b"early").unwrap_err();
        assert!(matches!(err, UtpError::NotConnected { state: ConnectionState::SynSent }));
        assert!(matches!(conn.recv(10), Err(UtpError::NotConnected { .. })));
    }

    #[test]
    fn test_malformed_packet_keeps_state() {
        let (conn, _sink) = connected_outgoing();
        assert_eq!(conn.handle_packet(&[0x21, 0, 0]), ConnectionState::Connected);
        assert_eq!(conn.stats().malformed_packets, 1);
    }

    #[test]
    fn test_send_emits_data_packet() {
        let (conn, sink) = connected_outgoing();
        assert_eq!(conn.send(b"hello").unwrap(), 5);

        let sent = sink.take();
        assert_eq!(sent.len(), 1);
        let parsed = decode_packet(&sent[0]).unwrap();
        assert_eq!(parsed.header.packet_type, PacketType::Data);
        assert_eq!(parsed.header.connection_id, 101);
        assert_eq!(parsed.header.seq_nr, 2);
        assert_eq!(parsed.header.ack_nr, 1);
        assert_eq!(parsed.payload(&sent[0]), b"hello");
        assert_eq!(conn.bytes_in_flight(), 5);
    }

    #[test]
    fn test_send_respects_window_and_packet_size() {
        let (conn, sink) = connected_outgoing();
        let data = vec![7u8; 5000];
        assert_eq!(conn.send(&data).unwrap(), 5000);

        // Initial window is 3000 bytes: 1400 + 1400 + 200
        let sizes: Vec<usize> = sink
            .take()
            .iter()
            .map(|raw| {
                let parsed = decode_packet(raw).unwrap();
                parsed.payload(raw).len()
            })
            .collect();
        assert_eq!(sizes, vec![1400, 1400, 200]);
        assert_eq!(conn.pending_output(), 2000);

        // Ack everything: the rest flows out
        conn.handle_packet(&packet(PacketType::State, 100, 1, 4, &[]));
        let sent = sink.take();
        assert!(!sent.is_empty());
        assert!(conn.pending_output() < 2000);
    }

    #[test]
    fn test_sink_failure_keeps_packet_in_flight() {
        let (conn, sink) = connected_outgoing();
        sink.fail.store(true, Ordering::SeqCst);

        assert_eq!(conn.send(&[1u8; 3000]).unwrap(), 3000);
        // First packet failed, draining stopped
        assert_eq!(conn.bytes_in_flight(), 1400);
        assert_eq!(conn.pending_output(), 1600);
        assert_eq!(conn.stats().send_failures, 1);

        sink.fail.store(false, Ordering::SeqCst);
        let t = Instant::now() + Duration::from_secs(2);
        assert!(conn.check_timeout_at(t));
        let resent = sink.take();
        assert_eq!(resent.len(), 1);
        assert_eq!(decode_packet(&resent[0]).unwrap().header.seq_nr, 2);
    }

    #[test]
    fn test_timeout_backoff() {
        let (conn, sink) = connected_outgoing();
        let t0 = Instant::now();
        conn.send_at(b"hello", t0).unwrap();
        sink.take();
        let window = conn.congestion_window();

        assert!(!conn.check_timeout_at(t0 + Duration::from_millis(100)));
        assert!(conn.check_timeout_at(t0 + Duration::from_millis(1500)));
        assert_eq!(conn.packet_size(), 150);
        assert_eq!(conn.congestion_window(), window / 2);

        let resent = sink.take();
        assert_eq!(resent.len(), 1);
        let parsed = decode_packet(&resent[0]).unwrap();
        assert_eq!(parsed.header.seq_nr, 2);
        assert_eq!(parsed.payload(&resent[0]), b"hello");

        // One backoff per timeout event
        assert!(!conn.check_timeout_at(t0 + Duration::from_millis(1600)));
        assert_eq!(conn.stats().timeouts, 1);
        assert_eq!(conn.stats().retransmits, 1);
    }

    #[test]
    fn test_idle_connection_never_times_out() {
        let (conn, sink) = connected_outgoing();
        assert!(!conn.check_timeout_at(Instant::now() + Duration::from_secs(60)));
        assert!(sink.take().is_empty());
        assert_eq!(conn.packet_size(), 1400);
    }

    #[test]
    fn test_syn_retries_then_gives_up() {
        let (conn, sink) = setup(ConnectionType::Outgoing, 100);
        sink.take();

        let mut t = Instant::now();
        for attempt in 1..=5 {
            t += Duration::from_millis(1100);
            assert!(conn.check_timeout_at(t));
            assert_eq!(conn.state(), ConnectionState::SynSent, "attempt {}", attempt);
        }
        assert_eq!(sink.take().len(), 5);

        t += Duration::from_millis(1100);
        assert!(conn.check_timeout_at(t));
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(!conn.wait_until_connected());
    }

    #[test]
    fn test_packet_size_recovers_after_ack() {
        let (conn, _sink) = connected_outgoing();
        let t0 = Instant::now();
        conn.send_at(b"abc", t0).unwrap();
        conn.check_timeout_at(t0 + Duration::from_secs(2));
        assert_eq!(conn.packet_size(), 150);

        conn.handle_packet(&packet(PacketType::State, 100, 1, 2, &[]));
        assert_eq!(conn.packet_size(), 300);
    }

    #[test]
    fn test_duplicate_syn_is_reacknowledged() {
        let (conn, sink) = setup(ConnectionType::Incoming, 101);
        let syn = packet(PacketType::Syn, 100, 1, 0, &[]);
        conn.handle_packet(&syn);
        sink.take();

        assert_eq!(conn.handle_packet(&syn), ConnectionState::Connected);
        let reply = decode_packet(&sink.take()[0]).unwrap().header;
        assert_eq!(reply.packet_type, PacketType::State);
    }

    #[test]
    fn test_close_before_handshake() {
        let (conn, sink) = setup(ConnectionType::Outgoing, 100);
        sink.take();
        conn.close();
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(sink.take().is_empty());
        assert!(matches!(conn.recv(1), Err(UtpError::ConnectionClosed)));
    }

    #[test]
    fn test_close_sends_fin_after_buffered_data() {
        let (conn, sink) = connected_outgoing();
        conn.send(&[9u8; 4000]).unwrap();
        sink.take();
        conn.close();
        assert_eq!(conn.state(), ConnectionState::Finished);
        // Window full: FIN waits behind the unsent 1000 bytes
        assert!(sink.take().is_empty());

        conn.handle_packet(&packet(PacketType::State, 100, 1, 4, &[]));
        let types: Vec<PacketType> = sink
            .take()
            .iter()
            .map(|raw| decode_packet(raw).unwrap().header.packet_type)
            .collect();
        assert_eq!(types.last(), Some(&PacketType::Fin));
        assert!(types[..types.len() - 1].iter().all(|t| *t == PacketType::Data));
    }

    #[test]
    fn test_wait_until_connected_wakes_waiter() {
        let (conn, _sink) = setup(ConnectionType::Outgoing, 100);
        let conn = Arc::new(conn);

        let waiter = {
            let conn = conn.clone();
            std::thread::spawn(move || conn.wait_until_connected())
        };

        std::thread::sleep(Duration::from_millis(20));
        conn.handle_packet(&packet(PacketType::State, 100, 1, 1, &[]));
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn test_reset_after_establishment_is_not_connected() {
        let (conn, _sink) = connected_outgoing();
        conn.handle_packet(&packet(PacketType::Reset, 100, 1, 1, &[]));
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(!conn.wait_until_connected());
        assert!(!conn.wait_until_connected_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn test_second_close_abandons_fin() {
        let (conn, sink) = connected_outgoing();
        conn.close();
        assert_eq!(conn.state(), ConnectionState::Finished);
        sink.take();

        conn.close();
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(sink.take().is_empty());
    }

    #[test]
    fn test_wait_timeouts_expire() {
        let (conn, _sink) = setup(ConnectionType::Outgoing, 100);
        assert!(!conn.wait_until_connected_timeout(Duration::from_millis(20)));
        assert_eq!(conn.state(), ConnectionState::SynSent);

        let (conn, _sink) = connected_outgoing();
        assert!(!conn.wait_for_data_timeout(Duration::from_millis(20)));
    }
}
