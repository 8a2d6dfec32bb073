//! The per-connection state machine: send/receive windows, retransmission,
//! RTT estimation and flow-control window resizing. Grounded on the
//! teacher's `tcp/tcb.rs` (a single struct owning both windows and driving
//! itself through `on_segment`/`on_tick`), generalized from TCP's 10-state
//! RFC 9293 machine to the 7-state lifecycle this protocol uses.

use std::net::SocketAddr;

use crate::config;
use crate::err::Error;
use crate::packet::{self, Header, PacketType};
use crate::ring::Ring;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Uninitialized,
    SynSent,
    SynRecv,
    Connected,
    ConnectedFull,
    FinSent,
    Destroy,
}

/// One outbound packet awaiting acknowledgement. Stores the fully encoded
/// header+payload bytes, patching the ack_nr field in place before every
/// (re)transmission, mirroring `sendPacketWrap`'s `p->acknr = c->acknr`.
struct SendSlot {
    encoded: Vec<u8>,
    payload_len: usize,
    last_send_time: u64,
    transmissions: u32,
    need_resend: bool,
}

/// One out-of-order inbound payload, held until it becomes deliverable.
struct RecvSlot {
    payload: Vec<u8>,
}

/// Scatter/gather cursor over the caller's `write_vec` buffers.
struct ScatterCursor<'a> {
    bufs: &'a [&'a [u8]],
    buf_idx: usize,
    offset: usize,
}

impl<'a> ScatterCursor<'a> {
    fn new(bufs: &'a [&'a [u8]]) -> Self {
        ScatterCursor {
            bufs,
            buf_idx: 0,
            offset: 0,
        }
    }

    fn remaining(&self) -> usize {
        let mut total = 0;
        for (i, b) in self.bufs.iter().enumerate() {
            if i < self.buf_idx {
                continue;
            }
            total += if i == self.buf_idx {
                b.len() - self.offset
            } else {
                b.len()
            };
        }
        total
    }

    fn copy_into(&mut self, dst: &mut Vec<u8>, mut want: usize) {
        while want > 0 && self.buf_idx < self.bufs.len() {
            let buf = self.bufs[self.buf_idx];
            let avail = buf.len() - self.offset;
            if avail == 0 {
                self.buf_idx += 1;
                self.offset = 0;
                continue;
            }
            let take = want.min(avail);
            dst.extend_from_slice(&buf[self.offset..self.offset + take]);
            self.offset += take;
            want -= take;
            if self.offset == buf.len() {
                self.buf_idx += 1;
                self.offset = 0;
            }
        }
    }
}

/// Flags returned from `read_poll`. Several can be set at once (e.g. a
/// cumulative ACK can both drain the flight window below its cap and
/// deliver payload in the same call).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Events(u8);

impl Events {
    pub const CONTINUE: Events = Events(0);
    pub const AGAIN: Events = Events(1 << 0);
    pub const DATA: Events = Events(1 << 1);
    pub const ACCEPT: Events = Events(1 << 2);
    pub const CONNECTED: Events = Events(1 << 3);
    pub const POLLOUT: Events = Events(1 << 4);
    pub const ERROR: Events = Events(1 << 5);

    pub fn contains(self, flag: Events) -> bool {
        self.0 & flag.0 == flag.0
    }

    pub fn insert(&mut self, flag: Events) {
        self.0 |= flag.0;
    }
}

impl std::ops::BitOr for Events {
    type Output = Events;
    fn bitor(self, rhs: Events) -> Events {
        Events(self.0 | rhs.0)
    }
}

/// True iff `a` is strictly before `b` under signed 16-bit wrap distance.
fn seq_before(a: u16, b: u16) -> bool {
    (a.wrapping_sub(b) as i16) < 0
}

/// True iff `value` falls in `[start, end]` under wrap-aware sequence order.
fn seq_in_range(start: u16, value: u16, end: u16) -> bool {
    !seq_before(value, start) && !seq_before(end, value)
}

pub struct Connection {
    pub state: State,
    pub peer_addr: Option<SocketAddr>,

    id_seed: u16,
    recv_id: u16,
    send_id: u16,

    seq_nr: u16,
    ack_nr: u16,
    queue: u16,

    eof_seq_nr: u16,
    received_fin: bool,
    received_fin_completed: bool,
    need_send_ack: bool,

    rtt: u64,
    rtt_var: u64,
    next_rto: u64,
    rto: u64,
    rto_deadline: u64,

    flight_bytes: u32,
    flight_limit: u32,
    peer_recv_window: u32,
    self_recv_window: u32,
    oldest_resent: Option<u16>,

    out_of_order_cnt: u16,
    last_received_time: u64,
    last_sent_time: u64,

    send_ring: Ring<SendSlot>,
    recv_ring: Ring<RecvSlot>,

    pub user_data: Option<Box<dyn std::any::Any>>,
}

impl Connection {
    pub fn new(initial_seq_nr: u16) -> Self {
        Connection {
            state: State::Uninitialized,
            peer_addr: None,
            id_seed: 0,
            recv_id: 0,
            send_id: 0,
            seq_nr: initial_seq_nr,
            ack_nr: 0,
            queue: 0,
            eof_seq_nr: 0,
            received_fin: false,
            received_fin_completed: false,
            need_send_ack: false,
            rtt: 0,
            rtt_var: 0,
            next_rto: config::limited_retransmit_timeout(0),
            rto: 0,
            rto_deadline: 0,
            flight_bytes: 0,
            flight_limit: config::limited_window(0),
            peer_recv_window: config::limited_window(config::WINDOW_SIZE_MAX),
            self_recv_window: config::limited_window(config::WINDOW_SIZE_MAX),
            oldest_resent: None,
            out_of_order_cnt: 0,
            last_received_time: 0,
            last_sent_time: 0,
            send_ring: Ring::new(),
            recv_ring: Ring::new(),
            user_data: None,
        }
    }

    pub fn need_send_ack(&self) -> bool {
        self.need_send_ack
    }

    fn flight_full(&self) -> bool {
        self.flight_bytes + config::MSS as u32 > self.flight_limit.min(self.peer_recv_window)
    }

    fn transmit_slot(&mut self, seq: u16, now: u64, send: &mut dyn FnMut(&[u8])) {
        if let Some(slot) = self.send_ring.get_mut(seq) {
            let ack_bytes = self.ack_nr.to_be_bytes();
            slot.encoded[10] = ack_bytes[0];
            slot.encoded[11] = ack_bytes[1];
            slot.last_send_time = now;
            slot.transmissions += 1;
            slot.need_resend = false;
            let payload_len = slot.payload_len;
            self.flight_bytes += payload_len as u32;
            send(&slot.encoded);
            self.last_sent_time = now;
        }
    }

    /// Build one or more send slots covering `payload` bytes pulled from
    /// `cursor`, piggybacking onto the most recently queued, not-yet-sent
    /// slot when it has room (step 4 of the send path). Runs at least once,
    /// even for a zero-length FIN.
    fn build_send_packets(&mut self, mut payload: usize, ptype: PacketType, cursor: &mut ScatterCursor) {
        loop {
            let prev_seq = self.seq_nr.wrapping_sub(1);
            let can_coalesce = payload > 0
                && self.queue > 0
                && matches!(
                    self.send_ring.get(prev_seq),
                    Some(slot) if slot.transmissions == 0 && slot.payload_len < config::MSS
                );

            let round_payload;
            if can_coalesce {
                let slot = self.send_ring.get_mut(prev_seq).unwrap();
                let room = config::MSS - slot.payload_len;
                round_payload = payload.min(room);
                cursor.copy_into(&mut slot.encoded, round_payload);
                slot.payload_len += round_payload;
            } else {
                round_payload = payload;
                let mut encoded = Vec::with_capacity(packet::HEADER_SIZE + round_payload);
                packet::encode(
                    &mut encoded,
                    ptype,
                    self.send_id,
                    self.self_recv_window,
                    self.seq_nr,
                    self.ack_nr,
                    &[],
                );
                cursor.copy_into(&mut encoded, round_payload);

                self.send_ring.ensure_size(self.seq_nr, self.queue as usize);
                self.send_ring.put(
                    self.seq_nr,
                    SendSlot {
                        encoded,
                        payload_len: round_payload,
                        last_send_time: 0,
                        transmissions: 0,
                        need_resend: false,
                    },
                );
                self.seq_nr = self.seq_nr.wrapping_add(1);
                self.queue += 1;
            }

            payload -= round_payload;
            if payload == 0 {
                break;
            }
        }
    }

    /// Send every never-transmitted or need-resend slot until the flight
    /// window is full. Returns whether it stopped because the window was
    /// full (the caller decides whether that implies a state transition).
    fn flush(&mut self, now: u64, send: &mut dyn FnMut(&[u8])) -> bool {
        let mut seq = self.seq_nr.wrapping_sub(self.queue);
        while seq != self.seq_nr {
            let needs_send = matches!(
                self.send_ring.get(seq),
                Some(slot) if slot.transmissions == 0 || slot.need_resend
            );
            if needs_send {
                if self.flight_full() {
                    return true;
                }
                self.transmit_slot(seq, now, send);
            }
            seq = seq.wrapping_add(1);
        }
        false
    }

    /// Begin an outgoing connection: register identifiers, enqueue and
    /// immediately transmit the SYN (which bypasses the flight-window
    /// check, since nothing else is in flight yet).
    pub fn connect(
        &mut self,
        now: u64,
        peer_addr: SocketAddr,
        id_seed: u16,
        recv_id: u16,
        send_id: u16,
        send: &mut dyn FnMut(&[u8]),
    ) {
        self.peer_addr = Some(peer_addr);
        self.id_seed = id_seed;
        self.recv_id = recv_id;
        self.send_id = send_id;
        self.last_received_time = now;
        self.state = State::SynSent;
        self.rto = self.next_rto;
        self.rto_deadline = now + self.rto;

        let mut encoded = Vec::with_capacity(packet::HEADER_SIZE);
        // SYN is the one packet type whose conn_id is recv_id, not send_id.
        packet::encode(
            &mut encoded,
            PacketType::Syn,
            self.recv_id,
            self.self_recv_window,
            self.seq_nr,
            self.ack_nr,
            &[],
        );

        self.send_ring.ensure_size(self.seq_nr, self.queue as usize);
        self.send_ring.put(
            self.seq_nr,
            SendSlot {
                encoded,
                payload_len: 0,
                last_send_time: 0,
                transmissions: 0,
                need_resend: false,
            },
        );
        let syn_seq = self.seq_nr;
        self.seq_nr = self.seq_nr.wrapping_add(1);
        self.queue += 1;
        self.transmit_slot(syn_seq, now, send);
    }

    /// Register a peer-initiated connection after its SYN arrives. The
    /// caller still owes an explicit `send_ack` afterward.
    pub fn accept(&mut self, now: u64, peer_addr: SocketAddr, conn_id: u16, peer_seq: u16) {
        self.peer_addr = Some(peer_addr);
        self.id_seed = conn_id;
        self.recv_id = conn_id.wrapping_add(1);
        self.send_id = conn_id;
        self.last_received_time = now;
        self.ack_nr = peer_seq;
        self.state = State::SynRecv;
        self.rto = self.next_rto;
        self.rto_deadline = now + self.rto;
    }

    /// A retransmitted SYN arrived for a connection still awaiting its
    /// first ACK: refresh the timers a fresh SYN would have set and resend
    /// the SYN-ACK, so a lost reply doesn't stall the handshake until
    /// `WAIT_SYN_RECV` reaps it.
    pub fn resend_syn_ack(&mut self, now: u64, send: &mut dyn FnMut(&[u8])) {
        if self.state != State::SynRecv {
            return;
        }
        self.last_received_time = now;
        self.rto = self.next_rto;
        self.rto_deadline = now + self.rto;
        self.send_ack(now, send);
    }

    pub fn write_vec(
        &mut self,
        now: u64,
        bufs: &[&[u8]],
        send: &mut dyn FnMut(&[u8]),
    ) -> Result<usize, Error> {
        match self.state {
            State::Uninitialized | State::SynRecv | State::Destroy | State::FinSent => {
                return Err(Error::InvalidState(self.state));
            }
            State::SynSent | State::ConnectedFull => {
                return Err(Error::WouldBlock(self.state));
            }
            State::Connected => {}
        }

        if bufs.len() > config::MAX_VEC {
            return Err(Error::TooManyVecs(bufs.len(), config::MAX_VEC));
        }

        if self.flight_full() {
            self.state = State::ConnectedFull;
            return Err(Error::WouldBlock(self.state));
        }

        let mut cursor = ScatterCursor::new(bufs);
        let mut remaining = cursor.remaining();
        if remaining == 0 {
            return Ok(0);
        }

        let mut sent = 0usize;
        let mut valid_send = remaining.min(config::MSS);

        while (self.queue as usize) < config::QUEUE_SIZE_MAX - 1 {
            remaining -= valid_send;
            sent += valid_send;

            self.build_send_packets(valid_send, PacketType::Data, &mut cursor);

            valid_send = remaining.min(config::MSS);
            if valid_send == 0 {
                break;
            }
        }

        if self.flush(now, send) {
            self.state = State::ConnectedFull;
        }

        if sent == 0 {
            Err(Error::WouldBlock(self.state))
        } else {
            Ok(sent)
        }
    }

    pub fn write(&mut self, now: u64, buf: &[u8], send: &mut dyn FnMut(&[u8])) -> Result<usize, Error> {
        self.write_vec(now, &[buf], send)
    }

    pub fn close(&mut self, now: u64, send: &mut dyn FnMut(&[u8])) -> Result<(), Error> {
        match self.state {
            State::Uninitialized | State::SynRecv | State::Destroy | State::FinSent => {
                Err(Error::InvalidState(self.state))
            }
            State::Connected | State::ConnectedFull => {
                if self.received_fin {
                    self.state = State::Destroy;
                    return Ok(());
                }

                if self.need_send_ack {
                    self.send_ack(now, send);
                }

                self.build_send_packets(0, PacketType::Fin, &mut ScatterCursor::new(&[]));
                self.flush(now, send);
                self.state = State::FinSent;
                Ok(())
            }
            State::SynSent => {
                self.state = State::Destroy;
                Ok(())
            }
        }
    }

    pub fn send_ack(&mut self, _now: u64, send: &mut dyn FnMut(&[u8])) {
        let mut buf = Vec::new();

        if self.out_of_order_cnt != 0 && self.state != State::SynRecv && !self.received_fin_completed {
            let size = packet::sack_mask_size(self.out_of_order_cnt);
            let mut mask = vec![0u8; size];
            let limit = (size * 8).min(self.recv_ring.mask());

            for i in 0..limit {
                let seq = self.ack_nr.wrapping_add(2).wrapping_add(i as u16);
                if self.recv_ring.get(seq).is_some() {
                    mask[i / 8] |= 1 << (i % 8);
                }
            }

            packet::encode_with_sack(&mut buf, self.send_id, self.self_recv_window, self.seq_nr, self.ack_nr, &mask);
        } else {
            packet::encode(
                &mut buf,
                PacketType::State,
                self.send_id,
                self.self_recv_window,
                self.seq_nr,
                self.ack_nr,
                &[],
            );
        }

        send(&buf);
        self.need_send_ack = false;
    }

    /// Use an ACK with `ack_nr` temporarily decremented as a keepalive
    /// probe: it looks like a gap to the peer, provoking a reply.
    fn keepalive(&mut self, now: u64, send: &mut dyn FnMut(&[u8])) {
        self.ack_nr = self.ack_nr.wrapping_sub(1);
        self.send_ack(now, send);
        self.ack_nr = self.ack_nr.wrapping_add(1);
    }

    fn ack_packet(&mut self, seq: u16, now: u64) {
        let transmissions = match self.send_ring.get(seq) {
            Some(slot) if slot.transmissions > 0 => slot.transmissions,
            _ => return,
        };

        let slot = match self.send_ring.take(seq) {
            Some(s) => s,
            None => return,
        };

        if transmissions == 1 {
            let sample = now.saturating_sub(slot.last_send_time) as i64;
            if self.rtt == 0 {
                self.rtt = sample as u64;
                self.rtt_var = sample as u64 / 2;
            } else {
                let rtt = self.rtt as i64;
                let rtt_var = self.rtt_var as i64;
                let rtt_var = rtt_var + ((rtt - sample).abs() - rtt_var) / 4;
                let rtt = rtt + (sample - rtt) / 8;
                self.rtt_var = rtt_var as u64;
                self.rtt = rtt as u64;
            }
            self.next_rto = config::limited_retransmit_timeout(self.rtt + self.rtt_var * 4);
        }

        if !slot.need_resend {
            self.flight_bytes = self.flight_bytes.saturating_sub(slot.payload_len as u32);
        }
    }

    fn selective_ack(&mut self, start_seq: u16, mask: &[u8], now: u64) {
        if self.queue == 0 {
            return;
        }

        let len_bits = mask.len() * 8;
        for offset in (0..len_bits).rev() {
            let v = start_seq.wrapping_add(offset as u16);
            let dist = self.seq_nr.wrapping_sub(v).wrapping_sub(1);
            if dist >= self.queue {
                continue;
            }

            let bit = (mask[offset / 8] >> (offset % 8)) & 1;
            if bit == 1 {
                self.ack_packet(v, now);
            }
        }
    }

    /// Handle one received STATE/DATA/FIN packet for this connection
    /// (spec.md §4.5 steps 5-16; SYN handling and connection lookup happen
    /// in the socket engine before this is called).
    pub fn on_packet(
        &mut self,
        now: u64,
        header: &Header,
        sack_mask: Option<&[u8]>,
        payload: &[u8],
        out_buf: &mut [u8],
    ) -> (Events, Result<usize, Error>) {
        let mut events = Events::CONTINUE;
        let packnr = header.ack_nr;
        let pseqnr = header.seq_nr;
        let ptype = header.packet_type;

        let lo = self
            .seq_nr
            .wrapping_sub(self.queue)
            .wrapping_sub(config::ACK_NR_RECV_BEHIND_ALLOWED);
        let hi = self.seq_nr.wrapping_sub(1);
        if !seq_in_range(lo, packnr, hi) {
            return (events, Ok(0));
        }

        if self.state == State::SynSent {
            self.ack_nr = pseqnr.wrapping_sub(1);
        }

        let seq_cnt = pseqnr.wrapping_sub(self.ack_nr).wrapping_sub(1);
        if seq_cnt as usize >= config::QUEUE_SIZE_MAX {
            let wraparound_region = seq_cnt as usize >= (1usize << 16) - config::QUEUE_SIZE_MAX;
            if wraparound_region && ptype != PacketType::State {
                self.need_send_ack = true;
            }
            return (events, Ok(0));
        }

        self.last_received_time = now;

        let mut ack_cnt = packnr
            .wrapping_sub(self.seq_nr.wrapping_sub(self.queue))
            .wrapping_add(1);
        if ack_cnt > self.queue {
            ack_cnt = 0;
        }

        self.peer_recv_window = header.window;

        if ptype == PacketType::Data && self.state == State::SynRecv {
            self.state = State::Connected;
            events.insert(Events::ACCEPT);
        }

        if ptype == PacketType::State && self.state == State::SynSent {
            self.state = State::Connected;
            events.insert(Events::CONNECTED);
        }

        if self.state == State::FinSent && self.queue == ack_cnt {
            self.state = State::Destroy;
        }

        for _ in 0..ack_cnt {
            let seq = self.seq_nr.wrapping_sub(self.queue);
            self.ack_packet(seq, now);
            self.queue -= 1;
        }

        if self.queue > 0 {
            if let Some(mask) = sack_mask {
                self.selective_ack(packnr.wrapping_add(2), mask, now);
            }
        }

        if self.state == State::ConnectedFull && !self.flight_full() {
            self.state = State::Connected;
            events.insert(Events::POLLOUT);
        }

        if ptype == PacketType::State {
            return (events, Ok(0));
        }

        if !matches!(self.state, State::Connected | State::ConnectedFull | State::FinSent) {
            return (events, Ok(0));
        }

        if ptype == PacketType::Fin {
            if self.state == State::FinSent {
                self.state = State::Destroy;
                return (events, Ok(0));
            }
            if !self.received_fin {
                self.received_fin = true;
                self.eof_seq_nr = pseqnr;
            }
        }

        if self.state == State::FinSent {
            return (events, Ok(0));
        }

        if seq_cnt == 0 {
            if !payload.is_empty() {
                if payload.len() > out_buf.len() {
                    events.insert(Events::ERROR);
                    return (
                        events,
                        Err(Error::BufferTooSmall {
                            needed: payload.len(),
                            available: out_buf.len(),
                        }),
                    );
                }
                out_buf[..payload.len()].copy_from_slice(payload);
                events.insert(Events::DATA);
            }
            self.ack_nr = self.ack_nr.wrapping_add(1);
            self.need_send_ack = true;
            (events, Ok(payload.len()))
        } else {
            if self.received_fin && seq_before(self.eof_seq_nr, pseqnr) {
                return (events, Ok(0));
            }

            self.recv_ring.ensure_size(pseqnr, seq_cnt as usize + 1);
            if self.recv_ring.get(pseqnr).is_some() {
                self.need_send_ack = true;
                return (events, Ok(0));
            }

            self.recv_ring.put(pseqnr, RecvSlot { payload: payload.to_vec() });
            self.out_of_order_cnt += 1;
            self.need_send_ack = true;
            (events, Ok(0))
        }
    }

    /// Drain one unit of in-order delivery for this connection: the EOF
    /// signal, or the next contiguous payload (spec.md §4.5 step 1).
    pub fn poll_deliver(
        &mut self,
        now: u64,
        out_buf: &mut [u8],
        send: &mut dyn FnMut(&[u8]),
    ) -> Option<(Events, Result<usize, Error>)> {
        if !matches!(self.state, State::Connected | State::ConnectedFull) {
            return None;
        }

        if !self.received_fin_completed && self.received_fin && self.eof_seq_nr == self.ack_nr {
            self.received_fin_completed = true;
            self.send_ack(now, send);
            self.out_of_order_cnt = 0;
            return Some((Events::DATA, Ok(0)));
        }

        if self.out_of_order_cnt == 0 {
            return None;
        }

        let next = self.ack_nr.wrapping_add(1);
        let slot = self.recv_ring.take(next)?;

        if slot.payload.len() > out_buf.len() {
            let needed = slot.payload.len();
            let available = out_buf.len();
            // Put it back; the caller must resupply a bigger buffer.
            self.recv_ring.put(next, slot);
            return Some((Events::ERROR, Err(Error::BufferTooSmall { needed, available })));
        }

        out_buf[..slot.payload.len()].copy_from_slice(&slot.payload);
        self.ack_nr = next;
        self.need_send_ack = true;
        self.out_of_order_cnt -= 1;

        let len = slot.payload.len();
        let events = if len > 0 { Events::DATA } else { Events::CONTINUE };
        Some((events, Ok(len)))
    }

    fn resize_window(&mut self) {
        let oldest_unacked = self.seq_nr.wrapping_sub(self.queue);
        match self.oldest_resent {
            None => {
                self.oldest_resent = Some(oldest_unacked);
            }
            Some(prev) if prev == oldest_unacked => {
                self.flight_limit = config::limited_window(self.flight_limit / config::WINDOW_SHRINK_FACTOR);
            }
            Some(_) => {
                self.flight_limit = config::limited_window(self.flight_limit * config::WINDOW_EXPAND_FACTOR);
                self.oldest_resent = Some(oldest_unacked);
            }
        }
    }

    fn update_retransmit_timeout(&mut self, now: u64) {
        let after_last_sent = if self.queue != 0 {
            let seq = self.seq_nr.wrapping_sub(self.queue);
            match self.send_ring.get(seq) {
                Some(slot) => now.saturating_sub(slot.last_send_time),
                None => 0,
            }
        } else {
            0
        };

        self.rto = self.next_rto.saturating_sub(after_last_sent);
        self.rto_deadline = now + self.rto;
    }

    /// Retransmission, flow-control resizing and keepalive for one tick
    /// (spec.md §4.8). Returns whether the connection is now DESTROY and
    /// should be reaped by the caller.
    pub fn on_tick(&mut self, now: u64, send: &mut dyn FnMut(&[u8])) -> bool {
        if matches!(self.state, State::Uninitialized | State::Destroy) {
            return self.state == State::Destroy;
        }

        if now >= self.rto_deadline {
            if self.state == State::FinSent && now >= self.last_received_time + config::WAIT_FIN_SENT {
                self.state = State::Destroy;
                return true;
            }
            if self.state == State::SynRecv && now >= self.last_received_time + config::WAIT_SYN_RECV {
                self.state = State::Destroy;
                return true;
            }

            if self.queue > 0 {
                let mut seq = self.seq_nr.wrapping_sub(self.queue);
                while seq != self.seq_nr {
                    if let Some(slot) = self.send_ring.get_mut(seq) {
                        if slot.transmissions > 0 && !slot.need_resend && now >= slot.last_send_time + self.rto {
                            slot.need_resend = true;
                            let payload_len = slot.payload_len;
                            self.flight_bytes = self.flight_bytes.saturating_sub(payload_len as u32);
                        }
                    }
                    seq = seq.wrapping_add(1);
                }

                self.resize_window();
                self.flush(now, send);
            }

            self.update_retransmit_timeout(now);
        }

        if matches!(self.state, State::Connected | State::ConnectedFull)
            && now >= self.last_sent_time + config::KEEPALIVE_INTERVAL
        {
            self.keepalive(now, send);
        }

        false
    }

    pub fn rto_deadline(&self) -> u64 {
        self.rto_deadline
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn addr() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 9000)
    }

    #[test]
    fn connect_sends_one_syn_and_enters_syn_sent() {
        let mut conn = Connection::new(100);
        let mut sent = Vec::new();
        conn.connect(0, addr(), 7, 8, 7, &mut |b| sent.push(b.to_vec()));

        assert_eq!(conn.state, State::SynSent);
        assert_eq!(sent.len(), 1);
        let parsed = packet::parse(&sent[0]).unwrap();
        assert_eq!(parsed.header.packet_type, PacketType::Syn);
        assert_eq!(parsed.header.conn_id, 8); // recv_id, per the SYN exception
    }

    #[test]
    fn handshake_completes_on_both_sides() {
        let mut client = Connection::new(1000);
        let mut to_server = Vec::new();
        client.connect(0, addr(), 42, 43, 42, &mut |b| to_server.push(b.to_vec()));

        let syn = packet::parse(&to_server[0]).unwrap();

        let mut server = Connection::new(5000);
        server.accept(0, addr(), syn.header.conn_id, syn.header.seq_nr);
        let mut to_client = Vec::new();
        server.send_ack(0, &mut |b| to_client.push(b.to_vec()));
        assert_eq!(server.state, State::SynRecv);

        let state_pkt = packet::parse(&to_client[0]).unwrap();
        let (events, result) = client.on_packet(0, &state_pkt.header, None, state_pkt.payload, &mut []);
        assert!(events.contains(Events::CONNECTED));
        assert_eq!(result.unwrap(), 0);
        assert_eq!(client.state, State::Connected);
    }

    #[test]
    fn write_segments_at_mss_boundary() {
        let mut conn = Connection::new(0);
        conn.state = State::Connected;
        conn.peer_addr = Some(addr());
        conn.peer_recv_window = config::WINDOW_SIZE_MAX;

        let data = vec![b'x'; config::MSS * 2 + 17];
        let mut sent = Vec::new();
        let n = conn.write(0, &data, &mut |b| sent.push(b.to_vec())).unwrap();

        assert_eq!(n, data.len());
        assert_eq!(conn.queue, 3);
    }

    #[test]
    fn write_reports_would_block_when_flight_window_full() {
        let mut conn = Connection::new(0);
        conn.state = State::Connected;
        conn.peer_addr = Some(addr());
        conn.flight_limit = config::MSS as u32; // only room for one packet

        let mut sent = Vec::new();
        conn.write(0, &vec![b'x'; config::MSS], &mut |b| sent.push(b.to_vec()))
            .unwrap();

        let result = conn.write(0, &vec![b'x'; config::MSS], &mut |b| sent.push(b.to_vec()));
        assert!(matches!(result, Err(Error::WouldBlock(State::ConnectedFull))));
        assert_eq!(conn.state, State::ConnectedFull);
    }

    #[test]
    fn ack_packet_updates_rtt_on_first_sample() {
        let mut conn = Connection::new(0);
        conn.state = State::Connected;
        conn.peer_addr = Some(addr());
        conn.peer_recv_window = config::WINDOW_SIZE_MAX;

        let mut sent = Vec::new();
        conn.write(0, b"hello", &mut |b| sent.push(b.to_vec())).unwrap();

        conn.ack_packet(0, 150);
        assert_eq!(conn.rtt, 150);
        assert_eq!(conn.rtt_var, 75);
        assert!(conn.next_rto >= config::RETRANSMIT_TIMEOUT_MIN);
    }

    #[test]
    fn close_after_received_fin_destroys_immediately() {
        let mut conn = Connection::new(0);
        conn.state = State::Connected;
        conn.peer_addr = Some(addr());
        conn.received_fin = true;

        conn.close(0, &mut |_| {}).unwrap();
        assert_eq!(conn.state, State::Destroy);
    }

    #[test]
    fn close_from_connected_queues_fin_and_enters_fin_sent() {
        let mut conn = Connection::new(0);
        conn.state = State::Connected;
        conn.peer_addr = Some(addr());
        conn.peer_recv_window = config::WINDOW_SIZE_MAX;

        let mut sent = Vec::new();
        conn.close(0, &mut |b| sent.push(b.to_vec())).unwrap();

        assert_eq!(conn.state, State::FinSent);
        assert_eq!(sent.len(), 1);
        assert_eq!(packet::parse(&sent[0]).unwrap().header.packet_type, PacketType::Fin);
    }

    #[test]
    fn out_of_order_packet_is_buffered_and_acked_sack() {
        let mut conn = Connection::new(0);
        conn.state = State::Connected;
        conn.peer_addr = Some(addr());
        conn.ack_nr = 9;
        conn.seq_nr = 100;
        conn.queue = 0;

        let header = Header {
            packet_type: PacketType::Data,
            conn_id: 1,
            window: 1000,
            seq_nr: 12, // 2 ahead of ack_nr + 1 == 10
            ack_nr: 99,
        };
        let mut out = [0u8; 16];
        let (events, result) = conn.on_packet(0, &header, None, b"xy", &mut out);
        assert_eq!(result.unwrap(), 0);
        assert!(!events.contains(Events::DATA));
        assert_eq!(conn.out_of_order_cnt, 1);
    }

    #[test]
    fn resize_window_shrinks_on_repeated_retransmit_of_same_slot() {
        let mut conn = Connection::new(0);
        let before = conn.flight_limit;
        conn.queue = 1;
        conn.seq_nr = 1;
        conn.resize_window(); // first loss: just records oldest_resent
        assert_eq!(conn.flight_limit, before);
        conn.resize_window(); // same oldest unacked again: shrink
        assert!(conn.flight_limit <= before);
    }
}
