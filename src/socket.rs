//! The engine owning the UDP descriptor, the connection registry, and the
//! id-seed handshake admission logic. Grounded on the teacher's `Manager`
//! (a single struct owning every TCB plus the bound-port set) but
//! specialized to a single real `UdpSocket` instead of a tun device shared
//! across many simulated peers.

use std::collections::HashMap;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::time::Instant;

use log::{trace, warn};
use rand::Rng;

use crate::conn::{Connection, State};
use crate::config::SocketConfig;
use crate::err::Error;
use crate::packet::{self, PacketType};

/// Opaque handle into a socket's connection registry. Stable across
/// retransmissions and state transitions; only invalidated once the
/// connection is reaped after reaching DESTROY.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnHandle(usize);

/// Runtime-settable/gettable socket properties, mirrored from the
/// original's integer `RDP_PROP_*` getsockopt-style interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketProp {
    SendBufferSize,
    RecvBufferSize,
    MaxConns,
}

pub use crate::conn::Events as Event;

pub struct Socket {
    udp: UdpSocket,
    epoch: Instant,
    conns: Vec<Option<Connection>>,
    free_slots: Vec<usize>,
    registry: HashMap<(SocketAddr, u16), usize>,
    config: SocketConfig,
    rng: rand::rngs::ThreadRng,
    recv_buf: Vec<u8>,
}

impl Socket {
    pub fn bind<A: ToSocketAddrs>(addr: A) -> Result<Self, Error> {
        let udp = UdpSocket::bind(addr)?;
        udp.set_nonblocking(true)?;
        Ok(Socket {
            udp,
            epoch: Instant::now(),
            conns: Vec::new(),
            free_slots: Vec::new(),
            registry: HashMap::new(),
            config: SocketConfig::default(),
            rng: rand::thread_rng(),
            recv_buf: vec![0u8; 64 * 1024],
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        Ok(self.udp.local_addr()?)
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    pub fn get_prop(&self, prop: SocketProp) -> i64 {
        match prop {
            SocketProp::SendBufferSize => self.config.send_buffer_size as i64,
            SocketProp::RecvBufferSize => self.config.recv_buffer_size as i64,
            SocketProp::MaxConns => self.config.max_conns as i64,
        }
    }

    pub fn set_prop(&mut self, prop: SocketProp, val: i64) {
        match prop {
            SocketProp::SendBufferSize => self.config.send_buffer_size = val as u32,
            SocketProp::RecvBufferSize => self.config.recv_buffer_size = val as u32,
            SocketProp::MaxConns => self.config.max_conns = val as usize,
        }
    }

    fn alloc_slot(&mut self, conn: Connection) -> Result<usize, Error> {
        if let Some(slot) = self.free_slots.pop() {
            self.conns[slot] = Some(conn);
            return Ok(slot);
        }
        // The original caps admission at MAX_CONNS_PER_SOCKET (off-by-one
        // fixed: `>=`, not `>`, so the cap is an inclusive ceiling).
        if self.conns.len() >= self.config.max_conns {
            return Err(Error::ConnectionLimitReached(self.config.max_conns));
        }
        self.conns.push(Some(conn));
        Ok(self.conns.len() - 1)
    }

    fn conn_mut(&mut self, handle: ConnHandle) -> Option<&mut Connection> {
        self.conns.get_mut(handle.0).and_then(|c| c.as_mut())
    }

    pub fn conn_get_user_data(&self, handle: ConnHandle) -> Option<&dyn std::any::Any> {
        self.conns
            .get(handle.0)
            .and_then(|c| c.as_ref())
            .and_then(|c| c.user_data.as_deref())
    }

    pub fn conn_set_user_data(&mut self, handle: ConnHandle, data: Box<dyn std::any::Any>) {
        if let Some(conn) = self.conn_mut(handle) {
            conn.user_data = Some(data);
        }
    }

    /// Create an unconnected connection record. The caller typically calls
    /// `conn_connect` next.
    pub fn conn_create(&mut self) -> Result<ConnHandle, Error> {
        let seq_nr = self.rng.gen();
        let slot = self.alloc_slot(Connection::new(seq_nr))?;
        Ok(ConnHandle(slot))
    }

    /// Pick a not-yet-registered id_seed for `peer`, rerolling on collision
    /// (mirrors the original's retry loop around `rand() & 0xffff`).
    fn fresh_id_seed(&mut self, peer: SocketAddr) -> u16 {
        loop {
            let candidate: u16 = self.rng.gen();
            let recv_id = candidate.wrapping_add(1);
            if !self.registry.contains_key(&(peer, recv_id)) {
                return candidate;
            }
        }
    }

    /// Resolve `host:service`, create a connection, and connect it in one
    /// step (mirrors `rdpNetConnect`).
    pub fn net_connect<A: ToSocketAddrs>(&mut self, addr: A) -> Result<ConnHandle, Error> {
        let peer = addr
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| Error::Io(std::io::Error::new(std::io::ErrorKind::NotFound, "no address resolved")))?;
        let handle = self.conn_create()?;
        self.conn_connect(handle, peer)?;
        Ok(handle)
    }

    pub fn conn_connect(&mut self, handle: ConnHandle, peer: SocketAddr) -> Result<(), Error> {
        let now = self.now_ms();
        let id_seed = self.fresh_id_seed(peer);
        let recv_id = id_seed.wrapping_add(1);
        let send_id = id_seed;

        let udp = &self.udp;
        let conn = self
            .conns
            .get_mut(handle.0)
            .and_then(|c| c.as_mut())
            .ok_or(Error::InvalidState(State::Destroy))?;
        conn.connect(now, peer, id_seed, recv_id, send_id, &mut |bytes| {
            let _ = udp.send_to(bytes, peer);
        });

        self.registry.insert((peer, recv_id), handle.0);
        Ok(())
    }

    pub fn conn_close(&mut self, handle: ConnHandle) -> Result<(), Error> {
        let now = self.now_ms();
        let udp = &self.udp;
        let conn = self
            .conns
            .get_mut(handle.0)
            .and_then(|c| c.as_mut())
            .ok_or(Error::InvalidState(State::Destroy))?;
        let peer = conn.peer_addr.ok_or(Error::InvalidState(State::Uninitialized))?;
        conn.close(now, &mut |bytes| {
            let _ = udp.send_to(bytes, peer);
        })
    }

    pub fn write(&mut self, handle: ConnHandle, bytes: &[u8]) -> Result<usize, Error> {
        self.write_vec(handle, &[bytes])
    }

    pub fn write_vec(&mut self, handle: ConnHandle, iov: &[&[u8]]) -> Result<usize, Error> {
        let now = self.now_ms();
        let udp = &self.udp;
        let conn = self
            .conns
            .get_mut(handle.0)
            .and_then(|c| c.as_mut())
            .ok_or(Error::InvalidState(State::Destroy))?;
        let peer = conn.peer_addr.ok_or(Error::InvalidState(State::Uninitialized))?;
        conn.write_vec(now, iov, &mut |bytes| {
            let _ = udp.send_to(bytes, peer);
        })
    }

    /// Handle exactly one unit of work: a pending in-order delivery, one
    /// received datagram, or nothing (`WouldBlock`). Mirrors `rdpReadPoll`'s
    /// single-call contract.
    pub fn read_poll(&mut self, buf: &mut [u8]) -> (Option<ConnHandle>, Event, Result<usize, Error>) {
        let now = self.now_ms();

        // Step 1: drain one pending in-order delivery before touching the
        // network, so a burst of already-buffered data doesn't starve behind
        // a slow socket.
        for slot in 0..self.conns.len() {
            let udp = &self.udp;
            let conn = match self.conns[slot].as_mut() {
                Some(conn) => conn,
                None => continue,
            };
            let peer = conn.peer_addr;
            let delivered = conn.poll_deliver(now, buf, &mut |bytes| {
                if let Some(p) = peer {
                    let _ = udp.send_to(bytes, p);
                }
            });
            if let Some((events, result)) = delivered {
                return (Some(ConnHandle(slot)), events, result);
            }
        }

        match self.udp.recv_from(&mut self.recv_buf) {
            Ok((n, from)) => {
                let datagram = self.recv_buf[..n].to_vec();
                self.handle_datagram(now, &datagram, from, buf)
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                self.flush_pending_acks(now);
                (None, Event::AGAIN, Ok(0))
            }
            Err(e) => (None, Event::ERROR, Err(Error::Io(e))),
        }
    }

    fn flush_pending_acks(&mut self, now: u64) {
        for slot in 0..self.conns.len() {
            let udp = &self.udp;
            if let Some(conn) = self.conns[slot].as_mut() {
                if conn.need_send_ack() {
                    if let Some(peer) = conn.peer_addr {
                        conn.send_ack(now, &mut |bytes| {
                            let _ = udp.send_to(bytes, peer);
                        });
                    }
                }
            }
        }
    }

    fn handle_datagram(
        &mut self,
        now: u64,
        datagram: &[u8],
        from: SocketAddr,
        out_buf: &mut [u8],
    ) -> (Option<ConnHandle>, Event, Result<usize, Error>) {
        let parsed = match packet::parse(datagram) {
            Some(p) => p,
            None => {
                trace!("dropped malformed datagram from {from}");
                return (None, Event::CONTINUE, Ok(0));
            }
        };

        if parsed.header.packet_type == PacketType::Syn {
            return self.handle_syn(now, &parsed, from);
        }

        let key = (from, parsed.header.conn_id);
        let slot = match self.registry.get(&key) {
            Some(&slot) => slot,
            None => {
                // A datagram for a connection id nobody registered is a
                // normal, expected occurrence on a lossy network (a stray
                // retransmit after teardown, a stale peer) — spec.md §4.5
                // step 4 says to drop it, and §7 classifies it as a
                // protocol-violation case to drop silently, not surface.
                trace!("dropped datagram for unknown connection {} from {from}", parsed.header.conn_id);
                return (None, Event::CONTINUE, Ok(0));
            }
        };

        let conn = match self.conns[slot].as_mut() {
            Some(c) => c,
            None => return (None, Event::CONTINUE, Ok(0)),
        };

        let (events, result) = conn.on_packet(now, &parsed.header, parsed.sack_mask, parsed.payload, out_buf);
        (Some(ConnHandle(slot)), events, result)
    }

    fn handle_syn(
        &mut self,
        now: u64,
        parsed: &packet::ParsedPacket<'_>,
        from: SocketAddr,
    ) -> (Option<ConnHandle>, Event, Result<usize, Error>) {
        let recv_id = parsed.header.conn_id.wrapping_add(1);
        let key = (from, recv_id);

        if let Some(&slot) = self.registry.get(&key) {
            // Retransmitted SYN for a connection we already admitted. If
            // it's still waiting on its first ACK, a lost SYN-ACK would
            // otherwise stall the handshake until WAIT_SYN_RECV reaps it,
            // so refresh its timers and resend; any other state just drops
            // the retry, matching the original's SYN_RECV-only refresh.
            if let Some(conn) = self.conns[slot].as_mut() {
                let udp = &self.udp;
                conn.resend_syn_ack(now, &mut |bytes| {
                    let _ = udp.send_to(bytes, from);
                });
            }
            return (Some(ConnHandle(slot)), Event::CONTINUE, Ok(0));
        }

        let seq_nr = self.rng.gen();
        let slot = match self.alloc_slot(Connection::new(seq_nr)) {
            Ok(slot) => slot,
            Err(e) => return (None, Event::ERROR, Err(e)),
        };

        let conn = self.conns[slot].as_mut().unwrap();
        conn.accept(now, from, parsed.header.conn_id, parsed.header.seq_nr);

        let udp = &self.udp;
        conn.send_ack(now, &mut |bytes| {
            let _ = udp.send_to(bytes, from);
        });

        self.registry.insert(key, slot);
        (Some(ConnHandle(slot)), Event::CONTINUE, Ok(0))
    }

    /// Drive retransmission, flow-control resizing, and keepalive for every
    /// connection, reaping anything that reached DESTROY. Returns the
    /// number of milliseconds the caller should wait before calling again
    /// (clamped to `SOCKET_CHECK_MIN..=SOCKET_CHECK_MAX`).
    pub fn interval_action(&mut self) -> u64 {
        let now = self.now_ms();
        let mut to_reap = Vec::new();

        for slot in 0..self.conns.len() {
            let udp = &self.udp;
            let conn = match self.conns[slot].as_mut() {
                Some(c) => c,
                None => continue,
            };
            let peer = conn.peer_addr;
            let destroyed = conn.on_tick(now, &mut |bytes| {
                if let Some(p) = peer {
                    let _ = udp.send_to(bytes, p);
                }
            });
            if destroyed {
                to_reap.push(slot);
            }
        }

        for slot in to_reap {
            self.conns[slot] = None;
            self.registry.retain(|_, &mut v| v != slot);
            self.free_slots.push(slot);
            warn!("reaped connection slot {slot}");
        }

        let mut deadline = crate::config::SOCKET_CHECK_MAX;
        for conn in self.conns.iter().flatten() {
            let remaining = conn.rto_deadline().saturating_sub(now);
            deadline = deadline.min(remaining.max(crate::config::SOCKET_CHECK_MIN));
        }
        deadline.clamp(crate::config::SOCKET_CHECK_MIN, crate::config::SOCKET_CHECK_MAX)
    }
}
