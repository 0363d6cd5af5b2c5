//! Sockets: the user-facing half of the transport layer.
//!
//! A [`Socket`] is a handle to one slot in the stack's socket table. The
//! blocking calls (`connect`, reliable `send`, `accept`, the `recv`
//! family) never hold the socket table lock while they wait; they park on
//! the slot's signal or queue so the ingress path can keep running the
//! state machine underneath them.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, error};

use crate::header::{Flags, Header, Priority};
use crate::pool::PacketRef;
use crate::stack::{NetStack, StackError};
use crate::util::BoundedQueue;
use crate::{ACK_TIMEOUT, MTU, RETRY_LIMIT};

pub(crate) mod machine;
pub(crate) mod table;

pub use self::table::{SocketKind, SocketState};

use self::table::RxMessage;

/// A socket-table slot held by user code.
///
/// Sockets are not closed on drop; call [`Socket::close`] to return the
/// slot to the table. A closed slot may be handed out again by a later
/// [`NetStack::socket`], so keep a `Socket` around only as long as the
/// conversation it names.
pub struct Socket {
    pub(crate) stack: NetStack,
    pub(crate) slot: usize,
}

impl Socket {
    /// Binds the socket to a local port. Port 0 picks the next free
    /// ephemeral port. Fails on a port at or above [`crate::MAX_PORTS`] or
    /// one already in use by a non-closed socket.
    pub fn bind(&self, port: u8) -> Result<(), StackError> {
        let mut table = self.stack.sockets().lock();
        table.bind(self.slot, port)
    }

    /// Turns a bound reliable socket into a listener. The accept backlog is
    /// fixed at [`crate::ACCEPT_QUEUE_DEPTH`]; `backlog` is accepted for
    /// familiarity and ignored.
    pub fn listen(&self, _backlog: usize) -> Result<(), StackError> {
        let mut table = self.stack.sockets().lock();
        let slot = &mut table.slots[self.slot];
        if slot.kind != SocketKind::Reliable {
            return Err(StackError::WrongSocketType);
        }
        if slot.state != SocketState::Open || slot.local_port == 0 {
            return Err(StackError::IllegalArgument);
        }
        slot.state = SocketState::Listening;
        Ok(())
    }

    /// Waits for an incoming connection on a listener and returns the child
    /// socket, which is already past SYN-ACK on our side.
    pub fn accept(&self, timeout: Option<Duration>) -> Result<Socket, StackError> {
        let queue = {
            let table = self.stack.sockets().lock();
            let slot = &table.slots[self.slot];
            if slot.kind != SocketKind::Reliable {
                return Err(StackError::WrongSocketType);
            }
            if slot.state != SocketState::Listening {
                return Err(StackError::IllegalArgument);
            }
            match slot.accept_queue.clone() {
                Some(queue) => queue,
                None => return Err(StackError::IllegalArgument),
            }
        };
        match queue.pop(timeout) {
            Some(child) => Ok(Socket {
                stack: self.stack.clone(),
                slot: child,
            }),
            None => Err(StackError::Timeout),
        }
    }

    /// On a reliable socket: runs the three-way handshake against
    /// `node`:`port`, blocking up to [`ACK_TIMEOUT`]. On a datagram socket:
    /// records the default peer for `send` and returns immediately.
    /// Binds an ephemeral port first if the socket is unbound.
    pub fn connect(&self, node: u8, port: u8) -> Result<(), StackError> {
        let signal = {
            let mut table = self.stack.sockets().lock();
            if table.slots[self.slot].state != SocketState::Open {
                return Err(StackError::IllegalArgument);
            }
            if table.slots[self.slot].local_port == 0 {
                table.bind(self.slot, 0)?;
            }
            let slot = &mut table.slots[self.slot];
            slot.peer = Some((node, port));
            if slot.kind == SocketKind::Datagram {
                return Ok(());
            }
            slot.state = SocketState::SynSent;
            slot.tx_seq = 0;
            slot.rx_expected_seq = 0;
            let signal = match slot.signal.clone() {
                Some(signal) => signal,
                None => return Err(StackError::IllegalArgument),
            };
            signal.clear();
            let (local_node, local_port) = (slot.local_node, slot.local_port);
            if let Err(e) = machine::send_control(
                &self.stack,
                (node, port),
                (local_node, local_port),
                Flags::SYN,
                None,
            ) {
                let slot = &mut table.slots[self.slot];
                slot.state = SocketState::Open;
                slot.peer = None;
                return Err(e);
            }
            signal
        };
        if signal.take(Some(ACK_TIMEOUT)) {
            return Ok(());
        }
        let mut table = self.stack.sockets().lock();
        let slot = &mut table.slots[self.slot];
        if slot.state == SocketState::Established {
            // The SYN-ACK squeaked in after the deadline.
            return Ok(());
        }
        if slot.state == SocketState::SynSent {
            slot.state = SocketState::Open;
            slot.peer = None;
        }
        debug!("connect to {}:{} timed out", node, port);
        Err(StackError::Timeout)
    }

    /// Sends `data` to the connected peer. On a reliable socket this is a
    /// stop-and-wait exchange: the segment carries the next sequence number
    /// and the call blocks until the peer's ACK, retrying up to
    /// [`RETRY_LIMIT`] times. On a datagram socket the frame goes out once,
    /// to the default peer recorded by `connect`.
    pub fn send(&self, data: &[u8]) -> Result<usize, StackError> {
        if data.len() > MTU - 1 {
            return Err(StackError::TooLargePayload);
        }
        let (kind, peer) = {
            let table = self.stack.sockets().lock();
            let slot = &table.slots[self.slot];
            (slot.kind, slot.peer)
        };
        match kind {
            SocketKind::Reliable => self.send_reliable(None, data),
            SocketKind::Datagram => {
                let peer = peer.ok_or(StackError::NotConnected)?;
                self.send_datagram(data, peer)
            }
        }
    }

    /// Sends a datagram to an explicit destination, independent of any
    /// default peer. Datagram sockets only.
    pub fn send_to(&self, data: &[u8], node: u8, port: u8) -> Result<usize, StackError> {
        if data.len() > MTU - 1 {
            return Err(StackError::TooLargePayload);
        }
        self.send_datagram(data, (node, port))
    }

    /// Receives into `buf`, blocking up to `timeout` (`None` waits
    /// forever). Returns the number of bytes copied; `Ok(0)` means the peer
    /// reset the connection (or sent an empty payload). The sequence byte
    /// of reliable segments is stripped.
    pub fn recv(&self, buf: &mut [u8], timeout: Option<Duration>) -> Result<usize, StackError> {
        let (queue, strip) = self.rx_queue()?;
        match queue.pop(timeout) {
            None => Err(StackError::Timeout),
            Some(None) => Ok(0),
            Some(Some(packet)) => {
                let copied = self.stack.pool().with(packet, |p| {
                    let payload = p.payload();
                    let avail = payload.len().saturating_sub(strip);
                    let copied = avail.min(buf.len());
                    buf[..copied].copy_from_slice(&payload[strip..strip + copied]);
                    copied
                });
                self.stack.pool().free(packet);
                Ok(copied)
            }
        }
    }

    /// Receives one datagram and reports its source. Datagram sockets only.
    pub fn recv_from(
        &self,
        buf: &mut [u8],
        timeout: Option<Duration>,
    ) -> Result<(usize, u8, u8), StackError> {
        let (packet, src_node, src_port) = self.recv_packet_from(timeout)?;
        let copied = self.stack.pool().with(packet, |p| {
            let payload = p.payload();
            let copied = payload.len().min(buf.len());
            buf[..copied].copy_from_slice(&payload[..copied]);
            copied
        });
        self.stack.pool().free(packet);
        Ok((copied, src_node, src_port))
    }

    /// Zero-copy send: transmits a pool packet whose payload the caller
    /// filled in. Ownership transfers to the stack; the packet is freed on
    /// every path. On a reliable socket the sequence byte is inserted in
    /// front of the payload, so the payload must leave one byte of
    /// headroom.
    pub fn send_packet(&self, packet: PacketRef) -> Result<usize, StackError> {
        let (kind, peer) = {
            let table = self.stack.sockets().lock();
            let slot = &table.slots[self.slot];
            (slot.kind, slot.peer)
        };
        match kind {
            SocketKind::Reliable => self.send_packet_reliable(packet),
            SocketKind::Datagram => match peer {
                Some((node, port)) => self.send_packet_to(packet, node, port),
                None => {
                    self.stack.pool().free(packet);
                    Err(StackError::NotConnected)
                }
            },
        }
    }

    /// Zero-copy datagram send to an explicit destination. Datagram sockets
    /// only; the packet is freed on every path.
    pub fn send_packet_to(&self, packet: PacketRef, node: u8, port: u8) -> Result<usize, StackError> {
        let result = self.send_packet_to_inner(packet, node, port);
        self.stack.pool().free(packet);
        result
    }

    /// Zero-copy receive: returns the packet handle straight off the
    /// receive queue. On reliable sockets the sequence byte has been
    /// stripped. The caller owns the packet and must free it. A peer reset
    /// surfaces as [`StackError::ConnectionReset`].
    pub fn recv_packet(&self, timeout: Option<Duration>) -> Result<PacketRef, StackError> {
        let (queue, strip) = self.rx_queue()?;
        match queue.pop(timeout) {
            None => Err(StackError::Timeout),
            Some(None) => Err(StackError::ConnectionReset),
            Some(Some(packet)) => {
                if strip > 0 {
                    self.stack.pool().with_mut(packet, |p| p.strip_front(strip));
                }
                Ok(packet)
            }
        }
    }

    /// Zero-copy receive reporting the datagram's source. Datagram sockets
    /// only.
    pub fn recv_packet_from(
        &self,
        timeout: Option<Duration>,
    ) -> Result<(PacketRef, u8, u8), StackError> {
        {
            let table = self.stack.sockets().lock();
            if table.slots[self.slot].kind != SocketKind::Datagram {
                return Err(StackError::WrongSocketType);
            }
        }
        let packet = self.recv_packet(timeout)?;
        let header = Header::unpack(self.stack.pool().with(packet, |p| p.header()));
        Ok((packet, header.src_node, header.src_port))
    }

    /// Closes the socket. A reliable socket that reached the handshake
    /// sends RST so the peer tears down too. The slot is returned to the
    /// table; its queues and signal survive for the slot's next life.
    pub fn close(&self) -> Result<(), StackError> {
        let mut table = self.stack.sockets().lock();
        let slot = &mut table.slots[self.slot];
        if slot.state == SocketState::Closed {
            return Ok(());
        }
        if slot.kind == SocketKind::Reliable && slot.in_connected_states() {
            if let Some((peer_node, peer_port)) = slot.peer {
                machine::emit_control(
                    &self.stack,
                    (peer_node, peer_port),
                    (slot.local_node, slot.local_port),
                    Flags::RST,
                    None,
                );
            }
        }
        slot.release();
        Ok(())
    }

    pub fn kind(&self) -> SocketKind {
        self.stack.sockets().lock().slots[self.slot].kind
    }

    pub fn state(&self) -> SocketState {
        self.stack.sockets().lock().slots[self.slot].state
    }

    pub fn local_node(&self) -> u8 {
        self.stack.sockets().lock().slots[self.slot].local_node
    }

    pub fn local_port(&self) -> u8 {
        self.stack.sockets().lock().slots[self.slot].local_port
    }

    /// The remote peer, when connected or default-peered.
    pub fn peer(&self) -> Option<(u8, u8)> {
        self.stack.sockets().lock().slots[self.slot].peer
    }

    /// Next sequence number this side will send.
    pub fn tx_seq(&self) -> u8 {
        self.stack.sockets().lock().slots[self.slot].tx_seq
    }

    /// Sequence number this side expects to receive next.
    pub fn rx_expected_seq(&self) -> u8 {
        self.stack.sockets().lock().slots[self.slot].rx_expected_seq
    }

    /// Stop-and-wait send of `[seq] [prefix?] data`. Shared by `send` and
    /// the fragmentation layer, which slips its fragment byte in as
    /// `prefix`.
    pub(crate) fn send_reliable(&self, prefix: Option<u8>, data: &[u8]) -> Result<usize, StackError> {
        let extra = 1 + prefix.map_or(0, |_| 1);
        if data.len() + extra > MTU {
            return Err(StackError::TooLargePayload);
        }
        for attempt in 0..RETRY_LIMIT {
            let signal = {
                let mut table = self.stack.sockets().lock();
                let slot = &mut table.slots[self.slot];
                if slot.kind != SocketKind::Reliable {
                    return Err(StackError::WrongSocketType);
                }
                if slot.state != SocketState::Established {
                    return Err(StackError::NotConnected);
                }
                let (peer_node, peer_port) = slot.peer.ok_or(StackError::NotConnected)?;
                let signal = match slot.signal.clone() {
                    Some(signal) => signal,
                    None => return Err(StackError::IllegalArgument),
                };
                let (local_node, local_port) = (slot.local_node, slot.local_port);
                let seq = slot.tx_seq;
                let packet = match self.stack.pool().get() {
                    Some(packet) => packet,
                    None => {
                        error!("pool exhausted, cannot send segment");
                        return Err(StackError::PoolExhausted);
                    }
                };
                self.stack.pool().with_mut(packet, |p| {
                    p.set_header(
                        Header::new(peer_node, local_node, peer_port, local_port, Flags::empty())
                            .pack(Priority::Normal),
                    );
                    let buf = p.payload_mut();
                    buf[0] = seq;
                    let mut offset = 1;
                    if let Some(byte) = prefix {
                        buf[1] = byte;
                        offset = 2;
                    }
                    buf[offset..offset + data.len()].copy_from_slice(data);
                    p.set_len(offset + data.len());
                });
                signal.clear();
                let result = self.stack.router().transmit(self.stack.pool(), packet);
                self.stack.pool().free(packet);
                result.map_err(StackError::Tx)?;
                signal
            };
            if signal.take(Some(ACK_TIMEOUT)) {
                let mut table = self.stack.sockets().lock();
                let slot = &mut table.slots[self.slot];
                if slot.state != SocketState::Established {
                    return Err(StackError::ConnectionReset);
                }
                slot.tx_seq = slot.tx_seq.wrapping_add(1);
                return Ok(data.len());
            }
            debug!("no ACK for segment, attempt {} of {}", attempt + 1, RETRY_LIMIT);
        }
        Err(StackError::Timeout)
    }

    /// Stop-and-wait send of a caller-filled packet. The sequence byte is
    /// inserted once; retries retransmit the same packet.
    fn send_packet_reliable(&self, packet: PacketRef) -> Result<usize, StackError> {
        let user_len = self.stack.pool().with(packet, |p| p.len());
        if user_len > MTU - 1 {
            self.stack.pool().free(packet);
            return Err(StackError::TooLargePayload);
        }
        let signal = {
            let table = self.stack.sockets().lock();
            let slot = &table.slots[self.slot];
            if slot.state != SocketState::Established {
                self.stack.pool().free(packet);
                return Err(StackError::NotConnected);
            }
            let (peer_node, peer_port) = match slot.peer {
                Some(peer) => peer,
                None => {
                    self.stack.pool().free(packet);
                    return Err(StackError::NotConnected);
                }
            };
            let signal = match slot.signal.clone() {
                Some(signal) => signal,
                None => {
                    self.stack.pool().free(packet);
                    return Err(StackError::IllegalArgument);
                }
            };
            let seq = slot.tx_seq;
            self.stack.pool().with_mut(packet, |p| {
                p.insert_front(seq);
                p.set_header(
                    Header::new(peer_node, slot.local_node, peer_port, slot.local_port, Flags::empty())
                        .pack(Priority::Normal),
                );
            });
            signal
        };
        for attempt in 0..RETRY_LIMIT {
            {
                let table = self.stack.sockets().lock();
                if table.slots[self.slot].state != SocketState::Established {
                    self.stack.pool().free(packet);
                    return Err(StackError::ConnectionReset);
                }
                signal.clear();
                if let Err(e) = self.stack.router().transmit(self.stack.pool(), packet) {
                    self.stack.pool().free(packet);
                    return Err(StackError::Tx(e));
                }
            }
            if signal.take(Some(ACK_TIMEOUT)) {
                let mut table = self.stack.sockets().lock();
                let slot = &mut table.slots[self.slot];
                if slot.state != SocketState::Established {
                    self.stack.pool().free(packet);
                    return Err(StackError::ConnectionReset);
                }
                slot.tx_seq = slot.tx_seq.wrapping_add(1);
                self.stack.pool().free(packet);
                return Ok(user_len);
            }
            debug!("no ACK for packet, attempt {} of {}", attempt + 1, RETRY_LIMIT);
        }
        self.stack.pool().free(packet);
        Err(StackError::Timeout)
    }

    fn send_datagram(&self, data: &[u8], dst: (u8, u8)) -> Result<usize, StackError> {
        let (local_node, local_port) = {
            let mut table = self.stack.sockets().lock();
            {
                let slot = &table.slots[self.slot];
                if slot.kind != SocketKind::Datagram {
                    return Err(StackError::WrongSocketType);
                }
                if slot.state != SocketState::Open {
                    return Err(StackError::IllegalArgument);
                }
            }
            if table.slots[self.slot].local_port == 0 {
                table.bind(self.slot, 0)?;
            }
            let slot = &table.slots[self.slot];
            (slot.local_node, slot.local_port)
        };
        let packet = match self.stack.pool().get() {
            Some(packet) => packet,
            None => {
                error!("pool exhausted, cannot send datagram");
                return Err(StackError::PoolExhausted);
            }
        };
        self.stack.pool().with_mut(packet, |p| {
            p.set_header(
                Header::new(dst.0, local_node, dst.1, local_port, Flags::empty())
                    .pack(Priority::Normal),
            );
            p.set_payload(data);
        });
        let result = self.stack.router().transmit(self.stack.pool(), packet);
        self.stack.pool().free(packet);
        result.map_err(StackError::Tx)?;
        Ok(data.len())
    }

    fn send_packet_to_inner(&self, packet: PacketRef, node: u8, port: u8) -> Result<usize, StackError> {
        let user_len = self.stack.pool().with(packet, |p| p.len());
        if user_len > MTU - 1 {
            return Err(StackError::TooLargePayload);
        }
        let (local_node, local_port) = {
            let mut table = self.stack.sockets().lock();
            {
                let slot = &table.slots[self.slot];
                if slot.kind != SocketKind::Datagram {
                    return Err(StackError::WrongSocketType);
                }
                if slot.state != SocketState::Open {
                    return Err(StackError::IllegalArgument);
                }
            }
            if table.slots[self.slot].local_port == 0 {
                table.bind(self.slot, 0)?;
            }
            let slot = &table.slots[self.slot];
            (slot.local_node, slot.local_port)
        };
        self.stack.pool().with_mut(packet, |p| {
            p.set_header(
                Header::new(node, local_node, port, local_port, Flags::empty())
                    .pack(Priority::Normal),
            );
        });
        self.stack
            .router()
            .transmit(self.stack.pool(), packet)
            .map_err(StackError::Tx)?;
        Ok(user_len)
    }

    fn rx_queue(&self) -> Result<(Arc<BoundedQueue<RxMessage>>, usize), StackError> {
        let table = self.stack.sockets().lock();
        let slot = &table.slots[self.slot];
        let strip = match slot.kind {
            SocketKind::Reliable => 1,
            SocketKind::Datagram => 0,
        };
        match slot.rx_queue.clone() {
            Some(queue) => Ok((queue, strip)),
            None => Err(StackError::IllegalArgument),
        }
    }
}
