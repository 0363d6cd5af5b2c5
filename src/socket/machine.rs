//! The ingress half of the connection state machine.
//!
//! Frames arrive here from [`crate::NetStack::input`] already validated and
//! copied into a pool packet. The whole dispatch runs under the socket
//! table lock; control frames it emits (SYN-ACK, ACK, RST answers) go out
//! through the router while that lock is held, which is fine because link
//! drivers never call back into the stack from `transmit`.
//!
//! Ownership rule: once a packet is handed to `handle_ingress` it is freed
//! here, unless it is parked on a socket's receive queue for `recv`.

use log::{debug, error, warn};

use super::table::{SocketKind, SocketState, Table};
use crate::errors::RxError;
use crate::header::{Flags, Header, Priority};
use crate::pool::PacketRef;
use crate::stack::{NetStack, StackError};

pub(crate) fn handle_ingress(stack: &NetStack, packet: PacketRef) -> Result<(), RxError> {
    let header = Header::unpack(stack.pool().with(packet, |p| p.header()));
    let mut table = stack.sockets().lock();
    let slot = match table.find(header.dst_port, header.src_node, header.src_port) {
        Some(slot) => slot,
        None => {
            stack.pool().free(packet);
            return Err(RxError::NoSocket(format!(
                "port {} from {}:{}",
                header.dst_port, header.src_node, header.src_port
            )));
        }
    };

    let flags = header.flags;
    if flags.contains(Flags::RST) {
        handle_rst(stack, &mut table, slot, packet)
    } else if flags.contains(Flags::SYN | Flags::ACK) {
        handle_syn_ack(stack, &mut table, slot, &header, packet)
    } else if flags.contains(Flags::SYN) {
        handle_syn(stack, &mut table, slot, &header, packet)
    } else if flags.contains(Flags::ACK) {
        handle_ack(stack, &mut table, slot, packet)
    } else {
        handle_data(stack, &mut table, slot, &header, packet)
    }
}

/// Peer-initiated reset. Reliable sockets die on the spot; a null sentinel
/// on the receive queue unblocks any pending receiver. Datagram sockets
/// ignore resets.
fn handle_rst(
    stack: &NetStack,
    table: &mut Table,
    slot: usize,
    packet: PacketRef,
) -> Result<(), RxError> {
    let s = &mut table.slots[slot];
    match s.kind {
        SocketKind::Datagram => {
            warn!("ignoring RST on datagram port {}", s.local_port);
        }
        SocketKind::Reliable => {
            debug!("RST on port {}, closing", s.local_port);
            s.release();
            if let Some(queue) = &s.rx_queue {
                if queue.try_push(None).is_err() {
                    warn!("receive queue full, reset sentinel dropped");
                }
            }
        }
    }
    stack.pool().free(packet);
    Ok(())
}

/// SYN on a listener spawns a child socket in `SynReceived` and answers
/// SYN-ACK; SYN on a connected socket is a peer restart and resets the
/// conversation.
fn handle_syn(
    stack: &NetStack,
    table: &mut Table,
    slot: usize,
    header: &Header,
    packet: PacketRef,
) -> Result<(), RxError> {
    if table.slots[slot].kind != SocketKind::Reliable {
        warn!("dropping SYN aimed at a datagram socket");
        stack.pool().free(packet);
        return Ok(());
    }
    match table.slots[slot].state {
        SocketState::Listening => {
            let (local_node, local_port) = {
                let s = &table.slots[slot];
                (s.local_node, s.local_port)
            };
            let accept_queue = match table.slots[slot].accept_queue.clone() {
                Some(queue) => queue,
                None => {
                    stack.pool().free(packet);
                    return Ok(());
                }
            };
            let child = match table.allocate(SocketKind::Reliable, local_node, stack.pool()) {
                Some(child) => child,
                None => {
                    error!("no free socket slot for incoming connection");
                    stack.pool().free(packet);
                    return Ok(());
                }
            };
            {
                let c = &mut table.slots[child];
                c.local_port = local_port;
                c.peer = Some((header.src_node, header.src_port));
                c.state = SocketState::SynReceived;
            }
            if accept_queue.try_push(child).is_err() {
                error!("accept queue full on port {}, dropping SYN", local_port);
                table.slots[child].release();
                stack.pool().free(packet);
                return Ok(());
            }
            emit_control(
                stack,
                (header.src_node, header.src_port),
                (local_node, local_port),
                Flags::SYN | Flags::ACK,
                None,
            );
        }
        SocketState::Established | SocketState::SynReceived => {
            let s = &mut table.slots[slot];
            warn!("peer restart on port {}, resyncing", s.local_port);
            s.tx_seq = 0;
            s.rx_expected_seq = 0;
            s.drain_rx(stack.pool());
            s.state = SocketState::SynReceived;
            emit_control(
                stack,
                (header.src_node, header.src_port),
                (s.local_node, s.local_port),
                Flags::SYN | Flags::ACK,
                None,
            );
        }
        _ => {
            warn!("dropping SYN for socket in {:?}", table.slots[slot].state);
        }
    }
    stack.pool().free(packet);
    Ok(())
}

/// SYN-ACK completes the active side of the handshake: establish, answer
/// the final ACK and wake the blocked connector.
fn handle_syn_ack(
    stack: &NetStack,
    table: &mut Table,
    slot: usize,
    header: &Header,
    packet: PacketRef,
) -> Result<(), RxError> {
    let s = &mut table.slots[slot];
    if s.state == SocketState::SynSent {
        s.state = SocketState::Established;
        debug!("connection to {}:{} established", header.src_node, header.src_port);
        emit_control(
            stack,
            (header.src_node, header.src_port),
            (s.local_node, s.local_port),
            Flags::ACK,
            None,
        );
        if let Some(signal) = &s.signal {
            signal.raise();
        }
    } else {
        warn!("dropping stray SYN-ACK for socket in {:?}", s.state);
    }
    stack.pool().free(packet);
    Ok(())
}

/// A bare ACK either completes the passive side of the handshake or
/// acknowledges the single outstanding data segment.
fn handle_ack(
    stack: &NetStack,
    table: &mut Table,
    slot: usize,
    packet: PacketRef,
) -> Result<(), RxError> {
    let s = &mut table.slots[slot];
    match s.state {
        SocketState::SynReceived => {
            s.state = SocketState::Established;
            debug!("handshake on port {} complete", s.local_port);
        }
        SocketState::Established => {
            let acked = stack.pool().with(packet, |p| p.payload().first().copied());
            match acked {
                Some(seq) if seq == s.tx_seq => {
                    if let Some(signal) = &s.signal {
                        signal.raise();
                    }
                }
                Some(seq) => debug!("stale ACK for seq {}, waiting for {}", seq, s.tx_seq),
                None => debug!("empty ACK on established port {}", s.local_port),
            }
        }
        _ => debug!("dropping stray ACK for socket in {:?}", s.state),
    }
    stack.pool().free(packet);
    Ok(())
}

/// In-sequence data is queued for `recv` and acknowledged; out-of-sequence
/// data is re-acknowledged and dropped. Data reaching a socket still in
/// `SynReceived` means our final-ACK peer got reordered behind it, so the
/// socket is promoted first.
fn handle_data(
    stack: &NetStack,
    table: &mut Table,
    slot: usize,
    header: &Header,
    packet: PacketRef,
) -> Result<(), RxError> {
    if table.slots[slot].kind == SocketKind::Datagram {
        let s = &table.slots[slot];
        if let Some(queue) = &s.rx_queue {
            if queue.try_push(Some(packet)).is_err() {
                warn!("receive queue full on port {}, dropping datagram", s.local_port);
                stack.pool().free(packet);
            }
        } else {
            stack.pool().free(packet);
        }
        return Ok(());
    }

    if table.slots[slot].state == SocketState::SynReceived {
        debug!("data before final ACK on port {}, promoting", table.slots[slot].local_port);
        table.slots[slot].state = SocketState::Established;
    }
    if table.slots[slot].state != SocketState::Established {
        warn!("dropping data for socket in {:?}", table.slots[slot].state);
        stack.pool().free(packet);
        return Ok(());
    }

    let seq = match stack.pool().with(packet, |p| p.payload().first().copied()) {
        Some(seq) => seq,
        None => {
            warn!("reliable data frame without sequence byte");
            stack.pool().free(packet);
            return Ok(());
        }
    };
    let s = &mut table.slots[slot];
    let (local_node, local_port) = (s.local_node, s.local_port);
    if seq == s.rx_expected_seq {
        let queue = match &s.rx_queue {
            Some(queue) => queue.clone(),
            None => {
                stack.pool().free(packet);
                return Ok(());
            }
        };
        if queue.try_push(Some(packet)).is_err() {
            // No ACK either; the sender retries once we have room again.
            warn!("receive queue full on port {}, dropping segment {}", local_port, seq);
            stack.pool().free(packet);
            return Ok(());
        }
        s.rx_expected_seq = s.rx_expected_seq.wrapping_add(1);
        emit_control(
            stack,
            (header.src_node, header.src_port),
            (local_node, local_port),
            Flags::ACK,
            Some(seq),
        );
    } else {
        debug!(
            "out-of-sequence segment {} on port {}, expecting {}",
            seq, local_port, s.rx_expected_seq
        );
        emit_control(
            stack,
            (header.src_node, header.src_port),
            (local_node, local_port),
            Flags::ACK,
            Some(seq),
        );
        stack.pool().free(packet);
    }
    Ok(())
}

/// Builds and transmits a control frame (SYN, SYN-ACK, ACK, RST). An ACK
/// may carry the acknowledged sequence number as its single payload byte.
pub(crate) fn send_control(
    stack: &NetStack,
    dst: (u8, u8),
    src: (u8, u8),
    flags: Flags,
    seq: Option<u8>,
) -> Result<(), StackError> {
    let packet = match stack.pool().get() {
        Some(packet) => packet,
        None => {
            error!("pool exhausted, cannot emit {:?}", flags);
            return Err(StackError::PoolExhausted);
        }
    };
    stack.pool().with_mut(packet, |p| {
        p.set_header(Header::new(dst.0, src.0, dst.1, src.1, flags).pack(Priority::Normal));
        match seq {
            Some(seq) => p.set_payload(&[seq]),
            None => p.set_len(0),
        }
    });
    let result = stack.router().transmit(stack.pool(), packet);
    stack.pool().free(packet);
    result.map_err(StackError::Tx)
}

/// `send_control` for the state machine's answers, where a full pool or a
/// missing route only logs; the state machine never unwinds over it.
pub(crate) fn emit_control(stack: &NetStack, dst: (u8, u8), src: (u8, u8), flags: Flags, seq: Option<u8>) {
    if let Err(e) = send_control(stack, dst, src, flags, seq) {
        debug!("control frame {:?} not sent: {}", flags, e);
    }
}
