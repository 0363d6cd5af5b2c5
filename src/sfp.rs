//! SFP: in-order fragmentation and reassembly over reliable sockets.
//!
//! A message larger than one segment is split into fragments, each carrying
//! a one-byte fragment header in front of the user payload:
//!
//! ```text
//! bit 7    MORE   another fragment follows
//! bit 6    BEGIN  first fragment of a message
//! bits 5-0        fragment id, zero-based
//! ```
//!
//! Fragments ride the reliable send path, so arrival order equals send
//! order and reassembly only has to verify that ids count up. The id field
//! is 6 bits wide; the receiver compares under the same mask, which is what
//! allows up to [`SFP_MAX_FRAGMENTS`] fragments per message.
//!
//! SFP is refused on datagram sockets: without the ARQ underneath, a lost
//! or reordered fragment would fail reassembly silently.

use crate::pool::PacketRef;
use crate::socket::{Socket, SocketKind};
use crate::stack::StackError;
use crate::{HEADER_SIZE, MTU};

use std::time::Duration;

/// Set when another fragment follows.
pub const SFP_MORE: u8 = 0b1000_0000;

/// Set on the first fragment of a message.
pub const SFP_BEGIN: u8 = 0b0100_0000;

/// Mask for the fragment id bits.
pub const SFP_ID_MASK: u8 = 0b0011_1111;

/// Most fragments one message may occupy.
pub const SFP_MAX_FRAGMENTS: usize = 255;

/// User payload bytes per fragment.
pub const SFP_CHUNK: usize = MTU - HEADER_SIZE - 1;

impl Socket {
    /// Sends `data` as a fragmented message over a connected reliable
    /// socket. Each fragment is acknowledged before the next goes out. An
    /// empty message still sends one (empty) BEGIN fragment so the peer
    /// observes it.
    pub fn send_sfp(&self, data: &[u8]) -> Result<usize, StackError> {
        if self.kind() != SocketKind::Reliable {
            return Err(StackError::IllegalArgument);
        }
        let fragments = if data.is_empty() {
            1
        } else {
            (data.len() + SFP_CHUNK - 1) / SFP_CHUNK
        };
        if fragments > SFP_MAX_FRAGMENTS {
            return Err(StackError::TooLargePayload);
        }
        for index in 0..fragments {
            let start = index * SFP_CHUNK;
            let end = (start + SFP_CHUNK).min(data.len());
            let mut sfp = (index as u8) & SFP_ID_MASK;
            if index == 0 {
                sfp |= SFP_BEGIN;
            }
            if index + 1 < fragments {
                sfp |= SFP_MORE;
            }
            self.send_reliable(Some(sfp), &data[start..end])?;
        }
        Ok(data.len())
    }

    /// Receives one fragmented message and returns it as a packet chain in
    /// fragment order, fragment headers stripped. Ownership of the chain
    /// transfers to the caller; free it with
    /// [`crate::pool::PacketPool::free_chain`].
    ///
    /// `timeout` bounds the wait for each fragment. A fragment out of
    /// sequence aborts the reassembly: the partial chain is freed and
    /// [`StackError::BadFragment`] is returned.
    pub fn recv_sfp(&self, timeout: Option<Duration>) -> Result<PacketRef, StackError> {
        if self.kind() != SocketKind::Reliable {
            return Err(StackError::IllegalArgument);
        }
        let pool = self.stack.pool().clone();
        let mut head: Option<PacketRef> = None;
        let mut tail: Option<PacketRef> = None;
        let mut expected: u8 = 0;
        loop {
            let packet = match self.recv_packet(timeout) {
                Ok(packet) => packet,
                Err(e) => {
                    pool.free_chain(head);
                    return Err(e);
                }
            };
            let sfp = match pool.with(packet, |p| p.payload().first().copied()) {
                Some(sfp) => sfp,
                None => {
                    pool.free(packet);
                    pool.free_chain(head);
                    return Err(StackError::BadFragment);
                }
            };
            let id = sfp & SFP_ID_MASK;
            let begin = sfp & SFP_BEGIN != 0;
            let more = sfp & SFP_MORE != 0;
            let in_order = match head {
                None => begin && id == 0,
                Some(_) => !begin && id == expected & SFP_ID_MASK,
            };
            if !in_order {
                pool.free(packet);
                pool.free_chain(head);
                return Err(StackError::BadFragment);
            }
            pool.with_mut(packet, |p| p.strip_front(1));
            match tail {
                None => head = Some(packet),
                Some(tail) => pool.with_mut(tail, |p| p.set_next(Some(packet))),
            }
            tail = Some(packet);
            expected = expected.wrapping_add(1);
            if !more {
                // head is always Some by now.
                return head.ok_or(StackError::BadFragment);
            }
        }
    }
}
