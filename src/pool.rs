//! The static packet buffer pool.
//!
//! The pool is an arena of [`POOL_SIZE`] packet records. Callers never hold
//! references into the arena; they hold [`PacketRef`] handles minted by
//! [`PacketPool::get`] and give them back with [`PacketPool::free`] or
//! [`PacketPool::free_chain`]. A free-index stack plus a held bitmap under
//! one mutex makes double free a detected, logged no-op instead of
//! corruption.
//!
//! Pool exhaustion is a normal condition: `get` returns `None`, ingress uses
//! it to drop frames and senders use it to fail. Nothing here panics on
//! caller mistakes.

use std::sync::{Arc, Mutex};

use log::{error, warn};

use crate::header;
use crate::util::lock_ok;
use crate::{LinkId, HEADER_SIZE, MTU, POOL_SIZE};

/// Handle to one packet in a [`PacketPool`]. Handles are only minted by
/// `get` and are meaningful only for the pool that minted them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketRef(usize);

impl PacketRef {
    #[cfg(test)]
    pub(crate) fn forged(index: usize) -> PacketRef {
        PacketRef(index)
    }

    /// The arena index of this packet.
    pub fn index(&self) -> usize {
        self.0
    }
}

/// One frame plus its stack-side metadata: the packed header word, the valid
/// payload length, the link the frame arrived on and an optional successor
/// handle for chain building.
pub struct Packet {
    header: u32,
    length: usize,
    payload: [u8; MTU],
    rx_link: Option<LinkId>,
    next: Option<PacketRef>,
}

impl Packet {
    fn blank() -> Packet {
        Packet {
            header: 0,
            length: 0,
            payload: [0; MTU],
            rx_link: None,
            next: None,
        }
    }

    /// The packed header word. See [`crate::header`] for the layout.
    pub fn header(&self) -> u32 {
        self.header
    }

    pub fn set_header(&mut self, word: u32) {
        self.header = word;
    }

    /// The valid payload bytes.
    pub fn payload(&self) -> &[u8] {
        &self.payload[..self.length]
    }

    /// The full payload buffer, for callers filling a packet in place.
    /// Follow up with [`Packet::set_len`].
    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.payload
    }

    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Sets the valid payload length. `len` must not exceed [`MTU`].
    pub fn set_len(&mut self, len: usize) {
        assert!(len <= MTU);
        self.length = len;
    }

    /// Copies `data` into the payload and sets the length accordingly.
    pub fn set_payload(&mut self, data: &[u8]) {
        assert!(data.len() <= MTU);
        self.payload[..data.len()].copy_from_slice(data);
        self.length = data.len();
    }

    /// The link this packet arrived on. `None` on packets built for transmit.
    pub fn rx_link(&self) -> Option<LinkId> {
        self.rx_link
    }

    pub(crate) fn set_rx_link(&mut self, link: Option<LinkId>) {
        self.rx_link = link;
    }

    /// The successor in a packet chain, if any.
    pub fn next(&self) -> Option<PacketRef> {
        self.next
    }

    pub fn set_next(&mut self, next: Option<PacketRef>) {
        self.next = next;
    }

    /// Drops the first `n` payload bytes, shifting the rest down.
    pub(crate) fn strip_front(&mut self, n: usize) {
        if n >= self.length {
            self.length = 0;
            return;
        }
        self.payload.copy_within(n..self.length, 0);
        self.length -= n;
    }

    /// Shifts the payload up one byte and places `byte` in front. The
    /// payload must leave one byte of headroom.
    pub(crate) fn insert_front(&mut self, byte: u8) {
        assert!(self.length < MTU);
        self.payload.copy_within(..self.length, 1);
        self.payload[0] = byte;
        self.length += 1;
    }

    /// Length of this packet's frame on the wire.
    pub fn frame_len(&self) -> usize {
        HEADER_SIZE + self.length
    }

    /// Serializes the frame (little-endian header word, then payload) into
    /// `buf` and returns the frame length. `buf` must hold `frame_len`
    /// bytes.
    pub fn write_frame(&self, buf: &mut [u8]) -> usize {
        header::write_word(self.header, buf);
        buf[HEADER_SIZE..self.frame_len()].copy_from_slice(self.payload());
        self.frame_len()
    }
}

struct PoolState {
    free: Vec<usize>,
    held: [bool; POOL_SIZE],
}

struct PoolShared {
    slots: Vec<Mutex<Packet>>,
    state: Mutex<PoolState>,
}

/// Fixed-capacity packet allocator. Cheap to clone; clones share the arena.
#[derive(Clone)]
pub struct PacketPool {
    shared: Arc<PoolShared>,
}

impl PacketPool {
    pub fn new() -> PacketPool {
        let slots = (0..POOL_SIZE).map(|_| Mutex::new(Packet::blank())).collect();
        let state = PoolState {
            free: (0..POOL_SIZE).rev().collect(),
            held: [false; POOL_SIZE],
        };
        PacketPool {
            shared: Arc::new(PoolShared {
                slots,
                state: Mutex::new(state),
            }),
        }
    }

    /// Takes a packet out of the free set. The handle comes back with `next`
    /// cleared; payload contents are whatever the previous holder left, so
    /// set the length before use. Returns `None` when the pool is empty.
    pub fn get(&self) -> Option<PacketRef> {
        let index = {
            let mut state = lock_ok(&self.shared.state);
            match state.free.pop() {
                Some(index) => {
                    state.held[index] = true;
                    index
                }
                None => return None,
            }
        };
        {
            let mut packet = lock_ok(&self.shared.slots[index]);
            packet.set_next(None);
            packet.set_rx_link(None);
        }
        Some(PacketRef(index))
    }

    /// Returns a packet to the free set. A handle that does not belong to
    /// this pool's arena or is already free is logged and ignored; the pool
    /// is never corrupted.
    pub fn free(&self, packet: PacketRef) {
        let index = packet.0;
        if index >= POOL_SIZE {
            error!("free of packet {} outside the pool arena", index);
            return;
        }
        let mut state = lock_ok(&self.shared.state);
        if !state.held[index] {
            warn!("double free of packet {}", index);
            return;
        }
        state.held[index] = false;
        state.free.push(index);
    }

    /// Walks the `next` chain starting at `head` and frees every packet.
    /// Tolerates `None`.
    pub fn free_chain(&self, head: Option<PacketRef>) {
        let mut cursor = head;
        while let Some(packet) = cursor {
            if packet.0 >= POOL_SIZE {
                error!("free of packet {} outside the pool arena", packet.0);
                return;
            }
            cursor = self.with(packet, |p| p.next());
            self.free(packet);
        }
    }

    /// Number of packets currently in the free set.
    pub fn free_count(&self) -> usize {
        lock_ok(&self.shared.state).free.len()
    }

    /// Runs `f` with shared access to the packet behind `packet`.
    pub fn with<R>(&self, packet: PacketRef, f: impl FnOnce(&Packet) -> R) -> R {
        f(&lock_ok(&self.shared.slots[packet.0]))
    }

    /// Runs `f` with exclusive access to the packet behind `packet`.
    pub fn with_mut<R>(&self, packet: PacketRef, f: impl FnOnce(&mut Packet) -> R) -> R {
        f(&mut lock_ok(&self.shared.slots[packet.0]))
    }
}

impl Default for PacketPool {
    fn default() -> PacketPool {
        PacketPool::new()
    }
}
