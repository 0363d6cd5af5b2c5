// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! # Ranp - Rust addressable node protocol
//!
//! `ranp` is a small transport stack for flat networks of up to 256 nodes,
//! written for constrained targets (microcontrollers and simulation hosts).
//! It exposes a socket-style API with a connection-oriented reliable
//! transport (three-way handshake plus stop-and-wait ARQ) and a
//! connectionless datagram transport, both running over user-pluggable link
//! drivers.
//!
//! The stack owns no I/O of its own. A link driver implements the [`Link`]
//! trait, registers itself with [`NetStack::add_link`] and feeds received
//! frames back in through [`NetStack::input`] (usually from a thread spawned
//! with [`rx::spawn`]). Everything in between - the packet pool, the route
//! table, the socket table and the connection state machine - is this crate.
//!
//! ## Usage
//!
//! ```rust
//! use ranp::{NetStack, StackConfig, SocketKind};
//!
//! let stack = NetStack::new(StackConfig { local_node: 50 });
//! ranp::testing::loopback(&stack, "lo0").unwrap();
//! stack.load_routes("50:lo0").unwrap();
//!
//! let server = stack.socket(SocketKind::Reliable).unwrap();
//! server.bind(10).unwrap();
//! server.listen(5).unwrap();
//! ```
//!
//! ## Features
//!
//! - [x] Bit-exact 32-bit header codec, little-endian on the wire
//! - [x] Static packet pool with double-free detection and chain free
//! - [x] Named link registry and text-loaded route table
//! - [x] Reliable sockets: handshake, stop-and-wait ARQ, reset propagation
//! - [x] Datagram sockets with source capture and optional default peer
//! - [x] In-order fragmentation and reassembly (SFP) over reliable sockets
//! - [x] Zero-copy send/receive variants trafficking in pool handles
//! - [ ] Sliding-window reliability
//! - [ ] Multi-hop routing
//!
//! ## Architecture and terminology
//!
//! ### Sending
//!
//! A send call packs the 32-bit header into a pool packet, hands it to the
//! router for a destination-node lookup and MTU check, and the router invokes
//! the chosen link's `transmit`. Reliable sends then park on a per-socket
//! signal until the peer's ACK arrives or the retries run out.
//!
//! ### Receiving
//!
//! Link drivers deliver whole frames. [`NetStack::input`] validates the
//! frame, copies it into a pool packet and hands it to the socket layer,
//! which matches it against the socket table - exact peer match first, then
//! a listener or datagram wildcard - and runs the connection state machine.
//! Data ends up in a bounded per-socket receive queue that `recv` drains.
//!
//! Drivers never call into the stack from inside `transmit`; channel-backed
//! drivers (see [`testing`]) enqueue frames and let a thread spawned with
//! [`rx::spawn`] feed them back in. This keeps the socket lock out of the
//! transmit path, so none of the stack's locks need to be reentrant.
//!
//! ### Tests
//!
//! Unit tests live in `#[cfg(test)]` modules next to the code they test.
//! Integration tests under `tests/` drive whole stacks over the mock and
//! loopback links from the [`testing`] module.

use std::io;
use std::time::Duration;

pub mod header;
pub mod pool;
pub mod rx;
pub mod sfp;
pub mod testing;

mod errors;
mod routing;
mod socket;
mod stack;
mod util;

pub use crate::errors::{RxError, TxError};
pub use crate::routing::RouteLoadError;
pub use crate::socket::{Socket, SocketKind, SocketState};
pub use crate::stack::{NetStack, StackConfig, StackError};

use crate::pool::Packet;

/// Payload capacity of one packet, in bytes.
pub const MTU: usize = 128;

/// Size of the packed header on the wire, in bytes.
pub const HEADER_SIZE: usize = 4;

/// Largest frame a link may deliver or be asked to transmit.
pub const MAX_FRAME: usize = HEADER_SIZE + MTU;

/// Number of packets in the buffer pool.
pub const POOL_SIZE: usize = 20;

/// Number of slots in the socket table.
pub const MAX_SOCKETS: usize = 20;

/// Exclusive upper bound on port numbers. Valid ports are `1..MAX_PORTS`.
pub const MAX_PORTS: u8 = 64;

/// Maximum number of entries in the route table.
pub const MAX_NODES: usize = 256;

/// How many times a reliable send is attempted before giving up.
pub const RETRY_LIMIT: usize = 3;

/// How long a reliable sender or connector waits for the peer's answer.
pub const ACK_TIMEOUT: Duration = Duration::from_millis(500);

/// Depth of the per-socket receive queue.
pub const RECV_QUEUE_DEPTH: usize = 10;

/// Depth of the per-listener accept queue.
pub const ACCEPT_QUEUE_DEPTH: usize = 5;

/// Identifies a registered link within one stack. Returned by
/// [`NetStack::add_link`] and passed back by drivers on every received frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkId(pub(crate) usize);

impl LinkId {
    /// The registry index of this link.
    pub fn index(&self) -> usize {
        self.0
    }
}

/// Contract between the stack and a link driver.
///
/// A driver provides a stable name, the local node id as seen by this link,
/// an MTU covering header plus payload, and a transmit callback. `transmit`
/// must neither retain the packet reference past return nor mutate it. On
/// receive, the driver hands whole frames to [`NetStack::input`] with the
/// precise frame length.
pub trait Link: Send + Sync {
    /// Human-readable name, unique within one stack. Route rules refer to
    /// links by this name.
    fn name(&self) -> &str;

    /// The local node id on this link.
    fn address(&self) -> u8;

    /// Largest frame (header plus payload) this link can carry.
    fn mtu(&self) -> usize;

    /// Puts one frame on the wire. Called with the route lock held; the
    /// driver must not call back into the stack from here.
    fn transmit(&self, packet: &Packet) -> io::Result<()>;
}
