//! The stack handle tying pool, router and socket table together.

use std::error::Error;
use std::fmt;
use std::fmt::Write as _;
use std::sync::Arc;

use log::{debug, error};

use crate::errors::{RxError, TxError};
use crate::header::{self, Header};
use crate::pool::PacketPool;
use crate::routing::{RouteLoadError, Router};
use crate::socket::machine;
use crate::socket::table::SocketTable;
use crate::socket::{Socket, SocketKind, SocketState};
use crate::{Link, LinkId, HEADER_SIZE, MTU, POOL_SIZE};

/// Error returned upon invalid usage or state of the stack.
#[derive(Debug)]
pub enum StackError {
    /// A required argument was missing, out of range or the call does not
    /// apply to the socket's current state.
    IllegalArgument,

    /// The operation is only valid on the other socket kind.
    WrongSocketType,

    /// The port is at or above [`crate::MAX_PORTS`].
    InvalidPort,

    /// The port is bound by another non-closed socket.
    PortInUse,

    /// The ephemeral scan found every port taken.
    NoFreePort,

    /// The socket table has no free slot.
    NoFreeSocket,

    /// The packet pool has no free packet.
    PoolExhausted,

    /// The payload does not fit one frame.
    TooLargePayload,

    /// The socket is not connected (or has no default peer).
    NotConnected,

    /// A blocking call reached its deadline.
    Timeout,

    /// The peer reset the connection.
    ConnectionReset,

    /// A fragment arrived out of sequence during reassembly.
    BadFragment,

    /// The egress path failed underneath the socket layer.
    Tx(TxError),
}

impl From<TxError> for StackError {
    fn from(e: TxError) -> StackError {
        StackError::Tx(e)
    }
}

impl fmt::Display for StackError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        use self::StackError::*;
        match *self {
            IllegalArgument => write!(fmt, "illegal argument"),
            WrongSocketType => write!(fmt, "wrong socket type for this call"),
            InvalidPort => write!(fmt, "port out of range"),
            PortInUse => write!(fmt, "port already in use"),
            NoFreePort => write!(fmt, "no free ephemeral port"),
            NoFreeSocket => write!(fmt, "no free socket slot"),
            PoolExhausted => write!(fmt, "packet pool exhausted"),
            TooLargePayload => write!(fmt, "payload too large for one frame"),
            NotConnected => write!(fmt, "socket is not connected"),
            Timeout => write!(fmt, "operation timed out"),
            ConnectionReset => write!(fmt, "connection reset by peer"),
            BadFragment => write!(fmt, "fragment out of sequence"),
            Tx(ref e) => write!(fmt, "transmit failed: {}", e),
        }
    }
}

impl Error for StackError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        if let StackError::Tx(ref e) = *self {
            Some(e)
        } else {
            None
        }
    }
}

/// Stack-wide configuration, fixed at construction.
#[derive(Debug, Clone, Copy)]
pub struct StackConfig {
    /// This stack's node id. Links must present the same address.
    pub local_node: u8,
}

struct StackInner {
    local_node: u8,
    pool: PacketPool,
    router: Router,
    sockets: SocketTable,
}

/// One instance of the stack. Cheap to clone; clones share all state, so a
/// clone can be handed to every link driver and caller thread.
#[derive(Clone)]
pub struct NetStack {
    inner: Arc<StackInner>,
}

impl NetStack {
    pub fn new(config: StackConfig) -> NetStack {
        NetStack {
            inner: Arc::new(StackInner {
                local_node: config.local_node,
                pool: PacketPool::new(),
                router: Router::new(),
                sockets: SocketTable::new(),
            }),
        }
    }

    /// This stack's node id.
    pub fn local_node(&self) -> u8 {
        self.inner.local_node
    }

    /// The packet pool, for callers on the zero-copy paths.
    pub fn pool(&self) -> &PacketPool {
        &self.inner.pool
    }

    /// Registers a link driver. See [`Link`] for the contract.
    pub fn add_link(&self, link: Arc<dyn Link>) -> Result<LinkId, StackError> {
        self.inner.router.add_link(link)
    }

    /// Finds a registered link by name.
    pub fn link_by_name(&self, name: &str) -> Option<LinkId> {
        self.inner.router.link_by_name(name)
    }

    /// Atomically replaces the route table from a textual rule set; see
    /// [`crate::RouteLoadError`] for the grammar and failure modes. On
    /// failure the table is left empty.
    pub fn load_routes(&self, text: &str) -> Result<(), RouteLoadError> {
        self.inner.router.load(text)
    }

    /// Opens a socket of the given kind.
    pub fn socket(&self, kind: SocketKind) -> Result<Socket, StackError> {
        let mut table = self.inner.sockets.lock();
        match table.allocate(kind, self.inner.local_node, &self.inner.pool) {
            Some(slot) => Ok(Socket {
                stack: self.clone(),
                slot,
            }),
            None => {
                error!("socket table exhausted");
                Err(StackError::NoFreeSocket)
            }
        }
    }

    /// Ingress entry point for link drivers: one whole frame as received on
    /// `link`. Frames shorter than the header are dropped without touching
    /// the pool; frames for another node are dropped without reaching the
    /// socket layer. A delivered packet is owned by the socket layer from
    /// here on.
    pub fn input(&self, link: LinkId, frame: &[u8]) -> Result<(), RxError> {
        if frame.len() < HEADER_SIZE {
            return Err(RxError::FrameTooShort);
        }
        if frame.len() - HEADER_SIZE > MTU {
            return Err(RxError::FrameTooLong);
        }
        let link_address = match self.inner.router.link(link) {
            Some(driver) => driver.address(),
            None => return Err(RxError::UnknownLink),
        };
        let packet = match self.inner.pool.get() {
            Some(packet) => packet,
            None => return Err(RxError::PoolExhausted),
        };
        self.inner.pool.with_mut(packet, |p| {
            p.set_header(header::read_word(frame));
            p.set_payload(&frame[HEADER_SIZE..]);
            p.set_rx_link(Some(link));
        });
        let dst_node = Header::unpack(self.inner.pool.with(packet, |p| p.header())).dst_node;
        if dst_node != link_address {
            debug!("frame for node {} on a link addressed {}", dst_node, link_address);
            self.inner.pool.free(packet);
            return Err(RxError::WrongDestination(dst_node));
        }
        machine::handle_ingress(self, packet)
    }

    /// Writes a human-readable summary of the socket table, the pool and
    /// the route table. Observational only.
    pub fn print_stats(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        let mut sockets = String::new();
        let mut active = 0;
        {
            let table = self.inner.sockets.lock();
            for (index, slot) in table.slots.iter().enumerate() {
                if slot.state == SocketState::Closed {
                    continue;
                }
                active += 1;
                write!(sockets, "  [{}] {:?} {:?} port {}", index, slot.kind, slot.state, slot.local_port)?;
                if let Some((node, port)) = slot.peer {
                    write!(sockets, " peer {}:{}", node, port)?;
                }
                if slot.kind == SocketKind::Reliable {
                    write!(sockets, " tx_seq {} rx_seq {}", slot.tx_seq, slot.rx_expected_seq)?;
                }
                sockets.push('\n');
            }
        }
        writeln!(out, "node {}", self.inner.local_node)?;
        writeln!(out, "sockets: {} active", active)?;
        out.write_str(&sockets)?;
        writeln!(out, "pool: {}/{} packets free", self.inner.pool.free_count(), POOL_SIZE)?;
        writeln!(
            out,
            "routes: {} entries over {} links",
            self.inner.router.route_count(),
            self.inner.router.link_count()
        )
    }

    pub(crate) fn sockets(&self) -> &SocketTable {
        &self.inner.sockets
    }

    pub(crate) fn router(&self) -> &Router {
        &self.inner.router
    }
}
