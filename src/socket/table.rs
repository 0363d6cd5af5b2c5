//! The fixed pool of socket slots: allocation, port binding and ingress
//! matching.

use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, error};

use crate::pool::{PacketPool, PacketRef};
use crate::stack::StackError;
use crate::util::{lock_ok, BoundedQueue, Signal};
use crate::{ACCEPT_QUEUE_DEPTH, MAX_PORTS, MAX_SOCKETS, RECV_QUEUE_DEPTH};

/// Which transport a socket speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketKind {
    /// Connection-oriented, three-way handshake, stop-and-wait ARQ.
    Reliable,
    /// Connectionless datagrams with optional default peer.
    Datagram,
}

/// Connection state of a socket slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    Closed,
    Open,
    Listening,
    SynSent,
    SynReceived,
    Established,
}

/// A message on the receive queue: a packet handle, or `None` as the reset
/// sentinel that unblocks a pending receiver.
pub(crate) type RxMessage = Option<PacketRef>;

pub(crate) struct Slot {
    pub state: SocketState,
    pub kind: SocketKind,
    pub local_node: u8,
    pub local_port: u8,
    pub peer: Option<(u8, u8)>,
    pub tx_seq: u8,
    pub rx_expected_seq: u8,
    // Persistent handles: they outlive close() and are reused when the slot
    // is next allocated.
    pub rx_queue: Option<Arc<BoundedQueue<RxMessage>>>,
    pub accept_queue: Option<Arc<BoundedQueue<usize>>>,
    pub signal: Option<Arc<Signal>>,
}

impl Slot {
    fn empty() -> Slot {
        Slot {
            state: SocketState::Closed,
            kind: SocketKind::Datagram,
            local_node: 0,
            local_port: 0,
            peer: None,
            tx_seq: 0,
            rx_expected_seq: 0,
            rx_queue: None,
            accept_queue: None,
            signal: None,
        }
    }

    /// Whether this slot is past `connect`/SYN in the reliable state
    /// machine. Such sockets answer to an exact peer match and emit RST on
    /// close.
    pub fn in_connected_states(&self) -> bool {
        matches!(
            self.state,
            SocketState::SynSent | SocketState::SynReceived | SocketState::Established
        )
    }

    /// Returns the slot to the free set. Queues and signal stay allocated.
    pub fn release(&mut self) {
        self.state = SocketState::Closed;
        self.local_port = 0;
        self.peer = None;
    }

    /// Frees every packet sitting in the receive queue and drops pending
    /// sentinels.
    pub fn drain_rx(&self, pool: &PacketPool) {
        if let Some(queue) = &self.rx_queue {
            for message in queue.drain() {
                if let Some(packet) = message {
                    pool.free(packet);
                }
            }
        }
    }
}

pub(crate) struct Table {
    pub slots: Vec<Slot>,
    next_ephemeral: u8,
}

/// The socket table. One plain (non-reentrant) mutex guards every slot plus
/// the allocator and matcher; the ingress state machine runs under it.
pub(crate) struct SocketTable {
    inner: Mutex<Table>,
}

impl SocketTable {
    pub fn new() -> SocketTable {
        SocketTable {
            inner: Mutex::new(Table {
                slots: (0..MAX_SOCKETS).map(|_| Slot::empty()).collect(),
                next_ephemeral: 1,
            }),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, Table> {
        lock_ok(&self.inner)
    }
}

impl Table {
    /// Claims the first free slot for a new socket. Persistent handles are
    /// created on the slot's first use and any stale messages from an
    /// earlier life of the slot are drained, with packets returned to the
    /// pool.
    pub fn allocate(&mut self, kind: SocketKind, local_node: u8, pool: &PacketPool) -> Option<usize> {
        let index = self
            .slots
            .iter()
            .position(|s| s.state == SocketState::Closed && s.local_port == 0)?;
        let slot = &mut self.slots[index];
        slot.state = SocketState::Open;
        slot.kind = kind;
        slot.local_node = local_node;
        slot.local_port = 0;
        slot.peer = None;
        slot.tx_seq = 0;
        slot.rx_expected_seq = 0;
        if slot.rx_queue.is_none() {
            slot.rx_queue = Some(Arc::new(BoundedQueue::new(RECV_QUEUE_DEPTH)));
        }
        if slot.accept_queue.is_none() {
            slot.accept_queue = Some(Arc::new(BoundedQueue::new(ACCEPT_QUEUE_DEPTH)));
        }
        if slot.signal.is_none() {
            slot.signal = Some(Arc::new(Signal::new()));
        }
        slot.drain_rx(pool);
        if let Some(queue) = &slot.accept_queue {
            let stale = queue.drain();
            if !stale.is_empty() {
                debug!("dropping {} stale accept entries from slot {}", stale.len(), index);
            }
        }
        if let Some(signal) = &slot.signal {
            signal.clear();
        }
        Some(index)
    }

    /// Binds `slot` to a local port. Port 0 picks an ephemeral port from
    /// the persistent scan cursor; the cursor only advances past a port
    /// that was actually handed out, which keeps the sequence of ephemeral
    /// ports predictable.
    pub fn bind(&mut self, slot: usize, port: u8) -> Result<(), StackError> {
        if self.slots[slot].state == SocketState::Closed || self.slots[slot].local_port != 0 {
            return Err(StackError::IllegalArgument);
        }
        if port == 0 {
            let span = usize::from(MAX_PORTS - 1);
            for offset in 0..span {
                let candidate = 1 + ((usize::from(self.next_ephemeral) - 1 + offset) % span) as u8;
                if !self.port_in_use(candidate) {
                    self.slots[slot].local_port = candidate;
                    self.next_ephemeral = if candidate + 1 >= MAX_PORTS { 1 } else { candidate + 1 };
                    return Ok(());
                }
            }
            error!("no free ephemeral port");
            return Err(StackError::NoFreePort);
        }
        if port >= MAX_PORTS {
            return Err(StackError::InvalidPort);
        }
        if self.port_in_use(port) {
            return Err(StackError::PortInUse);
        }
        self.slots[slot].local_port = port;
        Ok(())
    }

    pub fn port_in_use(&self, port: u8) -> bool {
        self.slots
            .iter()
            .any(|s| s.state != SocketState::Closed && s.local_port == port)
    }

    /// Matches an incoming frame to a socket slot: an exact peer match on a
    /// connected or handshaking socket wins; otherwise a listener (reliable)
    /// or an open datagram socket on the local port. The table never holds
    /// two wildcards for one port, so the first wildcard hit is enough.
    pub fn find(&self, local_port: u8, src_node: u8, src_port: u8) -> Option<usize> {
        let exact = self.slots.iter().position(|s| {
            s.local_port == local_port
                && s.peer == Some((src_node, src_port))
                && s.in_connected_states()
        });
        if exact.is_some() {
            return exact;
        }
        self.slots.iter().position(|s| {
            s.local_port == local_port
                && match s.kind {
                    SocketKind::Reliable => s.state == SocketState::Listening,
                    SocketKind::Datagram => s.state == SocketState::Open,
                }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::POOL_SIZE;

    fn table() -> (Table, PacketPool) {
        let slots = (0..MAX_SOCKETS).map(|_| Slot::empty()).collect();
        (
            Table {
                slots,
                next_ephemeral: 1,
            },
            PacketPool::new(),
        )
    }

    #[test]
    fn allocate_until_exhausted() {
        let (mut table, pool) = table();
        for _ in 0..MAX_SOCKETS {
            assert!(table.allocate(SocketKind::Reliable, 5, &pool).is_some());
        }
        assert_eq!(table.allocate(SocketKind::Reliable, 5, &pool), None);
    }

    #[test]
    fn allocate_reuses_released_slots_and_frees_stale_packets() {
        let (mut table, pool) = table();
        let index = table.allocate(SocketKind::Reliable, 5, &pool).unwrap();
        let stale = pool.get().unwrap();
        table.slots[index]
            .rx_queue
            .as_ref()
            .unwrap()
            .try_push(Some(stale))
            .unwrap();
        table.slots[index].release();

        let again = table.allocate(SocketKind::Datagram, 5, &pool).unwrap();
        assert_eq!(again, index);
        assert_eq!(pool.free_count(), POOL_SIZE);
    }

    #[test]
    fn bind_boundaries() {
        let (mut table, pool) = table();
        let a = table.allocate(SocketKind::Reliable, 5, &pool).unwrap();
        let b = table.allocate(SocketKind::Reliable, 5, &pool).unwrap();
        assert!(matches!(
            table.bind(a, MAX_PORTS),
            Err(StackError::InvalidPort)
        ));
        table.bind(a, MAX_PORTS - 1).unwrap();
        assert!(matches!(
            table.bind(b, MAX_PORTS - 1),
            Err(StackError::PortInUse)
        ));
    }

    #[test]
    fn ephemeral_ports_are_predictable() {
        let (mut table, pool) = table();
        let a = table.allocate(SocketKind::Datagram, 5, &pool).unwrap();
        let b = table.allocate(SocketKind::Datagram, 5, &pool).unwrap();
        table.bind(a, 0).unwrap();
        table.bind(b, 0).unwrap();
        assert_eq!(table.slots[a].local_port, 1);
        assert_eq!(table.slots[b].local_port, 2);

        // Releasing port 1 does not make the cursor walk backwards.
        table.slots[a].release();
        let c = table.allocate(SocketKind::Datagram, 5, &pool).unwrap();
        table.bind(c, 0).unwrap();
        assert_eq!(table.slots[c].local_port, 3);
    }

    #[test]
    fn ephemeral_scan_skips_bound_ports() {
        let (mut table, pool) = table();
        let a = table.allocate(SocketKind::Datagram, 5, &pool).unwrap();
        table.bind(a, 1).unwrap();
        let b = table.allocate(SocketKind::Datagram, 5, &pool).unwrap();
        table.bind(b, 0).unwrap();
        assert_eq!(table.slots[b].local_port, 2);
    }

    #[test]
    fn exact_match_beats_wildcard() {
        let (mut table, pool) = table();
        let listener = table.allocate(SocketKind::Reliable, 5, &pool).unwrap();
        table.bind(listener, 10).unwrap();
        table.slots[listener].state = SocketState::Listening;

        let child = table.allocate(SocketKind::Reliable, 5, &pool).unwrap();
        table.slots[child].local_port = 10;
        table.slots[child].peer = Some((7, 11));
        table.slots[child].state = SocketState::Established;

        assert_eq!(table.find(10, 7, 11), Some(child));
        assert_eq!(table.find(10, 7, 12), Some(listener));
        assert_eq!(table.find(9, 7, 11), None);
    }

    #[test]
    fn datagram_wildcard_requires_open_state() {
        let (mut table, pool) = table();
        let socket = table.allocate(SocketKind::Datagram, 5, &pool).unwrap();
        table.bind(socket, 20).unwrap();
        assert_eq!(table.find(20, 1, 2), Some(socket));
        table.slots[socket].release();
        assert_eq!(table.find(20, 1, 2), None);
    }
}
