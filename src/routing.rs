//! The link registry and the destination-node route table.
//!
//! Both live under one routing mutex: a route is only meaningful while the
//! link it names is registered, so the table and the registry are one
//! critical section. The table maps destination nodes to links and is only
//! ever replaced wholesale by [`Router::load`]; a rejected rule set leaves
//! the table empty rather than half-updated, so a stale route can never be
//! silently reused.

use std::error::Error;
use std::fmt;
use std::sync::{Arc, Mutex};

use log::{debug, error};

use crate::errors::TxError;
use crate::header::Header;
use crate::pool::{PacketPool, PacketRef};
use crate::stack::StackError;
use crate::util::lock_ok;
use crate::{Link, LinkId, HEADER_SIZE, MAX_NODES};

/// Why a route rule set was rejected. Any rejection clears the table.
#[derive(Debug, PartialEq, Eq)]
pub enum RouteLoadError {
    /// An entry has no `:` between destination and link name.
    MissingSeparator(String),

    /// An entry's destination token is empty.
    EmptyDestination(String),

    /// An entry's link-name token is empty.
    EmptyLinkName(String),

    /// An entry's destination is not a number within `u16`.
    BadDestination(String),

    /// An entry names a link that is not registered.
    UnknownLink(String),

    /// The rule set names more destinations than the table can hold.
    TableFull,
}

impl fmt::Display for RouteLoadError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        use self::RouteLoadError::*;
        match *self {
            MissingSeparator(ref entry) => write!(fmt, "entry {:?} has no ':'", entry),
            EmptyDestination(ref entry) => write!(fmt, "entry {:?} has an empty destination", entry),
            EmptyLinkName(ref entry) => write!(fmt, "entry {:?} has an empty link name", entry),
            BadDestination(ref token) => write!(fmt, "destination {:?} is not a u16", token),
            UnknownLink(ref name) => write!(fmt, "link {:?} is not registered", name),
            TableFull => write!(fmt, "rule set exceeds the route table capacity"),
        }
    }
}

impl Error for RouteLoadError {}

struct RouteEntry {
    dest: u16,
    link: LinkId,
}

struct RouterData {
    links: Vec<Arc<dyn Link>>,
    routes: Vec<RouteEntry>,
}

/// The registry of links and the route table over them.
pub(crate) struct Router {
    data: Mutex<RouterData>,
}

impl Router {
    pub fn new() -> Router {
        Router {
            data: Mutex::new(RouterData {
                links: Vec::new(),
                routes: Vec::new(),
            }),
        }
    }

    /// Registers a link. Rejects an empty name, a duplicate name and an MTU
    /// smaller than the packed header.
    pub fn add_link(&self, link: Arc<dyn Link>) -> Result<LinkId, StackError> {
        let mut data = lock_ok(&self.data);
        if link.name().is_empty() {
            error!("refusing to register a link with an empty name");
            return Err(StackError::IllegalArgument);
        }
        if link.mtu() < HEADER_SIZE {
            error!("link {} has MTU {} below header size", link.name(), link.mtu());
            return Err(StackError::IllegalArgument);
        }
        if data.links.iter().any(|l| l.name() == link.name()) {
            error!("link name {} is already registered", link.name());
            return Err(StackError::IllegalArgument);
        }
        data.links.push(link);
        Ok(LinkId(data.links.len() - 1))
    }

    /// Finds a registered link by name. Comparison is byte-exact.
    pub fn link_by_name(&self, name: &str) -> Option<LinkId> {
        let data = lock_ok(&self.data);
        data.links.iter().position(|l| l.name() == name).map(LinkId)
    }

    /// The driver behind a link id, if registered.
    pub fn link(&self, id: LinkId) -> Option<Arc<dyn Link>> {
        lock_ok(&self.data).links.get(id.0).cloned()
    }

    /// Replaces the route table from a textual rule set.
    ///
    /// Entries are separated by commas or newlines; each entry is
    /// `<destination>:<link-name>` with whitespace trimmed and empty entries
    /// ignored. Destinations parse as decimal or `0x`-prefixed hex. A
    /// duplicate destination resolves to its last occurrence. On any
    /// rejection the table is cleared before the error is returned.
    pub fn load(&self, text: &str) -> Result<(), RouteLoadError> {
        let mut data = lock_ok(&self.data);
        match Self::parse(&data.links, text) {
            Ok(routes) => {
                data.routes = routes;
                debug!("route table replaced, {} entries", data.routes.len());
                Ok(())
            }
            Err(e) => {
                data.routes.clear();
                error!("route rule set rejected ({}), table cleared", e);
                Err(e)
            }
        }
    }

    fn parse(links: &[Arc<dyn Link>], text: &str) -> Result<Vec<RouteEntry>, RouteLoadError> {
        let mut routes: Vec<RouteEntry> = Vec::new();
        for token in text.split(|c| c == ',' || c == '\n') {
            let token = token.trim();
            if token.is_empty() {
                continue;
            }
            let (dest, name) = match token.split_once(':') {
                Some(parts) => parts,
                None => return Err(RouteLoadError::MissingSeparator(token.to_owned())),
            };
            let dest = dest.trim();
            let name = name.trim();
            if dest.is_empty() {
                return Err(RouteLoadError::EmptyDestination(token.to_owned()));
            }
            if name.is_empty() {
                return Err(RouteLoadError::EmptyLinkName(token.to_owned()));
            }
            let dest = Self::parse_dest(dest)
                .ok_or_else(|| RouteLoadError::BadDestination(dest.to_owned()))?;
            let link = links
                .iter()
                .position(|l| l.name() == name)
                .map(LinkId)
                .ok_or_else(|| RouteLoadError::UnknownLink(name.to_owned()))?;
            match routes.iter_mut().find(|r| r.dest == dest) {
                Some(entry) => entry.link = link,
                None => {
                    if routes.len() >= MAX_NODES {
                        return Err(RouteLoadError::TableFull);
                    }
                    routes.push(RouteEntry { dest, link });
                }
            }
        }
        Ok(routes)
    }

    fn parse_dest(token: &str) -> Option<u16> {
        if let Some(hex) = token.strip_prefix("0x").or_else(|| token.strip_prefix("0X")) {
            u16::from_str_radix(hex, 16).ok()
        } else {
            token.parse().ok()
        }
    }

    /// Transmits a packet out the link routed for its destination node.
    /// Enforces the link MTU against header plus payload. The transmit
    /// callback runs with the routing lock held.
    pub fn transmit(&self, pool: &PacketPool, packet: PacketRef) -> Result<(), TxError> {
        let (dst, length) = pool.with(packet, |p| (Header::unpack(p.header()).dst_node, p.len()));
        let data = lock_ok(&self.data);
        let link = match data.routes.iter().find(|r| r.dest == u16::from(dst)) {
            Some(entry) => &data.links[entry.link.0],
            None => {
                error!("no route to node {}", dst);
                return Err(TxError::NoRoute(dst));
            }
        };
        if length + HEADER_SIZE > link.mtu() {
            error!(
                "frame for node {} is {} bytes, link {} MTU is {}",
                dst,
                length + HEADER_SIZE,
                link.name(),
                link.mtu()
            );
            return Err(TxError::TooLargePayload);
        }
        pool.with(packet, |p| link.transmit(p)).map_err(TxError::from)
    }

    /// Number of entries currently in the route table.
    pub fn route_count(&self) -> usize {
        lock_ok(&self.data).routes.len()
    }

    /// Number of registered links.
    pub fn link_count(&self) -> usize {
        lock_ok(&self.data).links.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::{Flags, Header, Priority};
    use crate::testing::MockLink;
    use crate::MTU;
    use std::sync::mpsc;
    use std::time::Duration;

    fn router_with_links() -> (Router, mpsc::Receiver<Vec<u8>>, mpsc::Receiver<Vec<u8>>) {
        let router = Router::new();
        let (m0, rx0) = MockLink::new("m0", 1, HEADER_SIZE + MTU);
        let (m1, rx1) = MockLink::new("m1", 1, HEADER_SIZE + MTU);
        router.add_link(m0).unwrap();
        router.add_link(m1).unwrap();
        (router, rx0, rx1)
    }

    fn data_packet(pool: &PacketPool, dst: u8, len: usize) -> PacketRef {
        let packet = pool.get().unwrap();
        pool.with_mut(packet, |p| {
            p.set_header(Header::new(dst, 1, 1, 2, Flags::empty()).pack(Priority::Normal));
            p.set_len(len);
        });
        packet
    }

    #[test]
    fn register_validation() {
        let router = Router::new();
        let (nameless, _rx) = MockLink::new("", 1, HEADER_SIZE + MTU);
        assert!(router.add_link(nameless).is_err());
        let (tiny, _rx) = MockLink::new("tiny", 1, HEADER_SIZE - 1);
        assert!(router.add_link(tiny).is_err());
        let (m0, _rx) = MockLink::new("m0", 1, HEADER_SIZE + MTU);
        router.add_link(m0).unwrap();
        let (dup, _rx) = MockLink::new("m0", 1, HEADER_SIZE + MTU);
        assert!(router.add_link(dup).is_err());
        assert_eq!(router.link_count(), 1);
    }

    #[test]
    fn find_by_name_is_byte_exact() {
        let (router, _rx0, _rx1) = router_with_links();
        assert_eq!(router.link_by_name("m0"), Some(LinkId(0)));
        assert_eq!(router.link_by_name("m1"), Some(LinkId(1)));
        assert_eq!(router.link_by_name("M0"), None);
        assert_eq!(router.link_by_name("m0 "), None);
    }

    #[test]
    fn empty_rule_set_is_ok() {
        let (router, _rx0, _rx1) = router_with_links();
        router.load("").unwrap();
        assert_eq!(router.route_count(), 0);
    }

    #[test]
    fn grammar_accepts_separators_and_whitespace() {
        let (router, _rx0, _rx1) = router_with_links();
        router.load(" 1:m0 , 2 : m1 \n\n 3:m0 ,, \n").unwrap();
        assert_eq!(router.route_count(), 3);
    }

    #[test]
    fn hex_destinations_parse() {
        let (router, rx0, _rx1) = router_with_links();
        router.load("0x10:m0").unwrap();
        let pool = PacketPool::new();
        let packet = data_packet(&pool, 16, 0);
        router.transmit(&pool, packet).unwrap();
        pool.free(packet);
        assert!(rx0.recv_timeout(Duration::from_secs(1)).is_ok());
    }

    #[test]
    fn duplicate_destination_resolves_to_last() {
        let (router, rx0, rx1) = router_with_links();
        router.load("5:m0,5:m1").unwrap();
        assert_eq!(router.route_count(), 1);
        let pool = PacketPool::new();
        let packet = data_packet(&pool, 5, 3);
        router.transmit(&pool, packet).unwrap();
        pool.free(packet);
        assert!(rx0.try_recv().is_err());
        assert!(rx1.recv_timeout(Duration::from_secs(1)).is_ok());
    }

    #[test]
    fn rejection_clears_the_table() {
        let (router, _rx0, _rx1) = router_with_links();
        router.load("7:m0").unwrap();
        assert_eq!(router.route_count(), 1);

        let cases = [
            ("55", RouteLoadError::MissingSeparator("55".to_owned())),
            (":m0", RouteLoadError::EmptyDestination(":m0".to_owned())),
            ("55:", RouteLoadError::EmptyLinkName("55:".to_owned())),
            ("node:m0", RouteLoadError::BadDestination("node".to_owned())),
            ("70000:m0", RouteLoadError::BadDestination("70000".to_owned())),
            ("55:ghost", RouteLoadError::UnknownLink("ghost".to_owned())),
        ];
        for (text, expected) in &cases {
            router.load("7:m0").unwrap();
            assert_eq!(router.load(text).unwrap_err(), *expected);
            assert_eq!(router.route_count(), 0, "table not cleared for {:?}", text);
        }
    }

    #[test]
    fn overflowing_rule_set_is_rejected() {
        let (router, _rx0, _rx1) = router_with_links();
        let mut text = String::new();
        for dest in 0..=MAX_NODES {
            text.push_str(&format!("{}:m0,", dest));
        }
        assert_eq!(router.load(&text).unwrap_err(), RouteLoadError::TableFull);
        assert_eq!(router.route_count(), 0);
    }

    #[test]
    fn transmit_without_route_fails() {
        let (router, _rx0, _rx1) = router_with_links();
        router.load("1:m0").unwrap();
        let pool = PacketPool::new();
        let packet = data_packet(&pool, 9, 0);
        assert!(matches!(
            router.transmit(&pool, packet),
            Err(TxError::NoRoute(9))
        ));
        pool.free(packet);
    }

    #[test]
    fn transmit_enforces_link_mtu() {
        let router = Router::new();
        let (narrow, rx) = MockLink::new("narrow", 1, HEADER_SIZE + 6);
        router.add_link(narrow).unwrap();
        router.load("3:narrow").unwrap();

        let pool = PacketPool::new();
        let fits = data_packet(&pool, 3, 6);
        router.transmit(&pool, fits).unwrap();
        pool.free(fits);
        assert!(rx.recv_timeout(Duration::from_secs(1)).is_ok());

        let too_big = data_packet(&pool, 3, 7);
        assert!(matches!(
            router.transmit(&pool, too_big),
            Err(TxError::TooLargePayload)
        ));
        pool.free(too_big);
    }
}

