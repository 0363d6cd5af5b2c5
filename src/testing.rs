//! Mock and loopback links for exercising the stack without real hardware.
//!
//! [`MockLink`] captures every transmitted frame on a channel and
//! [`dummy_stack`] wires one up with an injection channel, so tests can
//! craft raw frames, push them through ingress and inspect exactly what the
//! stack put on the wire.
//!
//! [`loopback`] registers a link that feeds transmitted frames straight
//! back into the same stack from its own rx thread, which is enough to run
//! both ends of a connection inside one process.

use std::io;
use std::sync::mpsc::{Receiver, Sender};
use std::sync::{mpsc, Arc, Mutex};

use crate::pool::Packet;
use crate::stack::StackError;
use crate::util::lock_ok;
use crate::{rx, Link, LinkId, NetStack, StackConfig, MAX_FRAME};

/// A link that records transmitted frames on a channel instead of sending
/// them anywhere.
pub struct MockLink {
    name: String,
    address: u8,
    mtu: usize,
    frames: Mutex<Sender<Vec<u8>>>,
}

impl MockLink {
    /// Creates a mock link and the receiving end for its transmitted
    /// frames.
    pub fn new(name: &str, address: u8, mtu: usize) -> (Arc<MockLink>, Receiver<Vec<u8>>) {
        let (tx, rx) = mpsc::channel();
        let link = MockLink {
            name: name.to_owned(),
            address,
            mtu,
            frames: Mutex::new(tx),
        };
        (Arc::new(link), rx)
    }
}

impl Link for MockLink {
    fn name(&self) -> &str {
        &self.name
    }

    fn address(&self) -> u8 {
        self.address
    }

    fn mtu(&self) -> usize {
        self.mtu
    }

    fn transmit(&self, packet: &Packet) -> io::Result<()> {
        let mut frame = [0u8; MAX_FRAME];
        let len = packet.write_frame(&mut frame);
        lock_ok(&self.frames)
            .send(frame[..len].to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "mock reader gone"))
    }
}

/// A stack with one mock link named `mock0`, an inject handle for feeding
/// frames into ingress and a read handle for frames the stack transmits.
/// The inject side is drained by a spawned rx thread, the way a real driver
/// would deliver frames.
pub fn dummy_stack(local_node: u8) -> (NetStack, LinkId, Sender<Vec<u8>>, Receiver<Vec<u8>>) {
    let stack = NetStack::new(StackConfig { local_node });
    let (link, read_handle) = MockLink::new("mock0", local_node, MAX_FRAME);
    let id = stack.add_link(link).expect("mock0 registration");
    let (inject_handle, inject_rx) = mpsc::channel();
    rx::spawn(stack.clone(), id, inject_rx);
    (stack, id, inject_handle, read_handle)
}

/// A link that delivers every transmitted frame back to its own stack.
pub struct LoopbackLink {
    name: String,
    address: u8,
    mtu: usize,
    frames: Mutex<Sender<Vec<u8>>>,
}

impl Link for LoopbackLink {
    fn name(&self) -> &str {
        &self.name
    }

    fn address(&self) -> u8 {
        self.address
    }

    fn mtu(&self) -> usize {
        self.mtu
    }

    fn transmit(&self, packet: &Packet) -> io::Result<()> {
        let mut frame = [0u8; MAX_FRAME];
        let len = packet.write_frame(&mut frame);
        lock_ok(&self.frames)
            .send(frame[..len].to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "loopback rx thread gone"))
    }
}

/// Registers a loopback link named `name` on `stack` and spawns its rx
/// thread. Transmitted frames re-enter the stack as ingress, outside the
/// transmit path.
pub fn loopback(stack: &NetStack, name: &str) -> Result<LinkId, StackError> {
    let (tx, frames) = mpsc::channel();
    let link = LoopbackLink {
        name: name.to_owned(),
        address: stack.local_node(),
        mtu: MAX_FRAME,
        frames: Mutex::new(tx),
    };
    let id = stack.add_link(Arc::new(link))?;
    rx::spawn(stack.clone(), id, frames);
    Ok(id)
}
