//! Ingress thread for channel-backed link drivers.
//!
//! Drivers that produce frames on a channel (the loopback and mock links in
//! [`crate::testing`], or any driver whose receive side is a thread of its
//! own) hand the receiving end to [`spawn`]. The spawned thread feeds every
//! frame into [`crate::NetStack::input`] and logs drops, keeping all ingress
//! processing off the driver's transmit path.

use std::sync::mpsc::Receiver;
use std::thread;

use log::{debug, error, warn};

use crate::errors::RxError;
use crate::{LinkId, NetStack};

/// Spawns a thread that forwards every frame from `frames` into the stack
/// as ingress on `link`. The thread exits when the sending side of the
/// channel is dropped.
pub fn spawn(stack: NetStack, link: LinkId, frames: Receiver<Vec<u8>>) {
    thread::spawn(move || {
        while let Ok(frame) = frames.recv() {
            match stack.input(link, &frame) {
                Ok(()) => {}
                Err(RxError::PoolExhausted) => error!("ingress drop on {:?}: pool exhausted", link),
                Err(e) => warn!("ingress drop on {:?}: {}", link, e),
            }
        }
        debug!("rx thread for {:?} is quitting", link);
    });
}
