use std::error::Error;
use std::fmt;
use std::io;

/// Errors produced while trying to put a frame on a link.
#[derive(Debug)]
pub enum TxError {
    /// The destination node has no entry in the route table.
    NoRoute(u8),

    /// The frame does not fit the chosen link's MTU.
    TooLargePayload,

    /// The link driver failed to transmit.
    Io(io::Error),
}

impl From<io::Error> for TxError {
    fn from(e: io::Error) -> Self {
        TxError::Io(e)
    }
}

impl fmt::Display for TxError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        use self::TxError::*;
        match *self {
            NoRoute(node) => write!(fmt, "no route to node {}", node),
            TooLargePayload => write!(fmt, "frame exceeds link MTU"),
            Io(ref e) => write!(fmt, "link transmit failed: {}", e),
        }
    }
}

impl Error for TxError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        if let TxError::Io(ref e) = *self {
            Some(e)
        } else {
            None
        }
    }
}

/// Reasons an incoming frame was dropped on the ingress path.
#[derive(Debug, Eq, PartialEq)]
pub enum RxError {
    /// The frame is shorter than the packed header.
    FrameTooShort,

    /// The frame's payload exceeds the packet payload capacity.
    FrameTooLong,

    /// The pool had no free packet for the frame.
    PoolExhausted,

    /// The frame is addressed to another node; this stack does not forward.
    WrongDestination(u8),

    /// No socket matched the frame's addressing.
    NoSocket(String),

    /// The frame was delivered for a link id that is not registered.
    UnknownLink,
}

impl fmt::Display for RxError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        use self::RxError::*;
        match *self {
            FrameTooShort => write!(fmt, "frame shorter than header"),
            FrameTooLong => write!(fmt, "frame payload exceeds MTU"),
            PoolExhausted => write!(fmt, "packet pool exhausted"),
            WrongDestination(node) => write!(fmt, "frame for node {}, not us", node),
            NoSocket(ref what) => write!(fmt, "no socket for {}", what),
            UnknownLink => write!(fmt, "frame from unregistered link"),
        }
    }
}

impl Error for RxError {}
