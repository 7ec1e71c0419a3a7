//! The TCP layer.
//!
//! Every connection is represented by a [`Tcb`], a transmission control block owned by the user.
//! It registers itself in the protocol registry under a demultiplexing context made from its port
//! pair and receives its segments in its own mailbox. The TCP thread started by [`init`] receives
//! all segments from the IPv6 layer, verifies them and hands each to the block registered for its
//! port pair, or to the one listening on the destination port.
//!
//! [`Tcb`]: struct.Tcb.html
//! [`init`]: fn.init.html
//!
//! ## State machine
//!
//! The protocol logic itself is the pure [`Connection`] state machine. It follows rfc793 for
//! connection setup and teardown. A connection is opened blocking: [`Tcb::open`] only returns once
//! the connection is established or has failed, processing segments and the setup timeout while
//! it waits. Afterwards [`Tcb::poll`] continues to drive the connection.
//!
//! [`Connection`]: struct.Connection.html
//! [`Tcb::open`]: struct.Tcb.html#method.open
//! [`Tcb::poll`]: struct.Tcb.html#method.poll
//!
//! ## Deviations
//!
//! No user data is transferred. `send` and `recv` only check for an established connection, and
//! segment payloads are not acknowledged. Consequently there is no retransmission either and the
//! only timers are those of the connection setup. A connection in TIME-WAIT stays there until it
//! is aborted or destroyed.
//!
//! Closing a connection in CLOSE-WAIT moves it to CLOSING. The acknowledgment of our FIN then
//! leads through TIME-WAIT, and the LAST-ACK state is never entered.
//!
//! Simultaneous open is not supported, a SYN without ACK in SYN-SENT is ignored.
use core::time::Duration;

use crate::wire::Ipv6Address;

mod connection;
mod engine;
mod packet;
mod siphash;
mod tcb;

#[cfg(test)]
mod tests;

pub use connection::{
    acceptable,
    Connection,
    Env,
    Event,
    Receive,
    Segment,
    Send,
    Signals,
    State,
    Timer};

pub use engine::init;

pub use packet::{
    calc_csum,
    hdr_build};

pub use tcb::{
    Aborter,
    OpenFlags,
    Tcb};

// publically exposed for initialization.
pub use siphash::IsnGenerator;

/// The addresses and ports identifying a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FourTuple {
    pub local: Ipv6Address,
    pub remote: Ipv6Address,
    pub local_port: u16,
    pub remote_port: u16,
}

/// Configuration of new connections.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Config {
    /// The receive window announced to the peer.
    pub window: u16,
    /// The maximum segment size announced in SYN segments.
    pub mss: u16,
    /// How long an active open waits for an answer to its SYN.
    pub syn_sent_timeout: Duration,
    /// How long a passive open waits for the final ACK of the handshake.
    pub syn_rcvd_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            window: 2048,
            // The IPv6 minimum link MTU without IPv6 and TCP header.
            mss: 1220,
            syn_sent_timeout: Duration::from_secs(5),
            syn_rcvd_timeout: Duration::from_secs(5),
        }
    }
}

/// The demultiplexing context of a port pair.
///
/// The remote port in the upper half, the local port in the lower. Listening connections have no
/// remote port and thus register under their local port alone.
pub fn context(local_port: u16, remote_port: u16) -> u32 {
    u32::from(remote_port) << 16 | u32::from(local_port)
}
