//! The process logic of protocol layers.
//!
//! ## Layering
//!
//! Each protocol layer is split into two parts; the packet logic contained in `wire` and the
//! processing part in this module. The wire module only ever sees octets, while the layers here
//! decide where packets go: which thread receives them, which headers are prepended before they
//! leave, and which corrective answers are generated.
//!
//! ## Receiving
//!
//! A layer thread receives a packet as `Msg::Rcv` with one reference on the packet. It validates
//! its own header, marks it as a separate snip and dispatches the rest of the chain to the
//! threads registered for the next protocol. Whoever ends up with the last reference releases it.
//!
//! ## Sending
//!
//! Packets travelling down are built outermost-first by prepending header snips in front of the
//! payload. The IPv6 layer fills in the header fields that depend on the route, computes the
//! upper layer checksum through the registry and hands the packet to an interface, or back to
//! itself for local destinations.
pub mod ipv6;
pub mod icmpv6;
pub mod tcp;

use core::fmt;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Error {
    /// A parameter was not usable, such as an address of the wrong length.
    Fault,

    /// An active open was attempted without a destination.
    DestinationRequired,

    /// The connection or its demultiplexing context is already used.
    InUse,

    /// The operation requires an established connection.
    NotConnected,

    /// The action could not be completed because there were not enough resources.
    ///
    /// Usually the packet buffer was full, but also returned when a layer thread could not be
    /// started.
    Exhausted,

    /// The snip type does not have a checksum over a pseudo header.
    NoChecksum,

    /// Unable to find a route or neighbor towards the destination address.
    Unreachable,

    /// The connection attempt ended without a connection.
    Refused,

    /// The operation was not permitted.
    ///
    /// Returned when a packet could not be parsed or built.
    Illegal,
}

/// Can convert from a wire error.
///
/// This indicates some layer tried to operate on a packet but failed.
impl From<crate::wire::Error> for Error {
    fn from(_: crate::wire::Error) -> Self {
        Error::Illegal
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Fault => write!(f, "bad parameter"),
            Error::DestinationRequired => write!(f, "destination address required"),
            Error::InUse => write!(f, "address in use"),
            Error::NotConnected => write!(f, "not connected"),
            Error::Exhausted => write!(f, "out of resources"),
            Error::NoChecksum => write!(f, "no checksum for this type"),
            Error::Unreachable => write!(f, "destination unreachable"),
            Error::Refused => write!(f, "connection refused"),
            Error::Illegal => write!(f, "illegal packet"),
        }
    }
}

impl std::error::Error for Error {}
