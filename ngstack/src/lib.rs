//! A threaded IPv6, ICMPv6 and TCP network sub-stack.
//!
//! Packets live in a shared, reference counted [`Pktbuf`] arena as chains of typed snips. Each
//! protocol layer runs in its own thread and receives packets through a mailbox. Which thread
//! gets a packet is decided by the [`Registry`], keyed on the protocol type and a protocol
//! specific demultiplexing context.
//!
//! [`Pktbuf`]: pktbuf/struct.Pktbuf.html
//! [`Registry`]: netreg/struct.Registry.html
#[macro_use] mod macros;

pub mod wire;
pub mod pktbuf;
pub mod netreg;
pub mod thread;
pub mod netif;
pub mod stack;
pub mod layer;

pub use self::stack::{Config, Stack};
