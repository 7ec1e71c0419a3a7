/*! Low-level packet access and construction.

# An overview over packet representations

The `wire` module deals with the packet *representation*. It provides two levels of
functionality.

 * First, it provides functions to extract fields from sequences of octets, and to insert fields
   into sequences of octets. This happens in the lowercase structures e.g. [`ipv6::ipv6`] or
   [`tcp::tcp`].
 * Second, it provides a compact, high-level representation of header data that can be created from
   parsing and emitted into a sequence of octets. This happens through the `Repr` family of
   structs, e.g. [`ipv6::Repr`] or [`tcp::Repr`].

The snips of the packet buffer store plain octets. The layers borrow those octets for the duration
of a read or write and wrap them into the lowercase structures on the fly, so no owning packet
wrapper is provided here.

The lowercase family of data structures guarantees that, if the `check_len()` method returned
`Ok(())`, then no field accessor or setter method will panic; however, the guarantee only holds
while specific fields are mutated, which are listed in the documentation for the specific packet.

In the `Repr` family of data structures, the `Repr::parse()` method never panics and the
`Repr::emit()` method never panics as long as the underlying buffer is exactly `Repr::buffer_len()`
octets long if provided.

# Examples

To emit an IPv6 header into an octet buffer, and then parse it back:

```rust
use ngstack::wire::{ipv6, IpProtocol};
let repr = ipv6::Repr {
    src_addr:    ipv6::Address::LOOPBACK,
    dst_addr:    ipv6::Address::LOOPBACK,
    next_header: IpProtocol::Tcp,
    payload_len: 0,
    hop_limit:   64
};
let mut buffer = vec![0; repr.buffer_len()];
repr.emit(ipv6::ipv6::new_unchecked_mut(&mut buffer));
let packet = ipv6::ipv6::new_checked(&buffer)
    .expect("truncated packet");
let parsed = ipv6::Repr::parse(packet)
    .expect("malformed packet");
assert_eq!(repr, parsed);
```
*/
// Copyright (C) 2016 whitequark@whitequark.org
// Copyright (C) 2019 Andreas Molzer <andreas.molzer@tum.de>
//
// in large parts from `smoltcp` originally distributed under 0-clause BSD

pub(crate) mod field {
    pub(crate) type Field = ::core::ops::Range<usize>;
}

mod error;
pub mod ip;
pub mod ipv6;
pub mod icmpv6;
pub mod tcp;

pub use self::error::{
    Error,
    Result};

pub use self::ip::{
    Protocol as IpProtocol,
    checksum};

pub use self::ipv6::{
    Address as Ipv6Address,
    Cidr as Ipv6Cidr,
    Repr as Ipv6Repr};

pub use self::icmpv6::{
    Message as Icmpv6Message,
    Repr as Icmpv6Repr};

pub use self::tcp::{
    Flags as TcpFlags,
    SeqNumber as TcpSeqNumber,
    TcpOption,
    Repr as TcpRepr};
