use core::fmt;

enum_with_unknown! {
    /// IP datagram encapsulated protocol.
    pub doc enum Protocol(u8) {
        /// IPv6 Hop-by-Hop options.
        HopByHop  = 0x00,
        /// Internet Control Message Protocol (v4).
        Icmp      = 0x01,
        /// Transmission Control Protocol.
        Tcp       = 0x06,
        /// User Datagram Protocol.
        Udp       = 0x11,
        /// IPv6 encapsulation.
        Ipv6      = 0x29,
        /// IPv6 routing header.
        Ipv6Route = 0x2b,
        /// IPv6 fragment header.
        Ipv6Frag  = 0x2c,
        /// Internet Control Message Protocol for IPv6.
        Icmpv6    = 0x3a,
        /// No next header.
        Ipv6NoNxt = 0x3b,
        /// IPv6 destination options.
        Ipv6Opts  = 0x3c,
        /// Reserved by IANA.
        ///
        /// Used by freshly built headers as a marker that the next header was not chosen yet.
        Reserved  = 0xff
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Protocol::HopByHop    => write!(f, "Hop-by-Hop"),
            Protocol::Icmp        => write!(f, "ICMP"),
            Protocol::Tcp         => write!(f, "TCP"),
            Protocol::Udp         => write!(f, "UDP"),
            Protocol::Ipv6        => write!(f, "IPv6"),
            Protocol::Ipv6Route   => write!(f, "IPv6-Route"),
            Protocol::Ipv6Frag    => write!(f, "IPv6-Frag"),
            Protocol::Icmpv6      => write!(f, "ICMPv6"),
            Protocol::Ipv6NoNxt   => write!(f, "IPv6-NoNxt"),
            Protocol::Ipv6Opts    => write!(f, "IPv6-Opts"),
            Protocol::Reserved    => write!(f, "reserved"),
            Protocol::Unknown(id) => write!(f, "0x{:02x}", id)
        }
    }
}

/// RFC 1071 internet checksum arithmetic.
///
/// All functions return the folded ones' complement sum *without* the final complement. A buffer
/// that already contains a correct checksum sums up to `!0`.
pub mod checksum {
    use byteorder::{ByteOrder, NetworkEndian};

    use super::Protocol;
    use crate::wire::ipv6::Address;

    fn propagate_carries(word: u32) -> u16 {
        let sum = (word >> 16) + (word & 0xffff);
        ((sum >> 16) as u16) + (sum as u16)
    }

    /// Compute an RFC 1071 compliant checksum (without the final complement).
    pub fn data(mut data: &[u8]) -> u16 {
        let mut accum = 0;

        // For each 32-byte chunk...
        const CHUNK_SIZE: usize = 32;
        while data.len() >= CHUNK_SIZE {
            let mut d = &data[..CHUNK_SIZE];
            // ... take by 2 bytes and sum them.
            while d.len() >= 2 {
                accum += NetworkEndian::read_u16(d) as u32;
                d = &d[2..];
            }

            data = &data[CHUNK_SIZE..];
        }

        // Sum the rest that does not fit the last 32-byte chunk,
        // taking by 2 bytes.
        while data.len() >= 2 {
            accum += NetworkEndian::read_u16(data) as u32;
            data = &data[2..];
        }

        // Add the last remaining odd byte, if any.
        if let Some(&value) = data.first() {
            accum += (value as u32) << 8;
        }

        propagate_carries(accum)
    }

    /// Combine several RFC 1071 compliant checksums.
    pub fn combine(checksums: &[u16]) -> u16 {
        let mut accum: u32 = 0;
        for &word in checksums {
            accum += word as u32;
        }
        propagate_carries(accum)
    }

    /// Compute the IPv6 pseudo header checksum.
    ///
    /// The upper-layer length is encoded as a 32-bit word, followed by three zero octets and the
    /// next header value. See [RFC 8200 § 8.1].
    ///
    /// [RFC 8200 § 8.1]: https://tools.ietf.org/html/rfc8200#section-8.1
    pub fn pseudo_header(src_addr: &Address, dst_addr: &Address,
                         protocol: Protocol, length: u32) -> u16 {
        let mut proto_len = [0u8; 8];
        proto_len[7] = protocol.into();
        NetworkEndian::write_u32(&mut proto_len[0..4], length);
        combine(&[
            data(src_addr.as_bytes()),
            data(dst_addr.as_bytes()),
            data(&proto_len[..])
        ])
    }
}
