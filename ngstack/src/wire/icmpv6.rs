use core::fmt;
use byteorder::{ByteOrder, NetworkEndian};

use super::{Error, Result};
use super::ip::{checksum, Protocol};
use super::ipv6::Address;

enum_with_unknown! {
    /// Internet protocol control message type.
    pub doc enum Message(u8) {
        /// Destination Unreachable.
        DstUnreachable  = 0x01,
        /// Packet Too Big.
        PktTooBig       = 0x02,
        /// Time Exceeded.
        TimeExceeded    = 0x03,
        /// Parameter Problem.
        ParamProblem    = 0x04,
        /// Echo Request
        EchoRequest     = 0x80,
        /// Echo Reply
        EchoReply       = 0x81,
        /// Router Solicitation
        RouterSolicit   = 0x85,
        /// Router Advertisement
        RouterAdvert    = 0x86,
        /// Neighbor Solicitation
        NeighborSolicit = 0x87,
        /// Neighbor Advertisement
        NeighborAdvert  = 0x88,
        /// Redirect
        Redirect        = 0x89,
        /// RPL control message
        RplControl      = 0x9b,
    }
}

impl Message {
    /// Query whether the message is an error message.
    ///
    /// See [RFC 4443 § 2.1] for details.
    ///
    /// [RFC 4443 § 2.1]: https://tools.ietf.org/html/rfc4443#section-2.1
    pub fn is_error(&self) -> bool {
        match *self {
            Message::DstUnreachable |
            Message::PktTooBig |
            Message::TimeExceeded |
            Message::ParamProblem => true,
            Message::Unknown(ty) => ty < 0x80,
            _ => false,
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Message::DstUnreachable  => write!(f, "destination unreachable"),
            Message::PktTooBig       => write!(f, "packet too big"),
            Message::TimeExceeded    => write!(f, "time exceeded"),
            Message::ParamProblem    => write!(f, "parameter problem"),
            Message::EchoReply       => write!(f, "echo reply"),
            Message::EchoRequest     => write!(f, "echo request"),
            Message::RouterSolicit   => write!(f, "router solicitation"),
            Message::RouterAdvert    => write!(f, "router advertisement"),
            Message::NeighborSolicit => write!(f, "neighbor solicitation"),
            Message::NeighborAdvert  => write!(f, "neighbor advert"),
            Message::Redirect        => write!(f, "redirect"),
            Message::RplControl      => write!(f, "RPL control"),
            Message::Unknown(id)     => write!(f, "{}", id)
        }
    }
}

byte_wrapper!(icmpv6);

// Ranges and constants describing the ICMPv6 header
//
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |     Type      |     Code      |          Checksum             |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |           Identifier          |        Sequence Number        |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |     Data ...
// +-+-+-+-+-
//
// The second word is only present in echo messages.
mod field {
    use crate::wire::field::Field;

    pub const TYPE:       usize = 0;
    pub const CODE:       usize = 1;
    pub const CHECKSUM:   Field = 2..4;

    pub const ECHO_IDENT: Field = 4..6;
    pub const ECHO_SEQNO: Field = 6..8;
}

/// Length of the common ICMPv6 header.
pub const HEADER_LEN: usize = field::CHECKSUM.end;

/// Length of an echo request or reply header.
pub const ECHO_HEADER_LEN: usize = field::ECHO_SEQNO.end;

impl icmpv6 {
    /// Imbue a raw octet buffer with ICMPv6 packet structure.
    #[inline]
    pub fn new_unchecked(buffer: &[u8]) -> &Self {
        Self::__from_macro_new_unchecked(buffer)
    }

    /// Imbue a mutable octet buffer with ICMPv6 packet structure.
    #[inline]
    pub fn new_unchecked_mut(buffer: &mut [u8]) -> &mut Self {
        Self::__from_macro_new_unchecked_mut(buffer)
    }

    /// Shorthand for a combination of [new_unchecked] and [check_len].
    ///
    /// [new_unchecked]: #method.new_unchecked
    /// [check_len]: #method.check_len
    #[inline]
    pub fn new_checked(buffer: &[u8]) -> Result<&Self> {
        let packet = Self::new_unchecked(buffer);
        packet.check_len()?;
        Ok(packet)
    }

    /// Ensure that no accessor method will panic if called.
    ///
    /// Returns `Err(Error::Truncated)` if the buffer is too short for the common header, or for
    /// the identifier and sequence number of an echo message.
    pub fn check_len(&self) -> Result<()> {
        let len = self.0.len();
        if len < HEADER_LEN {
            return Err(Error::Truncated);
        }

        match self.msg_type() {
            Message::EchoRequest | Message::EchoReply if len < ECHO_HEADER_LEN
                => Err(Error::Truncated),
            _ => Ok(()),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.0
    }

    /// Return the message type field.
    #[inline]
    pub fn msg_type(&self) -> Message {
        Message::from(self.0[field::TYPE])
    }

    /// Return the message code field.
    #[inline]
    pub fn msg_code(&self) -> u8 {
        self.0[field::CODE]
    }

    /// Return the checksum field.
    #[inline]
    pub fn checksum(&self) -> u16 {
        NetworkEndian::read_u16(&self.0[field::CHECKSUM])
    }

    /// Return the identifier field (for echo request and reply packets).
    #[inline]
    pub fn echo_ident(&self) -> u16 {
        NetworkEndian::read_u16(&self.0[field::ECHO_IDENT])
    }

    /// Return the sequence number field (for echo request and reply packets).
    #[inline]
    pub fn echo_seq_no(&self) -> u16 {
        NetworkEndian::read_u16(&self.0[field::ECHO_SEQNO])
    }

    /// Return the data following an echo header.
    #[inline]
    pub fn echo_data(&self) -> &[u8] {
        &self.0[ECHO_HEADER_LEN..]
    }

    /// Set the message type field.
    #[inline]
    pub fn set_msg_type(&mut self, value: Message) {
        self.0[field::TYPE] = value.into()
    }

    /// Set the message code field.
    #[inline]
    pub fn set_msg_code(&mut self, value: u8) {
        self.0[field::CODE] = value
    }

    /// Set the checksum field.
    #[inline]
    pub fn set_checksum(&mut self, value: u16) {
        NetworkEndian::write_u16(&mut self.0[field::CHECKSUM], value)
    }

    /// Set the identifier field (for echo request and reply packets).
    #[inline]
    pub fn set_echo_ident(&mut self, value: u16) {
        NetworkEndian::write_u16(&mut self.0[field::ECHO_IDENT], value)
    }

    /// Set the sequence number field (for echo request and reply packets).
    #[inline]
    pub fn set_echo_seq_no(&mut self, value: u16) {
        NetworkEndian::write_u16(&mut self.0[field::ECHO_SEQNO], value)
    }

    /// Return a mutable pointer to the data following an echo header.
    #[inline]
    pub fn echo_data_mut(&mut self) -> &mut [u8] {
        &mut self.0[ECHO_HEADER_LEN..]
    }

    /// Validate the checksum over the complete message.
    pub fn verify_checksum(&self, src_addr: &Address, dst_addr: &Address) -> bool {
        checksum::combine(&[
            checksum::pseudo_header(src_addr, dst_addr, Protocol::Icmpv6,
                                    self.0.len() as u32),
            checksum::data(&self.0)
        ]) == !0
    }

    /// Compute and fill in the checksum over the complete message.
    pub fn fill_checksum(&mut self, src_addr: &Address, dst_addr: &Address) {
        self.set_checksum(0);
        let checksum = !checksum::combine(&[
            checksum::pseudo_header(src_addr, dst_addr, Protocol::Icmpv6,
                                    self.0.len() as u32),
            checksum::data(&self.0)
        ]);
        self.set_checksum(checksum)
    }
}

/// A high-level representation of an ICMPv6 header.
///
/// Only the echo messages have their body described, all other messages carry their type and
/// code only.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Repr {
    EchoRequest {
        ident: u16,
        seq_no: u16,
        data_len: usize,
    },
    EchoReply {
        ident: u16,
        seq_no: u16,
        data_len: usize,
    },
    Other {
        msg_type: Message,
        code: u8,
        body_len: usize,
    },
}

impl Repr {
    /// Parse an ICMPv6 message header.
    pub fn parse(packet: &icmpv6) -> Result<Repr> {
        packet.check_len()?;
        let len = packet.as_bytes().len();
        match (packet.msg_type(), packet.msg_code()) {
            (Message::EchoRequest, 0) => Ok(Repr::EchoRequest {
                ident: packet.echo_ident(),
                seq_no: packet.echo_seq_no(),
                data_len: len - ECHO_HEADER_LEN,
            }),
            (Message::EchoReply, 0) => Ok(Repr::EchoReply {
                ident: packet.echo_ident(),
                seq_no: packet.echo_seq_no(),
                data_len: len - ECHO_HEADER_LEN,
            }),
            (Message::EchoRequest, _) | (Message::EchoReply, _) => Err(Error::Malformed),
            (msg_type, code) => Ok(Repr::Other {
                msg_type,
                code,
                body_len: len - HEADER_LEN,
            }),
        }
    }

    /// The length of the complete message, including the data.
    pub fn buffer_len(&self) -> usize {
        match self {
            Repr::EchoRequest { data_len, .. }
            | Repr::EchoReply { data_len, .. } => ECHO_HEADER_LEN + data_len,
            Repr::Other { body_len, .. } => HEADER_LEN + body_len,
        }
    }

    /// Emit the header fields, the checksum is zeroed and the data left untouched.
    pub fn emit(&self, packet: &mut icmpv6) {
        match *self {
            Repr::EchoRequest { ident, seq_no, .. } => {
                packet.set_msg_type(Message::EchoRequest);
                packet.set_msg_code(0);
                packet.set_echo_ident(ident);
                packet.set_echo_seq_no(seq_no);
            },
            Repr::EchoReply { ident, seq_no, .. } => {
                packet.set_msg_type(Message::EchoReply);
                packet.set_msg_code(0);
                packet.set_echo_ident(ident);
                packet.set_echo_seq_no(seq_no);
            },
            Repr::Other { msg_type, code, .. } => {
                packet.set_msg_type(msg_type);
                packet.set_msg_code(code);
            },
        }
        packet.set_checksum(0);
    }
}
