//! The ICMPv6 layer.
//!
//! Has no thread of its own. The IPv6 layer calls [`demux`] inline for every received ICMPv6
//! message, which answers echo requests and passes the message on to threads registered for its
//! type. Other message types, such as neighbor discovery, are left to such registered threads.
//!
//! [`demux`]: fn.demux.html
use crate::layer::{ipv6, Error, Result};
use crate::netif::NetifHdr;
use crate::netreg::{NetType, CTX_ALL};
use crate::pktbuf::{Pktbuf, Snip};
use crate::stack::Stack;
use crate::thread::{Msg, Pid};
use crate::wire::{Icmpv6Message as Message, Icmpv6Repr, Ipv6Address, Ipv6Repr};
use crate::wire::icmpv6::{icmpv6, HEADER_LEN};


/// Compute and store the checksum of the ICMPv6 message `hdr`.
///
/// `pseudo` is the IPv6 header snip providing the pseudo header.
pub fn calc_csum(pktbuf: &Pktbuf, hdr: Snip, pseudo: Snip) -> Result<()> {
    if pktbuf.ty(pseudo) != Some(NetType::Ipv6) {
        return Err(Error::Illegal);
    }
    let ip = ipv6::header(pktbuf, pseudo).ok_or(Error::Illegal)?;

    let mut message = pktbuf.to_vec(hdr);
    if message.len() < HEADER_LEN {
        return Err(Error::Illegal);
    }
    let packet = icmpv6::new_unchecked_mut(&mut message);
    packet.fill_checksum(&ip.src_addr, &ip.dst_addr);
    let checksum = packet.checksum();

    pktbuf.write(hdr, |data| icmpv6::new_unchecked_mut(data).set_checksum(checksum))
        .ok_or(Error::Illegal)
}

/// Handle a received ICMPv6 message.
///
/// `pkt` is the complete received chain, it is only inspected. The reference on it stays with the
/// caller, threads registered for the message type get their own ones.
pub fn demux(stack: &Stack, iface: Option<Pid>, pkt: Snip) {
    let pktbuf = stack.pktbuf();
    let (icmp, ip) = match (
        pktbuf.search_type(pkt, NetType::Icmpv6),
        pktbuf.search_type(pkt, NetType::Ipv6),
    ) {
        (Some(icmp), Some(ip)) => (icmp, ip),
        _ => {
            net_debug!("icmpv6: packet without ICMPv6 or IPv6 header");
            return;
        },
    };

    let ip = match ipv6::header(pktbuf, ip) {
        Some(repr) => repr,
        None => return,
    };

    let message = pktbuf.to_vec(icmp);
    if message.len() < HEADER_LEN {
        net_debug!("icmpv6: message too short ({} octets)", message.len());
        return;
    }

    let packet = icmpv6::new_unchecked(&message);
    if !packet.verify_checksum(&ip.src_addr, &ip.dst_addr) {
        net_debug!("icmpv6: wrong checksum from {}", ip.src_addr);
        return;
    }

    let msg_type = packet.msg_type();
    net_trace!("icmpv6: received {} from {}", msg_type, ip.src_addr);
    match msg_type {
        Message::EchoRequest => echo_req_handle(stack, iface, &ip, packet),
        _ => (),
    }

    let receivers: Vec<Pid> = {
        let netreg = stack.netreg().read();
        let receivers = netreg.iter(NetType::Icmpv6, u32::from(u8::from(msg_type)))
            .map(|entry| entry.pid)
            .collect();
        receivers
    };

    // The reference of the caller is untouched, every receiver gets a new one.
    pktbuf.hold(pkt, receivers.len());
    for pid in receivers {
        stack.deliver(pid, Msg::Rcv(pkt));
    }
}

/// Answer an echo request received in the IPv6 header `ip`.
fn echo_req_handle(stack: &Stack, iface: Option<Pid>, ip: &Ipv6Repr, echo: &icmpv6) {
    let pktbuf = stack.pktbuf();
    let (ident, seq_no) = match Icmpv6Repr::parse(echo) {
        Ok(Icmpv6Repr::EchoRequest { ident, seq_no, .. }) => (ident, seq_no),
        _ => {
            net_debug!("icmpv6: malformed echo request");
            return;
        },
    };

    let reply = match echo_build(stack, Message::EchoReply, ident, seq_no, echo.echo_data()) {
        Ok(reply) => reply,
        Err(_err) => {
            net_debug!("icmpv6: could not build echo reply: {}", _err);
            return;
        },
    };

    // A request to a group is answered from our own address on the receiving interface.
    let src = if ip.dst_addr.is_multicast() {
        stack.best_source(iface, &ip.src_addr)
            .unwrap_or(Ipv6Address::UNSPECIFIED)
    } else {
        ip.dst_addr
    };

    let pkt = match ipv6::hdr_build(stack, Some(reply), src.as_bytes(), ip.src_addr.as_bytes()) {
        Ok(pkt) => pkt,
        Err(_) => {
            pktbuf.release(reply);
            return;
        },
    };

    let pkt = match iface {
        Some(iface) => {
            let hdr = NetifHdr::new(iface).to_bytes();
            match pktbuf.add(Some(pkt), &hdr, NetType::Netif) {
                Some(pkt) => pkt,
                None => {
                    pktbuf.release(pkt);
                    return;
                },
            }
        },
        None => pkt,
    };

    net_trace!("icmpv6: echo reply to {} (id {}, seq {})", ip.src_addr, ident, seq_no);
    if stack.dispatch_send(NetType::Ipv6, CTX_ALL, pkt) == 0 {
        net_debug!("icmpv6: no IPv6 thread to send echo reply");
        pktbuf.release(pkt);
    }
}

/// Allocate an ICMPv6 message of `size` octets in front of `payload`.
///
/// Type and code are set, the checksum zeroed. It is computed by the IPv6 layer when sending.
pub fn build(stack: &Stack, payload: Option<Snip>, ty: Message, code: u8, size: usize)
    -> Result<Snip>
{
    if size < HEADER_LEN {
        return Err(Error::Fault);
    }

    let pktbuf = stack.pktbuf();
    let pkt = pktbuf.alloc(payload, size, NetType::Icmpv6)
        .ok_or(Error::Exhausted)?;
    pktbuf.write(pkt, |data| {
        let packet = icmpv6::new_unchecked_mut(data);
        packet.set_msg_type(ty);
        packet.set_msg_code(code);
        packet.set_checksum(0);
    });
    Ok(pkt)
}

/// Build an echo request or reply carrying `data`.
pub fn echo_build(stack: &Stack, ty: Message, ident: u16, seq_no: u16, data: &[u8])
    -> Result<Snip>
{
    let repr = match ty {
        Message::EchoRequest => Icmpv6Repr::EchoRequest { ident, seq_no, data_len: data.len() },
        Message::EchoReply => Icmpv6Repr::EchoReply { ident, seq_no, data_len: data.len() },
        _ => return Err(Error::Fault),
    };

    let pkt = build(stack, None, ty, 0, repr.buffer_len())?;
    stack.pktbuf().write(pkt, |bytes| {
        let packet = icmpv6::new_unchecked_mut(bytes);
        repr.emit(packet);
        packet.echo_data_mut().copy_from_slice(data);
    });
    Ok(pkt)
}
