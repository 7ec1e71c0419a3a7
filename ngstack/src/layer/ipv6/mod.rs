//! The IPv6 layer.
//!
//! Runs as its own thread, registered for all IPv6 packets. Packets from the interfaces arrive as
//! `Msg::Rcv`, are validated, stripped of their header snip and demultiplexed by the next header
//! to the threads registered for it. Packets from upper layers arrive as `Msg::Snd` with a header
//! built by [`hdr_build`]. Their remaining header fields are filled for the outgoing interface
//! before they are handed to it, or looped back to the stack itself for local destinations.
//!
//! [`hdr_build`]: fn.hdr_build.html
use std::sync::{Arc, Weak};

use crate::layer::{icmpv6, Error, Result};
use crate::netif::{flags, NetifHdr};
use crate::netreg::{self, Entry, NetType, CTX_ALL};
use crate::pktbuf::{Pktbuf, Snip};
use crate::stack::Stack;
use crate::thread::{Mailbox, Msg, Pid};
use crate::wire::{IpProtocol, Ipv6Address as Address, Ipv6Repr};
use crate::wire::ipv6::{ipv6, HEADER_LEN};


/// Configuration of the IPv6 layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Config {
    /// Forward packets not addressed to this stack.
    pub router: bool,
    /// The hop limit of packets that are not sent through a configured interface.
    pub default_hop_limit: u8,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            router: false,
            default_hop_limit: 64,
        }
    }
}

/// Start the IPv6 thread of the stack.
///
/// Only the first call starts the thread, all calls return its pid.
pub fn init(stack: &Arc<Stack>) -> Result<Pid> {
    let pid = stack.ipv6_pid.call_once(|| {
        let weak = Arc::downgrade(stack);
        let stack_size = stack.config().thread_stack_size;
        let pid = match stack.threads().spawn("ipv6", stack_size, move |mailbox| {
            event_loop(weak, mailbox)
        }) {
            Ok(pid) => pid,
            Err(_err) => {
                net_debug!("ipv6: could not start thread: {}", _err);
                return None;
            },
        };
        stack.register(NetType::Ipv6, Entry::new(CTX_ALL, pid));
        Some(pid)
    });
    pid.ok_or(Error::Exhausted)
}

fn event_loop(stack: Weak<Stack>, mailbox: Mailbox) {
    net_trace!("ipv6: started as {}", mailbox.pid());
    while let Ok(msg) = mailbox.recv(None) {
        let stack = match stack.upgrade() {
            Some(stack) => stack,
            None => break,
        };
        match msg {
            Msg::Rcv(pkt) => receive(&stack, pkt),
            Msg::Snd(pkt) => send(&stack, pkt, true),
            Msg::Abort => (),
        }
    }
    net_trace!("ipv6: stopped");
}

/// Prepend a new IPv6 header to `payload`.
///
/// The addresses are given as octets and must each be either empty or exactly 16 octets long,
/// otherwise this fails with `Error::Fault`. A missing source is left unspecified and chosen when
/// the packet is sent, a missing destination means the loopback address. Next header, payload
/// length and hop limit are also filled in when sending.
pub fn hdr_build(stack: &Stack, payload: Option<Snip>, src: &[u8], dst: &[u8]) -> Result<Snip> {
    let src_addr = address_param(src, Address::UNSPECIFIED)?;
    let dst_addr = address_param(dst, Address::LOOPBACK)?;
    let repr = Ipv6Repr {
        src_addr,
        dst_addr,
        next_header: IpProtocol::Reserved,
        payload_len: 0,
        hop_limit: 0,
    };

    let mut header = [0; HEADER_LEN];
    repr.emit(ipv6::new_unchecked_mut(&mut header));
    stack.pktbuf().add(payload, &header, NetType::Ipv6)
        .ok_or(Error::Exhausted)
}

fn address_param(bytes: &[u8], default: Address) -> Result<Address> {
    match bytes.len() {
        0 => Ok(default),
        Address::LEN => Ok(Address::from_bytes(bytes)),
        _ => Err(Error::Fault),
    }
}

/// Read the fixed header from a snip.
pub(crate) fn header(pktbuf: &Pktbuf, snip: Snip) -> Option<Ipv6Repr> {
    pktbuf.read(snip, |data| Ipv6Repr::parse_header(ipv6::new_unchecked(data)).ok())?
}

/// Hand a received packet to the registered receivers of its next header.
///
/// `pkt` starts with the IPv6 header snip. The snip following it is tagged with the type of
/// `next_header`. ICMPv6 messages are handled by the stack itself first. Every thread registered
/// for all packets of that type or for IPv6 packets with this next header receives one reference.
pub fn demux(stack: &Stack, iface: Option<Pid>, pkt: Snip, next_header: IpProtocol) {
    let pktbuf = stack.pktbuf();
    let ty = NetType::from(next_header);

    if ty == NetType::Ipv6 {
        net_debug!("ipv6: encapsulated packets are not supported, dropping");
        pktbuf.release(pkt);
        return;
    }

    if let Some(payload) = pktbuf.next(pkt) {
        pktbuf.set_type(payload, ty);
    }

    if ty == NetType::Icmpv6 {
        icmpv6::demux(stack, iface, pkt);
    }

    let receivers: Vec<Pid> = {
        let netreg = stack.netreg().read();
        let receivers = netreg.iter(ty, CTX_ALL)
            .chain(netreg.iter(NetType::Ipv6, u32::from(u8::from(next_header))))
            .map(|entry| entry.pid)
            .collect();
        receivers
    };

    if receivers.is_empty() {
        net_trace!("ipv6: no receivers for {}", next_header);
        pktbuf.release(pkt);
        return;
    }

    pktbuf.hold(pkt, receivers.len() - 1);
    for pid in receivers {
        stack.deliver(pid, Msg::Rcv(pkt));
    }
}

/// Process a packet arriving from an interface or looped back by the stack.
pub(crate) fn receive(stack: &Stack, pkt: Snip) {
    let pktbuf = stack.pktbuf();
    let pkt = match pktbuf.start_write(pkt) {
        Some(pkt) => pkt,
        None => {
            net_debug!("ipv6: no space to write packet, dropping");
            pktbuf.release(pkt);
            return;
        },
    };

    let (iface, ip) = if pktbuf.ty(pkt) == Some(NetType::Netif) {
        let iface = pktbuf.read(pkt, |data| NetifHdr::parse(data).ok())
            .and_then(|hdr| hdr)
            .map(|hdr| hdr.iface);
        match pktbuf.remove_head(pkt) {
            Some(ip) => (iface, ip),
            None => return,
        }
    } else {
        (None, pkt)
    };

    let marked = pktbuf.ty(ip) == Some(NetType::Ipv6)
        && pktbuf.len(ip) == HEADER_LEN
        && pktbuf.next(ip).is_some();
    let repr = match header(pktbuf, ip) {
        Some(repr) => repr,
        None => {
            net_debug!("ipv6: not an IPv6 packet, dropping");
            pktbuf.release(ip);
            return;
        },
    };

    let payload = if marked {
        pktbuf.next(ip)
    } else {
        pktbuf.mark(ip, HEADER_LEN, NetType::Ipv6)
    };
    let payload = match payload {
        Some(payload) => payload,
        None => {
            pktbuf.release(ip);
            return;
        },
    };

    net_trace!("ipv6: received {}", repr);
    if repr.hop_limit == 0 {
        net_debug!("ipv6: hop limit exceeded, dropping");
        pktbuf.release(ip);
        return;
    }

    if repr.payload_len == 0 && repr.next_header != IpProtocol::Ipv6NoNxt {
        net_debug!("ipv6: empty payload for {}, dropping", repr.next_header);
        pktbuf.release(ip);
        return;
    }

    let received = pktbuf.size(payload);
    if repr.payload_len > received {
        net_debug!("ipv6: payload truncated ({} < {}), dropping", received, repr.payload_len);
        pktbuf.release(ip);
        return;
    } else if repr.payload_len < received && pktbuf.next(payload).is_none() {
        // Padding of the link layer.
        pktbuf.trim(payload, repr.payload_len);
    }

    if !stack.accepts(&repr.dst_addr) {
        forward(stack, ip, repr);
        return;
    }

    demux(stack, iface, ip, repr.next_header);
}

fn forward(stack: &Stack, ip: Snip, repr: Ipv6Repr) {
    let pktbuf = stack.pktbuf();
    if !stack.config().ipv6.router {
        net_trace!("ipv6: {} is not for us, dropping", repr.dst_addr);
        pktbuf.release(ip);
        return;
    }

    if repr.hop_limit <= 1 {
        net_debug!("ipv6: hop limit of forwarded packet exceeded, dropping");
        pktbuf.release(ip);
        return;
    }

    pktbuf.write(ip, |data| {
        ipv6::new_unchecked_mut(data).set_hop_limit(repr.hop_limit - 1)
    });
    net_trace!("ipv6: forwarding to {}", repr.dst_addr);
    send(stack, ip, false);
}

/// Send a packet starting with an IPv6 header, optionally preceded by an interface header.
///
/// With `prep_hdr` the header fields are filled for the outgoing interface, otherwise the header
/// is sent as is.
pub(crate) fn send(stack: &Stack, pkt: Snip, prep_hdr: bool) {
    let pktbuf = stack.pktbuf();
    let pkt = match pktbuf.start_write(pkt) {
        Some(pkt) => pkt,
        None => {
            net_debug!("ipv6: no space to write packet, dropping");
            pktbuf.release(pkt);
            return;
        },
    };

    let (iface, ip) = if pktbuf.ty(pkt) == Some(NetType::Netif) {
        let iface = pktbuf.read(pkt, |data| NetifHdr::parse(data).ok())
            .and_then(|hdr| hdr)
            .map(|hdr| hdr.iface);
        match pktbuf.remove_head(pkt) {
            Some(ip) => (iface, ip),
            None => return,
        }
    } else {
        (None, pkt)
    };

    if pktbuf.ty(ip) != Some(NetType::Ipv6) {
        net_debug!("ipv6: packet to send has no IPv6 header, dropping");
        pktbuf.release(ip);
        return;
    }

    let dst = match header(pktbuf, ip) {
        Some(repr) => repr.dst_addr,
        None => {
            pktbuf.release(ip);
            return;
        },
    };

    if dst.is_unspecified() {
        net_debug!("ipv6: destination unspecified, dropping");
        pktbuf.release(ip);
    } else if dst.is_multicast() {
        send_multicast(stack, iface, ip, prep_hdr);
    } else if stack.accepts(&dst) {
        send_to_self(stack, iface, ip, prep_hdr);
    } else {
        send_unicast(stack, ip, dst, prep_hdr);
    }
}

fn send_multicast(stack: &Stack, iface: Option<Pid>, ip: Snip, prep_hdr: bool) {
    let pktbuf = stack.pktbuf();
    if let Some(iface) = iface {
        if prep_hdr && fill(stack, Some(iface), ip).is_err() {
            pktbuf.release(ip);
            return;
        }
        return transmit(stack, iface, flags::MULTICAST, &[], ip);
    }

    let netifs = stack.netifs();
    if netifs.is_empty() {
        net_debug!("ipv6: no interface for multicast, dropping");
        pktbuf.release(ip);
        return;
    }

    // One reference for every copy, each interface takes its own writable version.
    pktbuf.hold(ip, netifs.len() - 1);
    for netif in netifs {
        let copy = match pktbuf.start_write(ip) {
            Some(copy) => copy,
            None => {
                pktbuf.release(ip);
                continue;
            },
        };
        if prep_hdr && fill(stack, Some(netif.pid()), copy).is_err() {
            pktbuf.release(copy);
            continue;
        }
        transmit(stack, netif.pid(), flags::MULTICAST, &[], copy);
    }
}

fn send_to_self(stack: &Stack, iface: Option<Pid>, ip: Snip, prep_hdr: bool) {
    let pktbuf = stack.pktbuf();
    if prep_hdr && fill(stack, iface, ip).is_err() {
        pktbuf.release(ip);
        return;
    }

    if !pktbuf.merge(ip) {
        pktbuf.release(ip);
        return;
    }

    net_trace!("ipv6: looping back packet of {} octets", pktbuf.len(ip));
    if stack.dispatch_receive(NetType::Ipv6, CTX_ALL, ip) == 0 {
        pktbuf.release(ip);
    }
}

fn send_unicast(stack: &Stack, ip: Snip, dst: Address, prep_hdr: bool) {
    let pktbuf = stack.pktbuf();
    let neighbor = match stack.resolve(&dst).ok_or(Error::Unreachable) {
        Ok(neighbor) => neighbor,
        Err(_err) => {
            net_debug!("ipv6: {} {}, dropping", _err, dst);
            pktbuf.release(ip);
            return;
        },
    };

    if prep_hdr && fill(stack, Some(neighbor.iface), ip).is_err() {
        pktbuf.release(ip);
        return;
    }

    transmit(stack, neighbor.iface, 0, &neighbor.l2addr, ip);
}

/// Prepend the interface header and hand the packet to the interface thread.
fn transmit(stack: &Stack, iface: Pid, flags: u8, dst_l2addr: &[u8], ip: Snip) {
    let pktbuf = stack.pktbuf();
    let mut hdr = NetifHdr::new(iface);
    hdr.flags = flags;
    hdr.dst_l2addr = dst_l2addr.to_vec();
    if let Some(netif) = stack.netif(iface) {
        hdr.src_l2addr = netif.l2addr().to_vec();
    }

    match pktbuf.add(Some(ip), &hdr.to_bytes(), NetType::Netif) {
        Some(pkt) => {
            net_trace!("ipv6: sending packet over {}", iface);
            stack.deliver(iface, Msg::Snd(pkt));
        },
        None => {
            net_debug!("ipv6: no space for interface header, dropping");
            pktbuf.release(ip);
        },
    }
}

/// Fill the header fields that depend on the payload and outgoing interface.
///
/// Also computes the checksum of the upper layer, which covers the finished header.
fn fill(stack: &Stack, iface: Option<Pid>, ip: Snip) -> Result<()> {
    let pktbuf = stack.pktbuf();
    let repr = header(pktbuf, ip).ok_or(Error::Illegal)?;
    let payload = pktbuf.next(ip);

    let payload_len = payload.map_or(0, |payload| pktbuf.size(payload));
    if payload_len > usize::from(u16::max_value()) {
        net_debug!("ipv6: payload of {} octets too large", payload_len);
        return Err(Error::Illegal);
    }

    let next_header = if repr.next_header == IpProtocol::Reserved {
        match payload.and_then(|payload| pktbuf.ty(payload)) {
            Some(ty) => ty.protnum(),
            None => IpProtocol::Ipv6NoNxt,
        }
    } else {
        repr.next_header
    };

    let hop_limit = if repr.hop_limit == 0 {
        iface.and_then(|pid| stack.netif(pid))
            .map_or(stack.config().ipv6.default_hop_limit, |netif| netif.hop_limit())
    } else {
        repr.hop_limit
    };

    let src_addr = if !repr.src_addr.is_unspecified() {
        repr.src_addr
    } else if repr.dst_addr.is_loopback() {
        Address::LOOPBACK
    } else {
        stack.best_source(iface, &repr.dst_addr)
            .unwrap_or(Address::UNSPECIFIED)
    };

    let filled = Ipv6Repr {
        src_addr,
        next_header,
        payload_len,
        hop_limit,
        ..repr
    };
    pktbuf.write(ip, |data| filled.emit(ipv6::new_unchecked_mut(data)))
        .ok_or(Error::Illegal)?;
    net_trace!("ipv6: filled {}", filled);

    match payload {
        Some(payload) => match netreg::calc_csum(pktbuf, payload, ip) {
            Ok(()) | Err(Error::NoChecksum) => Ok(()),
            Err(err) => {
                net_debug!("ipv6: checksum failed: {}", err);
                Err(err)
            },
        },
        None => Ok(()),
    }
}
