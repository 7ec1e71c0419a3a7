//! The TCP thread, demultiplexing received segments to their blocks.
use std::sync::{Arc, Weak};

use crate::layer::{ipv6, Error, Result};
use crate::netreg::{Entry, NetType, CTX_ALL};
use crate::pktbuf::Snip;
use crate::stack::Stack;
use crate::thread::{Mailbox, Msg, Pid};
use crate::wire::{TcpRepr, TcpSeqNumber};
use crate::wire::tcp::tcp;

use super::{context, packet, FourTuple};
use super::connection::{Connection, Env, Segment};

/// Start the TCP thread of the stack, and the IPv6 thread it depends on.
///
/// Only the first call starts the thread, all calls return its pid.
pub fn init(stack: &Arc<Stack>) -> Result<Pid> {
    ipv6::init(stack)?;

    let pid = stack.tcp_pid.call_once(|| {
        let weak = Arc::downgrade(stack);
        let stack_size = stack.config().thread_stack_size;
        let pid = match stack.threads().spawn("tcp", stack_size, move |mailbox| {
            event_loop(weak, mailbox)
        }) {
            Ok(pid) => pid,
            Err(_err) => {
                net_debug!("tcp: could not start thread: {}", _err);
                return None;
            },
        };
        stack.register(NetType::Tcp, Entry::new(CTX_ALL, pid));
        Some(pid)
    });
    pid.ok_or(Error::Exhausted)
}

fn event_loop(stack: Weak<Stack>, mailbox: Mailbox) {
    net_trace!("tcp: started as {}", mailbox.pid());
    while let Ok(msg) = mailbox.recv(None) {
        let stack = match stack.upgrade() {
            Some(stack) => stack,
            None => break,
        };
        match msg {
            Msg::Rcv(pkt) => receive(&stack, mailbox.pid(), pkt),
            Msg::Snd(pkt) => {
                // Blocks build complete segments themselves.
                net_debug!("tcp: unexpected packet to send, dropping");
                stack.pktbuf().release(pkt);
            },
            Msg::Abort => (),
        }
    }
    net_trace!("tcp: stopped");
}

/// Verify a received segment and forward it to the blocks registered for it.
fn receive(stack: &Stack, own: Pid, pkt: Snip) {
    let pktbuf = stack.pktbuf();
    let pkt = match pktbuf.start_write(pkt) {
        Some(pkt) => pkt,
        None => {
            net_debug!("tcp: no space to write packet, dropping");
            pktbuf.release(pkt);
            return;
        },
    };

    let (ip, hdr) = match (
        pktbuf.search_type(pkt, NetType::Ipv6).and_then(|ip| ipv6::header(pktbuf, ip)),
        pktbuf.search_type(pkt, NetType::Tcp),
    ) {
        (Some(ip), Some(hdr)) => (ip, hdr),
        _ => {
            net_debug!("tcp: packet without IPv6 or TCP header, dropping");
            pktbuf.release(pkt);
            return;
        },
    };

    let segment = pktbuf.to_vec(hdr);
    let parsed = tcp::new_checked(&segment)
        .and_then(|packet| {
            let header_len = usize::from(packet.header_len());
            let repr = TcpRepr::parse(packet)?;
            Ok((packet, repr, header_len))
        });
    let (packet, repr, header_len) = match parsed {
        Ok(parsed) => parsed,
        Err(_err) => {
            net_debug!("tcp: dropping malformed segment: {}", _err);
            pktbuf.release(pkt);
            return;
        },
    };

    if !packet.verify_checksum(&ip.src_addr, &ip.dst_addr) {
        net_debug!("tcp: wrong checksum from {}, dropping", ip.src_addr);
        pktbuf.release(pkt);
        return;
    }

    if pktbuf.len(hdr) > header_len && pktbuf.mark(hdr, header_len, NetType::Tcp).is_none() {
        pktbuf.release(pkt);
        return;
    }

    let receivers = receivers(stack, own, repr.dst_port, repr.src_port);
    if receivers.is_empty() {
        net_trace!("tcp: no connection for port {}", repr.dst_port);
        reset(stack, &Segment {
            src_addr: ip.src_addr,
            dst_addr: ip.dst_addr,
            repr,
            payload_len: segment.len() - header_len,
        });
        pktbuf.release(pkt);
        return;
    }

    pktbuf.hold(pkt, receivers.len() - 1);
    for pid in receivers {
        stack.deliver(pid, Msg::Rcv(pkt));
    }
}

/// The blocks of the port pair, or those listening on the local port.
fn receivers(stack: &Stack, own: Pid, local_port: u16, remote_port: u16) -> Vec<Pid> {
    let netreg = stack.netreg().read();
    let connected: Vec<Pid> = netreg.iter(NetType::Tcp, context(local_port, remote_port))
        .map(|entry| entry.pid)
        .filter(|&pid| pid != own)
        .collect();
    if !connected.is_empty() {
        return connected;
    }

    let listening = netreg.iter(NetType::Tcp, context(local_port, 0))
        .map(|entry| entry.pid)
        .collect();
    listening
}

/// Answer a segment to a port without connection like a closed connection would.
fn reset(stack: &Stack, segment: &Segment) {
    let mut closed = Connection::new(stack.config().tcp);
    let signals = closed.arrives(segment, &mut NoEnv);
    if let Some(answer) = signals.answer {
        packet::send(stack, &segment.dst_addr, &segment.src_addr, &answer);
    }
}

/// The closed state machine never asks for anything.
struct NoEnv;

impl Env for NoEnv {
    fn initial_seq_num(&mut self, _: FourTuple) -> TcpSeqNumber {
        TcpSeqNumber(0)
    }

    fn in_use(&self, _: u32) -> bool {
        false
    }
}
