//! Segment construction and the TCP checksum.
use crate::layer::{ipv6, Error, Result};
use crate::netreg::{NetType, CTX_ALL};
use crate::pktbuf::{Pktbuf, Snip};
use crate::stack::Stack;
use crate::wire::{Ipv6Address, TcpFlags, TcpRepr, TcpSeqNumber};
use crate::wire::tcp::{tcp, HEADER_LEN};

/// Prepend a bare TCP header to `payload`.
///
/// Sequence and acknowledgment numbers as well as the flags are zero, the window is the one of
/// the stack configuration. Both ports must be non-zero, otherwise this fails with
/// `Error::Fault`.
pub fn hdr_build(stack: &Stack, payload: Option<Snip>, src_port: u16, dst_port: u16)
    -> Result<Snip>
{
    if src_port == 0 || dst_port == 0 {
        return Err(Error::Fault);
    }

    let repr = TcpRepr {
        src_port,
        dst_port,
        flags: TcpFlags::default(),
        seq_number: TcpSeqNumber(0),
        ack_number: None,
        window_len: stack.config().tcp.window,
        max_seg_size: None,
    };
    header(stack.pktbuf(), payload, &repr)
}

fn header(pktbuf: &Pktbuf, payload: Option<Snip>, repr: &TcpRepr) -> Result<Snip> {
    let mut header = [0; HEADER_LEN + 4];
    let header = &mut header[..repr.header_len()];
    repr.emit(tcp::new_unchecked_mut(header));
    pktbuf.add(payload, header, NetType::Tcp)
        .ok_or(Error::Exhausted)
}

/// Compute and store the checksum of the segment starting at `hdr`.
///
/// Covers the header, all following payload snips and the pseudo header of the IPv6 snip
/// `pseudo`.
pub fn calc_csum(pktbuf: &Pktbuf, hdr: Snip, pseudo: Snip) -> Result<()> {
    if pktbuf.ty(pseudo) != Some(NetType::Ipv6) {
        return Err(Error::Illegal);
    }
    let ip = ipv6::header(pktbuf, pseudo).ok_or(Error::Illegal)?;

    let mut segment = pktbuf.to_vec(hdr);
    if segment.len() < HEADER_LEN {
        return Err(Error::Illegal);
    }
    let packet = tcp::new_unchecked_mut(&mut segment);
    packet.fill_checksum(&ip.src_addr, &ip.dst_addr);
    let checksum = packet.checksum();

    pktbuf.write(hdr, |data| tcp::new_unchecked_mut(data).set_checksum(checksum))
        .ok_or(Error::Illegal)
}

/// Build a complete segment from `src` to `dst`.
///
/// An unspecified source is selected by the IPv6 layer when the segment is sent.
pub(crate) fn build(
    stack: &Stack,
    src: &Ipv6Address,
    dst: &Ipv6Address,
    repr: &TcpRepr,
    payload: &[u8],
) -> Result<Snip> {
    let pktbuf = stack.pktbuf();
    let data = if payload.is_empty() {
        None
    } else {
        Some(pktbuf.add(None, payload, NetType::Undef).ok_or(Error::Exhausted)?)
    };

    let segment = match header(pktbuf, data, repr) {
        Ok(segment) => segment,
        Err(err) => {
            if let Some(data) = data {
                pktbuf.release(data);
            }
            return Err(err);
        },
    };

    let src: &[u8] = if src.is_unspecified() { &[] } else { src.as_bytes() };
    ipv6::hdr_build(stack, Some(segment), src, dst.as_bytes())
        .map_err(|err| {
            pktbuf.release(segment);
            err
        })
}

/// Build and hand a segment to the IPv6 layer.
pub(crate) fn send(stack: &Stack, src: &Ipv6Address, dst: &Ipv6Address, repr: &TcpRepr) {
    let pkt = match build(stack, src, dst, repr, &[]) {
        Ok(pkt) => pkt,
        Err(_err) => {
            net_debug!("tcp: could not build segment: {}", _err);
            return;
        },
    };

    net_trace!("tcp: sending {} to {}", repr, dst);
    if stack.dispatch_send(NetType::Ipv6, CTX_ALL, pkt) == 0 {
        net_debug!("tcp: no IPv6 thread, dropping segment");
        stack.pktbuf().release(pkt);
    }
}
