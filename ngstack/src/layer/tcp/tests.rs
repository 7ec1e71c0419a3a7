use std::thread;
use std::time::{Duration, Instant};

use super::*;
use crate::layer::{ipv6, Error};
use crate::netreg::{Entry, NetType, CTX_ALL};
use crate::stack::{self, Stack, EPHEMERAL_PORT_START};
use crate::thread::Msg;
use crate::wire::{Ipv6Address, TcpFlags, TcpRepr, TcpSeqNumber};
use crate::wire::tcp::tcp;

const LOCAL_PORT: u16 = 2000;
const PEER_PORT: u16 = 4000;
const ISN: TcpSeqNumber = TcpSeqNumber(100);
const PEER_ISN: TcpSeqNumber = TcpSeqNumber(500);
const TIMEOUT: Duration = Duration::from_secs(5);

fn local_addr() -> Ipv6Address {
    Ipv6Address::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1)
}

fn peer_addr() -> Ipv6Address {
    Ipv6Address::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 2)
}

/// A fixed initial sequence number and a set of contexts taken by other connections.
#[derive(Default)]
struct TestEnv {
    used: Vec<u32>,
}

impl Env for TestEnv {
    fn initial_seq_num(&mut self, _: FourTuple) -> TcpSeqNumber {
        ISN
    }

    fn in_use(&self, ctx: u32) -> bool {
        self.used.contains(&ctx)
    }
}

/// A segment from the peer.
fn segment(flags: TcpFlags, seq: TcpSeqNumber, ack: Option<TcpSeqNumber>) -> Segment {
    let flags = match ack {
        Some(_) => flags | TcpFlags::ACK,
        None => flags,
    };
    Segment {
        src_addr: peer_addr(),
        dst_addr: local_addr(),
        repr: TcpRepr {
            src_port: PEER_PORT,
            dst_port: LOCAL_PORT,
            flags,
            seq_number: seq,
            ack_number: ack,
            window_len: 1000,
            max_seg_size: if flags.syn() { Some(1400) } else { None },
        },
        payload_len: 0,
    }
}

fn arrive(connection: &mut Connection, env: &mut TestEnv, segment: Segment) -> Signals {
    connection.handle(Event::RcvdPkt(segment), env).unwrap()
}

fn active() -> (Connection, TestEnv) {
    let mut env = TestEnv::default();
    let mut connection = Connection::new(Config::default());
    connection.local_port = LOCAL_PORT;
    connection.remote_port = PEER_PORT;
    connection.remote_addr = peer_addr();
    connection.handle(Event::CallOpen { passive: false }, &mut env).unwrap();
    (connection, env)
}

fn listening() -> (Connection, TestEnv) {
    let mut env = TestEnv::default();
    let mut connection = Connection::new(Config::default());
    connection.local_port = LOCAL_PORT;
    connection.handle(Event::CallOpen { passive: true }, &mut env).unwrap();
    (connection, env)
}

fn syn_received() -> (Connection, TestEnv) {
    let (mut connection, mut env) = listening();
    arrive(&mut connection, &mut env, segment(TcpFlags::SYN, PEER_ISN, None));
    assert_eq!(connection.current, State::SynReceived);
    (connection, env)
}

fn established() -> (Connection, TestEnv) {
    let (mut connection, mut env) = active();
    arrive(&mut connection, &mut env, segment(TcpFlags::SYN, PEER_ISN, Some(ISN + 1)));
    assert_eq!(connection.current, State::Established);
    (connection, env)
}

#[test]
fn acceptability() {
    let next = TcpSeqNumber(1000);
    // Empty segments in a closed window.
    assert!(acceptable(next, 0, next, 0));
    assert!(!acceptable(next + 1, 0, next, 0));

    // Empty segments in an open window.
    assert!(acceptable(next, 0, next, 10));
    assert!(acceptable(next + 9, 0, next, 10));
    assert!(!acceptable(next + 10, 0, next, 10));
    assert!(!acceptable(next - 1, 0, next, 10));

    // Data never fits a closed window.
    assert!(!acceptable(next, 5, next, 0));

    // Segments overlapping the window at either end.
    assert!(acceptable(next - 4, 5, next, 10));
    assert!(!acceptable(next - 5, 5, next, 10));
    assert!(acceptable(next + 9, 5, next, 10));
    assert!(!acceptable(next + 10, 5, next, 10));

    // The window may wrap around.
    let next = TcpSeqNumber(i32::max_value() - 1);
    assert!(acceptable(next + 4, 1, next, 10));
    assert!(!acceptable(next + 10, 1, next, 10));
}

#[test]
fn context_of_ports() {
    assert_eq!(context(2000, 0), 2000);
    assert_eq!(context(2000, 1), 0x0001_07d0);
    assert_ne!(context(1, 2), context(2, 1));
}

#[test]
fn hdr_build_bare() {
    let stack = Stack::new(Default::default());
    let pktbuf = stack.pktbuf();
    let hdr = hdr_build(&stack, None, 1, 2).unwrap();
    assert_eq!(pktbuf.ty(hdr), Some(NetType::Tcp));

    let bytes = pktbuf.to_vec(hdr);
    let packet = tcp::new_checked(&bytes).unwrap();
    let repr = TcpRepr::parse(packet).unwrap();
    assert_eq!(usize::from(packet.header_len()), 20);
    assert_eq!(repr.src_port, 1);
    assert_eq!(repr.dst_port, 2);
    assert_eq!(repr.seq_number, TcpSeqNumber(0));
    assert_eq!(repr.ack_number, None);
    assert_eq!(repr.flags, TcpFlags::default());
    assert_eq!(repr.window_len, Config::default().window);

    assert_eq!(hdr_build(&stack, None, 0, 2), Err(Error::Fault));
    assert_eq!(hdr_build(&stack, None, 1, 0), Err(Error::Fault));
}

#[test]
fn checksum_reference() {
    let stack = Stack::new(Default::default());
    let pktbuf = stack.pktbuf();
    let loopback = Ipv6Address::LOOPBACK;
    let hdr = hdr_build(&stack, None, 1, 2).unwrap();
    let ip = ipv6::hdr_build(&stack, Some(hdr), loopback.as_bytes(), loopback.as_bytes())
        .unwrap();

    calc_csum(pktbuf, hdr, ip).unwrap();
    let bytes = pktbuf.to_vec(hdr);
    let packet = tcp::new_unchecked(&bytes);
    assert_eq!(packet.checksum(), 0xa7e0);
    assert!(packet.verify_checksum(&loopback, &loopback));

    assert_eq!(calc_csum(pktbuf, hdr, hdr), Err(Error::Illegal));
    pktbuf.release(ip);
    assert_eq!(pktbuf.live(), 0);
}

#[test]
fn open_active() {
    let mut env = TestEnv::default();
    let mut connection = Connection::new(Config::default());
    connection.local_port = LOCAL_PORT;
    connection.remote_port = PEER_PORT;
    connection.remote_addr = peer_addr();
    let signals = connection.handle(Event::CallOpen { passive: false }, &mut env).unwrap();

    assert_eq!(connection.current, State::SynSent);
    assert_eq!(connection.send.unacked, ISN);
    assert_eq!(connection.send.next, ISN + 1);
    assert_eq!(signals.register, Some(context(LOCAL_PORT, PEER_PORT)));
    assert_eq!(signals.timer, Timer::Arm(Config::default().syn_sent_timeout));
    assert_eq!(signals.answer, Some(TcpRepr {
        src_port: LOCAL_PORT,
        dst_port: PEER_PORT,
        flags: TcpFlags::SYN,
        seq_number: ISN,
        ack_number: None,
        window_len: Config::default().window,
        max_seg_size: Some(Config::default().mss),
    }));
}

#[test]
fn open_requires_destination() {
    let mut connection = Connection::new(Config::default());
    connection.local_port = LOCAL_PORT;
    connection.remote_port = PEER_PORT;
    assert_eq!(
        connection.handle(Event::CallOpen { passive: false }, &mut TestEnv::default()),
        Err(Error::DestinationRequired));
    assert_eq!(connection.current, State::Closed);
}

#[test]
fn open_passive() {
    let mut env = TestEnv::default();
    let mut connection = Connection::new(Config::default());
    connection.local_port = LOCAL_PORT;
    connection.remote_addr = peer_addr();
    let signals = connection.handle(Event::CallOpen { passive: true }, &mut env).unwrap();

    assert_eq!(connection.current, State::Listen);
    assert_eq!(connection.remote_addr, Ipv6Address::UNSPECIFIED);
    assert_eq!(signals, Signals {
        register: Some(context(LOCAL_PORT, 0)),
        ..Signals::default()
    });

    assert_eq!(
        connection.handle(Event::CallOpen { passive: true }, &mut env),
        Err(Error::InUse));
}

#[test]
fn syn_sent_established() {
    let (mut connection, mut env) = active();
    let signals = arrive(&mut connection, &mut env,
        segment(TcpFlags::SYN, PEER_ISN, Some(ISN + 1)));

    assert_eq!(connection.current, State::Established);
    assert_eq!(connection.previous, State::SynSent);
    assert_eq!(connection.recv.next, PEER_ISN + 1);
    assert_eq!(connection.recv.initial_seq, PEER_ISN);
    assert_eq!(connection.send.unacked, ISN + 1);
    assert_eq!(connection.send.window, 1000);
    assert_eq!(connection.peer_mss, 1400);
    assert_eq!(connection.local_addr, local_addr());

    assert_eq!(signals.timer, Timer::Stop);
    let answer = signals.answer.unwrap();
    assert_eq!(answer.flags, TcpFlags::ACK);
    assert_eq!(answer.seq_number, ISN + 1);
    assert_eq!(answer.ack_number, Some(PEER_ISN + 1));
    assert_eq!(answer.max_seg_size, None);
}

#[test]
fn syn_sent_bad_ack() {
    let (mut connection, mut env) = active();
    let signals = arrive(&mut connection, &mut env,
        segment(TcpFlags::SYN, PEER_ISN, Some(TcpSeqNumber(300))));
    assert_eq!(connection.current, State::SynSent);
    let answer = signals.answer.unwrap();
    assert_eq!(answer.flags, TcpFlags::RST);
    assert_eq!(answer.seq_number, TcpSeqNumber(300));
    assert_eq!(answer.ack_number, None);

    // Resets are never answered.
    let signals = arrive(&mut connection, &mut env,
        segment(TcpFlags::RST, PEER_ISN, Some(TcpSeqNumber(300))));
    assert_eq!(signals, Signals::default());
    assert_eq!(connection.current, State::SynSent);
}

#[test]
fn syn_sent_refused() {
    let (mut connection, mut env) = active();
    let signals = arrive(&mut connection, &mut env, segment(TcpFlags::RST, PEER_ISN, None));
    assert_eq!(signals, Signals::default());
    assert_eq!(connection.current, State::SynSent);

    let signals = arrive(&mut connection, &mut env,
        segment(TcpFlags::RST, TcpSeqNumber(0), Some(ISN + 1)));
    assert_eq!(connection.current, State::Closed);
    assert!(signals.unregister);
    assert_eq!(signals.timer, Timer::Stop);
    assert_eq!(signals.answer, None);
}

#[test]
fn syn_sent_timeout() {
    let (mut connection, mut env) = active();
    let signals = connection.handle(Event::TimeTimeout, &mut env).unwrap();
    assert_eq!(connection.current, State::Closed);
    assert!(signals.unregister);

    // Timers of a closed connection are stale.
    let signals = connection.handle(Event::TimeTimeout, &mut env).unwrap();
    assert_eq!(signals, Signals::default());
}

#[test]
fn listen_syn() {
    let (mut connection, mut env) = listening();
    let signals = arrive(&mut connection, &mut env, segment(TcpFlags::SYN, PEER_ISN, None));

    assert_eq!(connection.current, State::SynReceived);
    assert_eq!(connection.previous, State::Listen);
    assert_eq!(connection.remote_port, PEER_PORT);
    assert_eq!(connection.remote_addr, peer_addr());
    assert_eq!(connection.local_addr, local_addr());
    assert_eq!(connection.recv.next, PEER_ISN + 1);
    assert_eq!(connection.send.window, 1000);

    assert_eq!(signals.register, Some(context(LOCAL_PORT, PEER_PORT)));
    assert_eq!(signals.timer, Timer::Arm(Config::default().syn_rcvd_timeout));
    let answer = signals.answer.unwrap();
    assert_eq!(answer.flags, TcpFlags::SYN | TcpFlags::ACK);
    assert_eq!(answer.seq_number, ISN);
    assert_eq!(answer.ack_number, Some(PEER_ISN + 1));
    assert_eq!(answer.max_seg_size, Some(Config::default().mss));
}

#[test]
fn listen_ignores_and_resets() {
    let (mut connection, mut env) = listening();

    let signals = arrive(&mut connection, &mut env, segment(TcpFlags::RST, PEER_ISN, None));
    assert_eq!(signals, Signals::default());

    let signals = arrive(&mut connection, &mut env, segment(TcpFlags::FIN, PEER_ISN, None));
    assert_eq!(signals, Signals::default());

    let signals = arrive(&mut connection, &mut env,
        segment(TcpFlags::default(), PEER_ISN, Some(TcpSeqNumber(42))));
    let answer = signals.answer.unwrap();
    assert_eq!(answer.flags, TcpFlags::RST);
    assert_eq!(answer.seq_number, TcpSeqNumber(42));
    assert_eq!(answer.src_port, LOCAL_PORT);
    assert_eq!(answer.dst_port, PEER_PORT);
    assert_eq!(connection.current, State::Listen);
}

#[test]
fn listen_port_pair_in_use() {
    let (mut connection, mut env) = listening();
    env.used.push(context(LOCAL_PORT, PEER_PORT));
    let signals = arrive(&mut connection, &mut env, segment(TcpFlags::SYN, PEER_ISN, None));
    assert_eq!(signals, Signals::default());
    assert_eq!(connection.current, State::Listen);
}

#[test]
fn syn_received_ack() {
    let (mut connection, mut env) = syn_received();
    let signals = arrive(&mut connection, &mut env,
        segment(TcpFlags::default(), PEER_ISN + 1, Some(ISN + 1)));
    assert_eq!(connection.current, State::Established);
    assert_eq!(connection.send.unacked, ISN + 1);
    assert_eq!(signals, Signals { timer: Timer::Stop, ..Signals::default() });
}

#[test]
fn syn_received_fin() {
    let (mut connection, mut env) = syn_received();
    let signals = arrive(&mut connection, &mut env,
        segment(TcpFlags::FIN, PEER_ISN + 1, Some(ISN + 1)));
    assert_eq!(connection.current, State::CloseWait);
    assert_eq!(connection.recv.next, PEER_ISN + 2);
    assert_eq!(signals.answer.unwrap().ack_number, Some(PEER_ISN + 2));
}

#[test]
fn syn_received_reset_listens_again() {
    let (mut connection, mut env) = syn_received();
    let signals = arrive(&mut connection, &mut env, segment(TcpFlags::RST, PEER_ISN + 1, None));
    assert_eq!(connection.current, State::Listen);
    assert_eq!(connection.remote_port, 0);
    assert_eq!(connection.remote_addr, Ipv6Address::UNSPECIFIED);
    assert_eq!(signals.register, Some(context(LOCAL_PORT, 0)));
    assert_eq!(signals.timer, Timer::Stop);
    assert_eq!(signals.answer, None);
}

#[test]
fn syn_received_bad_segments() {
    let (mut connection, mut env) = syn_received();
    let signals = arrive(&mut connection, &mut env,
        segment(TcpFlags::default(), PEER_ISN + 1, Some(TcpSeqNumber(300))));
    assert_eq!(connection.current, State::SynReceived);
    let answer = signals.answer.unwrap();
    assert_eq!(answer.flags, TcpFlags::RST);
    assert_eq!(answer.seq_number, TcpSeqNumber(300));

    // A SYN in the window resets the connection.
    let signals = arrive(&mut connection, &mut env, segment(TcpFlags::SYN, PEER_ISN + 1, None));
    assert_eq!(connection.current, State::Closed);
    assert!(signals.unregister);
    let answer = signals.answer.unwrap();
    assert_eq!(answer.flags, TcpFlags::RST | TcpFlags::ACK);
    assert_eq!(answer.seq_number, TcpSeqNumber(0));
    assert_eq!(answer.ack_number, Some(PEER_ISN + 2));
}

#[test]
fn syn_received_timeout() {
    let (mut connection, mut env) = syn_received();
    let signals = connection.handle(Event::TimeTimeout, &mut env).unwrap();
    assert_eq!(connection.current, State::Closed);
    assert!(signals.unregister);
}

#[test]
fn established_reset() {
    let (mut connection, mut env) = established();
    let signals = arrive(&mut connection, &mut env, segment(TcpFlags::RST, PEER_ISN + 1, None));
    assert_eq!(connection.current, State::Closed);
    assert!(signals.unregister);
    assert_eq!(signals.answer, None);
}

#[test]
fn established_unacceptable() {
    let (mut connection, mut env) = established();
    let far = PEER_ISN + 9000;

    let signals = arrive(&mut connection, &mut env,
        segment(TcpFlags::default(), far, Some(ISN + 1)));
    assert_eq!(connection.current, State::Established);
    let answer = signals.answer.unwrap();
    assert_eq!(answer.flags, TcpFlags::ACK);
    assert_eq!(answer.seq_number, ISN + 1);
    assert_eq!(answer.ack_number, Some(PEER_ISN + 1));

    // Out of window resets are dropped silently.
    let signals = arrive(&mut connection, &mut env, segment(TcpFlags::RST, far, None));
    assert_eq!(signals, Signals::default());
    assert_eq!(connection.current, State::Established);
}

#[test]
fn established_acks() {
    let (mut connection, mut env) = established();

    // Acknowledges data never sent.
    let signals = arrive(&mut connection, &mut env,
        segment(TcpFlags::default(), PEER_ISN + 1, Some(ISN + 50)));
    assert_eq!(signals.answer.unwrap().ack_number, Some(PEER_ISN + 1));
    assert_eq!(connection.send.unacked, ISN + 1);

    // Window updates are taken over.
    let mut update = segment(TcpFlags::default(), PEER_ISN + 1, Some(ISN + 1));
    update.repr.window_len = 3000;
    let signals = arrive(&mut connection, &mut env, update);
    assert_eq!(signals, Signals::default());
    assert_eq!(connection.send.window, 3000);

    // Without ACK nothing happens.
    let signals = arrive(&mut connection, &mut env,
        segment(TcpFlags::default(), PEER_ISN + 1, None));
    assert_eq!(signals, Signals::default());
    assert_eq!(connection.current, State::Established);
}

#[test]
fn established_syn() {
    let (mut connection, mut env) = established();
    let signals = arrive(&mut connection, &mut env, segment(TcpFlags::SYN, PEER_ISN + 1, None));
    assert_eq!(connection.current, State::Closed);
    assert_eq!(signals.answer.unwrap().flags, TcpFlags::RST | TcpFlags::ACK);
}

#[test]
fn active_close() {
    let (mut connection, mut env) = established();
    let signals = connection.handle(Event::CallClose, &mut env).unwrap();
    assert_eq!(connection.current, State::FinWait1);
    assert_eq!(connection.send.next, ISN + 2);
    let fin = signals.answer.unwrap();
    assert_eq!(fin.flags, TcpFlags::FIN | TcpFlags::ACK);
    assert_eq!(fin.seq_number, ISN + 1);
    assert_eq!(fin.ack_number, Some(PEER_ISN + 1));

    let signals = arrive(&mut connection, &mut env,
        segment(TcpFlags::default(), PEER_ISN + 1, Some(ISN + 2)));
    assert_eq!(connection.current, State::FinWait2);
    assert_eq!(signals, Signals::default());

    let signals = arrive(&mut connection, &mut env,
        segment(TcpFlags::FIN, PEER_ISN + 1, Some(ISN + 2)));
    assert_eq!(connection.current, State::TimeWait);
    assert_eq!(connection.recv.next, PEER_ISN + 2);
    let answer = signals.answer.unwrap();
    assert_eq!(answer.flags, TcpFlags::ACK);
    assert_eq!(answer.seq_number, ISN + 2);
    assert_eq!(answer.ack_number, Some(PEER_ISN + 2));
}

#[test]
fn simultaneous_close() {
    let (mut connection, mut env) = established();
    connection.handle(Event::CallClose, &mut env).unwrap();

    // Their FIN crosses ours.
    let signals = arrive(&mut connection, &mut env,
        segment(TcpFlags::FIN, PEER_ISN + 1, Some(ISN + 1)));
    assert_eq!(connection.current, State::Closing);
    assert_eq!(signals.answer.unwrap().ack_number, Some(PEER_ISN + 2));

    arrive(&mut connection, &mut env,
        segment(TcpFlags::default(), PEER_ISN + 2, Some(ISN + 2)));
    assert_eq!(connection.current, State::TimeWait);
}

#[test]
fn fin_acked_with_fin() {
    let (mut connection, mut env) = established();
    connection.handle(Event::CallClose, &mut env).unwrap();
    arrive(&mut connection, &mut env, segment(TcpFlags::FIN, PEER_ISN + 1, Some(ISN + 2)));
    assert_eq!(connection.current, State::TimeWait);
}

#[test]
fn passive_close() {
    let (mut connection, mut env) = established();
    let signals = arrive(&mut connection, &mut env,
        segment(TcpFlags::FIN, PEER_ISN + 1, Some(ISN + 1)));
    assert_eq!(connection.current, State::CloseWait);
    assert_eq!(signals.answer.unwrap().ack_number, Some(PEER_ISN + 2));

    // A FIN with payload is not honoured.
    let (mut other, mut other_env) = established();
    let mut with_data = segment(TcpFlags::FIN, PEER_ISN + 1, Some(ISN + 1));
    with_data.payload_len = 10;
    arrive(&mut other, &mut other_env, with_data);
    assert_eq!(other.current, State::Established);
    assert_eq!(other.recv.next, PEER_ISN + 1);

    let signals = connection.handle(Event::CallClose, &mut env).unwrap();
    assert_eq!(connection.current, State::Closing);
    let fin = signals.answer.unwrap();
    assert_eq!(fin.flags, TcpFlags::FIN | TcpFlags::ACK);
    assert_eq!(fin.ack_number, Some(PEER_ISN + 2));

    arrive(&mut connection, &mut env,
        segment(TcpFlags::default(), PEER_ISN + 2, Some(ISN + 2)));
    assert_eq!(connection.current, State::TimeWait);
}

#[test]
fn abort() {
    let (mut connection, mut env) = established();
    let signals = connection.handle(Event::CallAbort, &mut env).unwrap();
    assert_eq!(connection.current, State::Closed);
    assert!(signals.unregister);
    let answer = signals.answer.unwrap();
    assert_eq!(answer.flags, TcpFlags::RST);
    assert_eq!(answer.seq_number, ISN + 1);
    assert_eq!(answer.ack_number, None);

    // Nobody to tell about a listening connection.
    let (mut connection, mut env) = listening();
    let signals = connection.handle(Event::CallAbort, &mut env).unwrap();
    assert_eq!(connection.current, State::Closed);
    assert!(signals.unregister);
    assert_eq!(signals.answer, None);

    let signals = connection.handle(Event::CallAbort, &mut env).unwrap();
    assert_eq!(signals, Signals::default());
}

#[test]
fn calls_require_connection() {
    let (mut connection, mut env) = listening();
    assert_eq!(connection.handle(Event::CallClose, &mut env), Err(Error::NotConnected));
    assert_eq!(connection.handle(Event::CallSend, &mut env), Err(Error::NotConnected));
    assert_eq!(connection.handle(Event::CallRecv, &mut env), Err(Error::NotConnected));
    assert_eq!(connection.current, State::Listen);

    let (mut connection, mut env) = established();
    assert_eq!(connection.handle(Event::CallSend, &mut env), Ok(Signals::default()));
    assert_eq!(connection.handle(Event::TimeRetransmit, &mut env), Ok(Signals::default()));
}

#[test]
fn closed_answers_with_reset() {
    let mut connection = Connection::new(Config::default());
    let mut env = TestEnv::default();

    let signals = arrive(&mut connection, &mut env, segment(TcpFlags::SYN, PEER_ISN, None));
    let answer = signals.answer.unwrap();
    assert_eq!(answer.flags, TcpFlags::RST | TcpFlags::ACK);
    assert_eq!(answer.seq_number, TcpSeqNumber(0));
    assert_eq!(answer.ack_number, Some(PEER_ISN + 1));
    assert_eq!(answer.src_port, LOCAL_PORT);
    assert_eq!(answer.dst_port, PEER_PORT);

    let signals = arrive(&mut connection, &mut env, segment(TcpFlags::RST, PEER_ISN, None));
    assert_eq!(signals, Signals::default());
}

/// Poll `condition` until it holds or a few seconds have passed.
fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + TIMEOUT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    condition()
}

fn registered(stack: &Stack, ctx: u32) -> bool {
    stack.netreg().read().count(NetType::Tcp, ctx) > 0
}

/// Listen on `port` in another thread, returning the block once the open finished.
fn listen(stack: &Stack, tcb: Tcb, port: u16) -> thread::JoinHandle<(Tcb, crate::layer::Result<()>)> {
    let handle = thread::spawn(move || {
        let result = tcb.open(port, &[], 0, OpenFlags::PASSIVE);
        (tcb, result)
    });
    assert!(eventually(|| registered(stack, context(port, 0))));
    handle
}

#[test]
fn handshake() {
    let stack = Stack::new(Default::default());
    init(&stack).unwrap();

    let server = listen(&stack, Tcb::new(&stack), LOCAL_PORT);
    let client = Tcb::new(&stack);
    client.open(0, Ipv6Address::LOOPBACK.as_bytes(), LOCAL_PORT, OpenFlags::ACTIVE).unwrap();
    let (server, result) = server.join().unwrap();
    result.unwrap();

    assert_eq!(client.state(), State::Established);
    assert_eq!(server.state(), State::Established);
    let (c, s) = (client.connection(), server.connection());
    assert_eq!(c.local_addr, Ipv6Address::LOOPBACK);
    assert_eq!(s.remote_addr, Ipv6Address::LOOPBACK);
    assert_eq!(s.remote_port, c.local_port);
    assert!(c.local_port >= EPHEMERAL_PORT_START);
    // Each side consumed exactly the SYN of the other.
    assert_eq!(s.recv.initial_seq, c.send.initial_seq);
    assert_eq!(c.recv.initial_seq, s.send.initial_seq);
    assert_eq!(s.recv.next, c.send.initial_seq + 1);
    assert_eq!(c.recv.next, s.send.initial_seq + 1);
    assert_eq!(c.send.next, c.send.initial_seq + 1);
    assert_eq!(s.send.next, s.send.initial_seq + 1);
    assert_eq!(c.send.unacked, c.send.initial_seq + 1);
    assert_eq!(s.send.unacked, s.send.initial_seq + 1);
    assert_eq!(c.peer_mss, Config::default().mss);

    // The listening registration was replaced by the connected one.
    assert!(!registered(&stack, context(LOCAL_PORT, 0)));
    assert!(registered(&stack, context(LOCAL_PORT, c.local_port)));
    assert!(registered(&stack, context(c.local_port, LOCAL_PORT)));

    assert_eq!(client.close(), Ok(()));
    assert_eq!(client.state(), State::FinWait1);

    drop(client);
    server.destroy();
    assert!(!registered(&stack, context(LOCAL_PORT, c.local_port)));
    assert!(eventually(|| stack.pktbuf().live() == 0));
}

#[test]
fn abort_resets_peer() {
    let stack = Stack::new(Default::default());
    init(&stack).unwrap();

    let server = listen(&stack, Tcb::new(&stack), LOCAL_PORT);
    let client = Tcb::new(&stack);
    client.open(0, Ipv6Address::LOOPBACK.as_bytes(), LOCAL_PORT, OpenFlags::ACTIVE).unwrap();
    let (server, result) = server.join().unwrap();
    result.unwrap();
    let ctx = server.connection().context();

    client.abort();
    assert_eq!(client.state(), State::Closed);
    assert!(server.poll(Some(TIMEOUT)));
    assert_eq!(server.state(), State::Closed);
    assert!(!registered(&stack, ctx));

    drop((client, server));
    assert!(eventually(|| stack.pktbuf().live() == 0));
}

#[test]
fn operations_need_connection() {
    let stack = Stack::new(Default::default());
    let tcb = Tcb::new(&stack);
    assert_eq!(tcb.close(), Err(Error::NotConnected));
    assert_eq!(tcb.send(b"data"), Err(Error::NotConnected));
    assert_eq!(tcb.recv(&mut [0; 4]), Err(Error::NotConnected));
    assert_eq!(tcb.state(), State::Closed);
}

#[test]
fn destroy_releases_deliveries() {
    let stack = Stack::new(Default::default());
    let pktbuf = stack.pktbuf();
    let tcb = Tcb::new(&stack);
    let pid = tcb.pid();

    let queued = pktbuf.add(None, &[0; 20], NetType::Tcp).unwrap();
    assert!(stack.deliver(pid, Msg::Rcv(queued)));
    tcb.destroy();
    assert_eq!(pktbuf.live(), 0);

    // The pid is gone, late deliveries give the packet back.
    let late = pktbuf.add(None, &[0; 20], NetType::Tcp).unwrap();
    assert!(!stack.deliver(pid, Msg::Rcv(late)));
    assert_eq!(pktbuf.live(), 0);
    assert!(!stack.threads().exists(pid));
}

#[test]
fn received_segment_released_after_handling() {
    let stack = Stack::new(Default::default());
    let pktbuf = stack.pktbuf();
    let ipv6_thread = stack.threads().mailbox();
    stack.register(NetType::Ipv6, Entry::new(CTX_ALL, ipv6_thread.pid()));
    let tcb = Tcb::new(&stack);

    let hdr = hdr_build(&stack, None, PEER_PORT, LOCAL_PORT).unwrap();
    let pkt = ipv6::hdr_build(&stack, Some(hdr), peer_addr().as_bytes(), local_addr().as_bytes())
        .unwrap();
    pktbuf.hold(pkt, 1);
    assert!(stack.deliver(tcb.pid(), Msg::Rcv(pkt)));
    assert!(tcb.poll(Some(TIMEOUT)));
    assert_eq!(pktbuf.users(pkt), 1);

    // The closed block answered with a reset.
    let answer = match ipv6_thread.try_recv() {
        Some(Msg::Snd(answer)) => answer,
        other => panic!("expected reset, got {:?}", other),
    };
    let tcp_hdr = pktbuf.search_type(answer, NetType::Tcp).unwrap();
    assert!(tcp::new_unchecked(&pktbuf.to_vec(tcp_hdr)).flags().rst());

    pktbuf.release(answer);
    pktbuf.release(pkt);
    assert_eq!(pktbuf.live(), 0);
}

#[test]
fn open_errors() {
    let stack = Stack::new(Default::default());
    init(&stack).unwrap();
    let tcb = Tcb::new(&stack);
    let loopback = Ipv6Address::LOOPBACK;

    assert_eq!(tcb.open(0, &[0; 4], 80, OpenFlags::ACTIVE), Err(Error::Fault));
    assert_eq!(tcb.open(0, loopback.as_bytes(), 0, OpenFlags::ACTIVE), Err(Error::Fault));
    assert_eq!(tcb.open(0, &[], 0, OpenFlags::PASSIVE), Err(Error::Fault));
    assert_eq!(
        tcb.open(0, Ipv6Address::UNSPECIFIED.as_bytes(), 80, OpenFlags::ACTIVE),
        Err(Error::DestinationRequired));
    assert_eq!(tcb.state(), State::Closed);

    // A second listener on the same port.
    let listener = Tcb::new(&stack);
    let aborter = listener.aborter();
    let listener = listen(&stack, listener, LOCAL_PORT);
    assert_eq!(tcb.open(LOCAL_PORT, &[], 0, OpenFlags::PASSIVE), Err(Error::InUse));

    assert!(aborter.abort());
    let (listener, result) = listener.join().unwrap();
    assert_eq!(result, Err(Error::Refused));
    assert_eq!(listener.state(), State::Closed);
    assert!(!registered(&stack, context(LOCAL_PORT, 0)));

    drop(listener);
    assert!(!aborter.abort());
}

#[test]
fn refused_by_closed_port() {
    let stack = Stack::new(Default::default());
    init(&stack).unwrap();
    let tcb = Tcb::new(&stack);
    assert_eq!(
        tcb.open(5000, Ipv6Address::LOOPBACK.as_bytes(), 3000, OpenFlags::ACTIVE),
        Err(Error::Refused));
    assert_eq!(tcb.state(), State::Closed);
    assert!(!registered(&stack, context(5000, 3000)));

    drop(tcb);
    assert!(eventually(|| stack.pktbuf().live() == 0));
}

#[test]
fn syn_sent_times_out() {
    let config = stack::Config {
        tcp: Config {
            syn_sent_timeout: Duration::from_millis(50),
            ..Config::default()
        },
        ..stack::Config::default()
    };
    let stack = Stack::new(config);
    init(&stack).unwrap();

    // No route, the SYN is dropped by the IPv6 layer.
    let tcb = Tcb::new(&stack);
    let peer = Ipv6Address::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1);
    let start = Instant::now();
    assert_eq!(tcb.open(5000, peer.as_bytes(), 80, OpenFlags::ACTIVE), Err(Error::Refused));
    assert!(start.elapsed() >= Duration::from_millis(50));
    assert!(!registered(&stack, context(5000, 80)));
}
