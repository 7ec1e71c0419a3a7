//! Transmission control blocks, the user side of a connection.
use core::cmp;
use core::time::Duration;
use std::sync::Arc;
use std::sync::mpsc::RecvTimeoutError;
use std::time::Instant;

use spin::Mutex;

use crate::layer::{ipv6, Error, Result};
use crate::netreg::{Entry, NetType};
use crate::pktbuf::Snip;
use crate::stack::Stack;
use crate::thread::{Mailbox, Msg, Pid, Threads};
use crate::wire::{Ipv6Address, TcpRepr, TcpSeqNumber};
use crate::wire::tcp::tcp;

use super::{context, packet, FourTuple};
use super::connection::{Connection, Env, Event, Segment, Signals, State, Timer};

/// Flags of an open call.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct OpenFlags(pub u8);

/// A transmission control block.
///
/// Owns one connection: its state machine, its registration in the protocol registry and the
/// mailbox its segments arrive in. All operations lock the block, so only one event is ever
/// evaluated against the connection at a time. Dropping the block unregisters it.
pub struct Tcb {
    stack: Arc<Stack>,
    mailbox: Mailbox,
    inner: Mutex<Inner>,
}

/// Cancels a blocking operation of a `Tcb` from another thread.
#[derive(Clone)]
pub struct Aborter {
    threads: Threads,
    pid: Pid,
}

struct Inner {
    connection: Connection,
    /// The context the block is currently registered under.
    registered: Option<u32>,
    /// When the armed connection timer expires.
    deadline: Option<Instant>,
}

struct StackEnv<'a> {
    stack: &'a Stack,
}

impl OpenFlags {
    pub const ACTIVE: OpenFlags = OpenFlags(0);
    pub const PASSIVE: OpenFlags = OpenFlags(1);

    pub fn passive(self) -> bool {
        self.0 & Self::PASSIVE.0 != 0
    }
}

impl Tcb {
    /// Initialize a closed block.
    pub fn new(stack: &Arc<Stack>) -> Self {
        Tcb {
            stack: stack.clone(),
            mailbox: stack.threads().mailbox(),
            inner: Mutex::new(Inner {
                connection: Connection::new(stack.config().tcp),
                registered: None,
                deadline: None,
            }),
        }
    }

    /// Tear down the block, removing its registration.
    pub fn destroy(self) {
        drop(self)
    }

    /// The pid of the mailbox receiving the segments of this connection.
    pub fn pid(&self) -> Pid {
        self.mailbox.pid()
    }

    pub fn state(&self) -> State {
        self.inner.lock().connection.current
    }

    /// A copy of the connection state.
    pub fn connection(&self) -> Connection {
        self.inner.lock().connection
    }

    pub fn aborter(&self) -> Aborter {
        Aborter {
            threads: self.stack.threads().clone(),
            pid: self.mailbox.pid(),
        }
    }

    /// Open the connection and wait until it is established.
    ///
    /// A passive open listens on `local_port` and ignores the peer parameters. An active open
    /// connects to `peer_port` of the 16 octet address `peer_addr`, from `local_port` or from a
    /// random free port if it is zero.
    ///
    /// Returns `Error::Refused` if the attempt ended without a connection, be it through a reset,
    /// the setup timeout or an abort.
    pub fn open(&self, local_port: u16, peer_addr: &[u8], peer_port: u16, flags: OpenFlags)
        -> Result<()>
    {
        {
            let mut inner = self.inner.lock();
            if inner.connection.current != State::Closed {
                return Err(Error::InUse);
            }

            let passive = flags.passive();
            if passive {
                if local_port == 0 {
                    return Err(Error::Fault);
                }
                if self.in_use(context(local_port, 0)) {
                    return Err(Error::InUse);
                }
                inner.connection.local_port = local_port;
            } else {
                if peer_addr.len() != Ipv6Address::LEN || peer_port == 0 {
                    return Err(Error::Fault);
                }
                let local_port = match local_port {
                    0 => self.ephemeral_port(peer_port),
                    port if self.in_use(context(port, peer_port)) => return Err(Error::InUse),
                    port => port,
                };
                let connection = &mut inner.connection;
                connection.local_port = local_port;
                connection.remote_port = peer_port;
                connection.remote_addr = Ipv6Address::from_bytes(peer_addr);
                connection.local_addr = Ipv6Address::UNSPECIFIED;
            }

            self.process(&mut inner, Event::CallOpen { passive }, None)?;
        }

        loop {
            match self.state() {
                State::Closed => return Err(Error::Refused),
                State::Listen | State::SynSent | State::SynReceived => (),
                _ => return Ok(()),
            }
            self.wait(None);
        }
    }

    /// Send data over the established connection.
    ///
    /// User data is not transferred yet, this only checks the connection and reports 0 octets.
    pub fn send(&self, _data: &[u8]) -> Result<usize> {
        let mut inner = self.inner.lock();
        if inner.connection.current != State::Established {
            return Err(Error::NotConnected);
        }
        self.process(&mut inner, Event::CallSend, None)?;
        Ok(0)
    }

    /// Receive data from the established connection.
    ///
    /// Like `send`, no data is transferred yet.
    pub fn recv(&self, _buf: &mut [u8]) -> Result<usize> {
        let mut inner = self.inner.lock();
        if inner.connection.current != State::Established {
            return Err(Error::NotConnected);
        }
        self.process(&mut inner, Event::CallRecv, None)?;
        Ok(0)
    }

    /// Close our side of an established connection.
    ///
    /// Fails without any effect if the connection is not established.
    pub fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.connection.current != State::Established {
            return Err(Error::NotConnected);
        }
        self.process(&mut inner, Event::CallClose, None)
    }

    /// Reset the connection immediately.
    pub fn abort(&self) {
        let mut inner = self.inner.lock();
        // Aborting never fails.
        let _ = self.process(&mut inner, Event::CallAbort, None);
    }

    /// Process one pending segment, abort or expired timer.
    ///
    /// Waits at most for `timeout`, or indefinitely if it is `None` and no timer is armed. Returns
    /// whether an event was processed.
    pub fn poll(&self, timeout: Option<Duration>) -> bool {
        self.wait(timeout)
    }

    fn wait(&self, limit: Option<Duration>) -> bool {
        let deadline = self.inner.lock().deadline;
        let now = Instant::now();
        let timeout = match (deadline, limit) {
            (Some(deadline), Some(limit)) =>
                Some(cmp::min(deadline.saturating_duration_since(now), limit)),
            (Some(deadline), None) => Some(deadline.saturating_duration_since(now)),
            (None, limit) => limit,
        };

        match self.mailbox.recv(timeout) {
            Ok(Msg::Rcv(pkt)) => self.receive(pkt),
            Ok(Msg::Snd(pkt)) => {
                net_debug!("tcp: {} got a packet to send, dropping", self.mailbox.pid());
                self.stack.pktbuf().release(pkt);
            },
            Ok(Msg::Abort) => self.abort(),
            Err(RecvTimeoutError::Timeout) => return self.expire(),
            Err(RecvTimeoutError::Disconnected) => self.abort(),
        }
        true
    }

    /// Signal the timeout if the timer has really expired.
    fn expire(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.deadline {
            Some(deadline) if deadline <= Instant::now() => {
                inner.deadline = None;
                let _ = self.process(&mut inner, Event::TimeTimeout, None);
                true
            },
            _ => false,
        }
    }

    fn receive(&self, pkt: Snip) {
        if let Some(segment) = self.parse(pkt) {
            net_trace!("tcp: {} received {}", self.mailbox.pid(), segment.repr);
            let mut inner = self.inner.lock();
            // Received segments never fail, they are absorbed.
            let _ = self.process(&mut inner, Event::RcvdPkt(segment), Some(&segment));
        }
        // The reference of this block ends with the handling of the segment.
        self.stack.pktbuf().release(pkt);
    }

    /// Read the addresses and header of a received segment.
    fn parse(&self, pkt: Snip) -> Option<Segment> {
        let pktbuf = self.stack.pktbuf();
        let ip = pktbuf.search_type(pkt, NetType::Ipv6)
            .and_then(|ip| ipv6::header(pktbuf, ip))?;
        let hdr = pktbuf.search_type(pkt, NetType::Tcp)?;

        let parsed = pktbuf.read(hdr, |data| {
            let packet = tcp::new_unchecked(data);
            TcpRepr::parse(packet)
                .map(|repr| (repr, usize::from(packet.header_len())))
        })?;
        let (repr, header_len) = match parsed {
            Ok(parsed) => parsed,
            Err(_err) => {
                net_debug!("tcp: dropping segment with bad header: {}", _err);
                return None;
            },
        };

        Some(Segment {
            src_addr: ip.src_addr,
            dst_addr: ip.dst_addr,
            repr,
            payload_len: pktbuf.size(hdr).saturating_sub(header_len),
        })
    }

    /// Evaluate an event and carry out its effects.
    fn process(&self, inner: &mut Inner, event: Event, segment: Option<&Segment>) -> Result<()> {
        let signals = {
            let mut env = StackEnv { stack: &self.stack };
            inner.connection.handle(event, &mut env)?
        };
        self.apply(inner, signals, segment);
        Ok(())
    }

    fn apply(&self, inner: &mut Inner, signals: Signals, segment: Option<&Segment>) {
        let pid = self.mailbox.pid();
        if signals.unregister || signals.register.is_some() {
            if let Some(ctx) = inner.registered.take() {
                self.stack.unregister(NetType::Tcp, Entry::new(ctx, pid));
            }
        }

        // Registered before anything is sent, the answer could arrive immediately.
        if let Some(ctx) = signals.register {
            self.stack.register(NetType::Tcp, Entry::new(ctx, pid));
            inner.registered = Some(ctx);
        }

        match signals.timer {
            Timer::Arm(duration) => inner.deadline = Some(Instant::now() + duration),
            Timer::Stop => inner.deadline = None,
            Timer::Unchanged => (),
        }

        if let Some(answer) = signals.answer {
            let (src, dst) = match segment {
                Some(segment) => (segment.dst_addr, segment.src_addr),
                None => (inner.connection.local_addr, inner.connection.remote_addr),
            };
            packet::send(&self.stack, &src, &dst, &answer);
        }
    }

    fn in_use(&self, ctx: u32) -> bool {
        StackEnv { stack: &self.stack }.in_use(ctx)
    }

    /// Draw random local ports until one is free towards the peer port.
    fn ephemeral_port(&self, peer_port: u16) -> u16 {
        loop {
            let port = self.stack.random_port();
            if !self.in_use(context(port, peer_port)) {
                return port;
            }
        }
    }
}

impl Drop for Tcb {
    fn drop(&mut self) {
        let pid = self.mailbox.pid();
        if let Some(ctx) = self.inner.get_mut().registered.take() {
            self.stack.unregister(NetType::Tcp, Entry::new(ctx, pid));
        }

        // Deliveries racing the unregistration fail from here on and release their packet.
        self.mailbox.close();
        while let Some(msg) = self.mailbox.try_recv() {
            match msg {
                Msg::Rcv(pkt) | Msg::Snd(pkt) => self.stack.pktbuf().release(pkt),
                Msg::Abort => (),
            }
        }
    }
}

impl Aborter {
    /// Abort the blocking operation, or the next one if none is running.
    ///
    /// Returns false if the block no longer exists.
    pub fn abort(&self) -> bool {
        self.threads.send(self.pid, Msg::Abort).is_ok()
    }
}

impl Env for StackEnv<'_> {
    fn initial_seq_num(&mut self, tuple: FourTuple) -> TcpSeqNumber {
        self.stack.initial_seq(tuple)
    }

    fn in_use(&self, ctx: u32) -> bool {
        self.stack.netreg().read()
            .lookup(NetType::Tcp, ctx)
            .is_some()
    }
}
