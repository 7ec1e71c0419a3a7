//! The connection state machine.
//!
//! A [`Connection`] holds the state and sequence variables of one TCP connection and reacts to
//! [`Event`]s. It never touches packets, the registry or clocks itself. Instead every transition
//! reports its effects as [`Signals`] which the owning [`Tcb`] carries out: segments to send,
//! registry updates and timer changes. This keeps all transitions testable without a stack.
//!
//! [`Connection`]: struct.Connection.html
//! [`Event`]: enum.Event.html
//! [`Signals`]: struct.Signals.html
//! [`Tcb`]: struct.Tcb.html
use core::time::Duration;

use crate::layer::{Error, Result};
use crate::wire::{Ipv6Address, TcpFlags, TcpRepr, TcpSeqNumber};

use super::{context, Config, FourTuple};

/// The maximum segment size assumed when the peer sends none (rfc1122).
pub const DEFAULT_MSS: u16 = 536;

/// State enum of the statemachine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum State {
    /// No connection, the initial state and the one reached after teardown.
    Closed,

    /// A listening connection.
    ///
    /// Waits for a SYN to arrive for the local port from any remote.
    Listen,

    /// An open connection request.
    SynSent,

    /// Connection request we intend to answer, waiting on ack.
    SynReceived,

    /// An open connection.
    Established,

    /// Other side closed its connection.
    CloseWait,

    /// Connection closed after other side closed its already.
    LastAck,

    /// Closed our side of the connection.
    FinWait1,

    /// Closing connection nicely, initiated by us and acknowledged.
    FinWait2,

    /// Closed both sides but we don't know the other knows.
    Closing,

    /// Both sides recognized connection as closed.
    TimeWait,
}

/// The events driving the state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Event {
    /// Open the connection, passively when the `passive` flag is set.
    CallOpen { passive: bool },
    CallSend,
    CallRecv,
    CallClose,
    /// Tear the connection down immediately.
    CallAbort,
    /// A segment for this connection arrived.
    RcvdPkt(Segment),
    /// The armed connection timer expired.
    TimeTimeout,
    TimeRetransmit,
    TimeUserTimeout,
}

/// A received segment with the addresses of its IPv6 header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Segment {
    pub src_addr: Ipv6Address,
    pub dst_addr: Ipv6Address,
    pub repr: TcpRepr,
    /// The number of payload octets following the header.
    pub payload_len: usize,
}

/// The change to the connection timer requested by a transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Timer {
    Unchanged,
    /// (Re)start the timer to expire after the duration.
    Arm(Duration),
    Stop,
}

/// Output signals of the model.
///
/// Every transition returns them. An empty set of signals means the event was absorbed without
/// any effect on the outside.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Signals {
    /// Need to send some tcp answer.
    pub answer: Option<TcpRepr>,

    /// Register under this demultiplexing context, replacing any previous registration.
    pub register: Option<u32>,

    /// Remove the registration of the connection.
    pub unregister: bool,

    /// Update the connection timer.
    pub timer: Timer,
}

/// The state of a connection.
#[derive(Clone, Copy, Debug)]
pub struct Connection {
    /// The current state of the state machine.
    pub current: State,

    /// The previous state of the state machine.
    ///
    /// Required to correctly reset the state in closing the connection at RST. It is necessary to
    /// track *how* we ended up forming a (half-open) connection.
    pub previous: State,

    pub local_port: u16,
    /// The port of the remote, zero while listening.
    pub remote_port: u16,
    /// Our address, unspecified until the first segment has told us.
    pub local_addr: Ipv6Address,
    pub remote_addr: Ipv6Address,

    /// The maximum segment size announced by the peer.
    pub peer_mss: u16,

    /// The sending state.
    ///
    /// In RFC793 this is referred to as `SND`.
    pub send: Send,

    /// The receiving state.
    ///
    /// In RFC793 this is referred to as `RCV`.
    pub recv: Receive,

    config: Config,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Send {
    /// The next not yet acknowledged sequence number.
    ///
    /// In RFC793 this is referred to as `SND.UNA`.
    pub unacked: TcpSeqNumber,

    /// The next sequence number to use for transmission.
    ///
    /// In RFC793 this is referred to as `SND.NXT`.
    pub next: TcpSeqNumber,

    /// The send window size indicated by the receiver.
    ///
    /// In RFC793 this is referred to as `SND.WND`.
    pub window: u16,

    /// In RFC793 this is referred to as `SND.UP`.
    pub urgent: u16,

    /// Segment sequence number used for the last window update (`SND.WL1`).
    pub last_window_seq: TcpSeqNumber,

    /// Segment acknowledgment number used for the last window update (`SND.WL2`).
    pub last_window_ack: TcpSeqNumber,

    /// The initial sequence number.
    ///
    /// In RFC793 this is referred to as `ISS`.
    pub initial_seq: TcpSeqNumber,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Receive {
    /// The next expected sequence number.
    ///
    /// In RFC793 this is referred to as `RCV.NXT`.
    pub next: TcpSeqNumber,

    /// The receive window size indicated by us.
    ///
    /// In RFC793 this is referred to as `RCV.WND`.
    pub window: u16,

    /// In RFC793 this is referred to as `RCV.UP`.
    pub urgent: u16,

    /// The initial receive sequence number.
    ///
    /// In RFC793 this is referred to as `IRS`.
    pub initial_seq: TcpSeqNumber,
}

/// What the state machine needs to know about its surroundings.
pub trait Env {
    /// Choose the initial sequence number of a new connection.
    fn initial_seq_num(&mut self, tuple: FourTuple) -> TcpSeqNumber;

    /// Check if a demultiplexing context is already handled by another connection.
    fn in_use(&self, ctx: u32) -> bool;
}

/// The sequence number acceptability test of rfc793.
///
/// Checks if a segment starting at `seq` and occupying `len` octets of sequence space overlaps
/// the receive window of `window` octets starting at `next`.
pub fn acceptable(seq: TcpSeqNumber, len: usize, next: TcpSeqNumber, window: u16) -> bool {
    let window = usize::from(window);
    match (len, window) {
        (0, 0) => seq == next,
        (0, _) => next <= seq && seq < next + window,
        (_, 0) => false,
        (_, _) => {
            let last = seq + (len - 1);
            seq < next + window && next <= last
        },
    }
}

impl Connection {
    /// A closed connection using the window and timeouts of the configuration.
    pub fn new(config: Config) -> Self {
        Connection {
            current: State::Closed,
            previous: State::Closed,
            local_port: 0,
            remote_port: 0,
            local_addr: Ipv6Address::UNSPECIFIED,
            remote_addr: Ipv6Address::UNSPECIFIED,
            peer_mss: DEFAULT_MSS,
            send: Send::default(),
            recv: Receive {
                window: config.window,
                ..Receive::default()
            },
            config,
        }
    }

    pub fn four_tuple(&self) -> FourTuple {
        FourTuple {
            local: self.local_addr,
            remote: self.remote_addr,
            local_port: self.local_port,
            remote_port: self.remote_port,
        }
    }

    /// The demultiplexing context of the connection.
    pub fn context(&self) -> u32 {
        context(self.local_port, self.remote_port)
    }

    /// Check if the connection has been synchronized with the remote.
    pub fn is_synchronized(&self) -> bool {
        match self.current {
            State::Closed | State::Listen | State::SynSent | State::SynReceived => false,
            _ => true,
        }
    }

    /// Evaluate one event.
    ///
    /// Only calls of the user may fail, received segments and timers are always absorbed.
    pub fn handle(&mut self, event: Event, env: &mut dyn Env) -> Result<Signals> {
        match event {
            Event::CallOpen { passive } => self.call_open(passive, env),
            Event::CallSend | Event::CallRecv => match self.current {
                State::Established => Ok(Signals::default()),
                _ => Err(Error::NotConnected),
            },
            Event::CallClose => self.call_close(),
            Event::CallAbort => Ok(self.call_abort()),
            Event::RcvdPkt(segment) => Ok(self.arrives(&segment, env)),
            Event::TimeTimeout => Ok(self.timeout()),
            Event::TimeRetransmit | Event::TimeUserTimeout => Ok(Signals::default()),
        }
    }

    fn call_open(&mut self, passive: bool, env: &mut dyn Env) -> Result<Signals> {
        if self.current != State::Closed {
            return Err(Error::InUse);
        }

        let mut signals = Signals::default();
        if passive {
            self.remote_port = 0;
            self.remote_addr = Ipv6Address::UNSPECIFIED;
            signals.register = Some(self.context());
            self.change_state(State::Listen);
            return Ok(signals);
        }

        if self.remote_addr.is_unspecified() {
            return Err(Error::DestinationRequired);
        }

        let isn = env.initial_seq_num(self.four_tuple());
        self.send = Send {
            unacked: isn,
            next: isn + 1,
            initial_seq: isn,
            ..Send::default()
        };

        signals.register = Some(self.context());
        signals.timer = Timer::Arm(self.config.syn_sent_timeout);
        signals.answer = Some(self.control(TcpFlags::SYN, isn));
        self.change_state(State::SynSent);
        Ok(signals)
    }

    fn call_close(&mut self) -> Result<Signals> {
        let next = match self.current {
            State::Established => State::FinWait1,
            State::CloseWait => State::Closing,
            _ => return Err(Error::NotConnected),
        };

        let fin = self.control(TcpFlags::FIN, self.send.next);
        self.send.next += 1;
        self.change_state(next);
        Ok(Signals {
            answer: Some(fin),
            ..Signals::default()
        })
    }

    fn call_abort(&mut self) -> Signals {
        let mut signals = Signals::default();
        match self.current {
            State::Closed => return signals,
            State::SynReceived | State::Established | State::CloseWait
                | State::FinWait1 | State::FinWait2 =>
            {
                signals.answer = Some(self.control(TcpFlags::RST, self.send.next));
            },
            _ => (),
        }
        self.close_signals(&mut signals);
        signals
    }

    fn timeout(&mut self) -> Signals {
        let mut signals = Signals::default();
        match self.current {
            State::SynSent | State::SynReceived => {
                net_debug!("tcp: connection setup on port {} timed out", self.local_port);
                self.close_signals(&mut signals);
            },
            _ => (),
        }
        signals
    }

    /// Handle an arriving segment.
    pub fn arrives(&mut self, segment: &Segment, env: &mut dyn Env) -> Signals {
        match self.current {
            State::Closed => self.arrives_closed(segment),
            State::Listen => self.arrives_listen(segment, env),
            State::SynSent => self.arrives_syn_sent(segment),
            State::SynReceived => self.arrives_syn_received(segment),
            _ => self.arrives_synchronized(segment),
        }
    }

    /// Answers packets on closed sockets with resets.
    ///
    /// Except when an RST flag is already set on the received packet.
    fn arrives_closed(&mut self, segment: &Segment) -> Signals {
        let mut signals = Signals::default();
        if !segment.repr.flags.rst() {
            signals.answer = Some(Self::reset_for(segment));
        }
        signals
    }

    fn arrives_listen(&mut self, segment: &Segment, env: &mut dyn Env) -> Signals {
        let mut signals = Signals::default();
        let repr = &segment.repr;
        if repr.flags.rst() {
            return signals;
        }

        if repr.ack_number.is_some() { // What are you acking? A previous connection.
            signals.answer = Some(Self::reset_for(segment));
            return signals;
        }

        if !repr.flags.syn() {
            // Doesn't have any useful flags. Why was this even sent?
            return signals;
        }

        let ctx = context(self.local_port, repr.src_port);
        if env.in_use(ctx) {
            net_debug!("tcp: connection from port {} already handled", repr.src_port);
            return signals;
        }

        self.remote_port = repr.src_port;
        self.remote_addr = segment.src_addr;
        self.local_addr = segment.dst_addr;
        self.peer_mss = repr.max_seg_size.unwrap_or(DEFAULT_MSS);

        self.recv.next = repr.seq_number + 1;
        self.recv.initial_seq = repr.seq_number;

        let isn = env.initial_seq_num(self.four_tuple());
        self.send = Send {
            unacked: isn,
            next: isn + 1,
            window: repr.window_len,
            last_window_seq: repr.seq_number,
            initial_seq: isn,
            ..Send::default()
        };

        signals.register = Some(ctx);
        signals.timer = Timer::Arm(self.config.syn_rcvd_timeout);
        signals.answer = Some(self.control(TcpFlags::SYN, isn));
        self.change_state(State::SynReceived);
        signals
    }

    fn arrives_syn_sent(&mut self, segment: &Segment) -> Signals {
        let mut signals = Signals::default();
        let repr = &segment.repr;

        if let Some(ack) = repr.ack_number {
            if ack < self.send.unacked || self.send.next < ack {
                if !repr.flags.rst() {
                    signals.answer = Some(Self::reset_for(segment));
                }
                return signals;
            }
        }

        if repr.flags.rst() {
            // A reset without an acknowledgment may be forged, only an acceptable one counts.
            if repr.ack_number.is_some() {
                net_debug!("tcp: connection to port {} refused", self.remote_port);
                self.close_signals(&mut signals);
            }
            return signals;
        }

        let ack = match (repr.flags.syn(), repr.ack_number) {
            (true, Some(ack)) => ack,
            _ => return signals,
        };

        self.recv.initial_seq = repr.seq_number;
        self.recv.next = repr.seq_number + 1;
        self.local_addr = segment.dst_addr;
        self.peer_mss = repr.max_seg_size.unwrap_or(DEFAULT_MSS);
        self.send.unacked = ack;
        self.set_window(repr, ack);

        if self.send.initial_seq < self.send.unacked {
            signals.timer = Timer::Stop;
            signals.answer = Some(self.ack_answer());
            self.change_state(State::Established);
        }
        signals
    }

    fn arrives_syn_received(&mut self, segment: &Segment) -> Signals {
        let mut signals = Signals::default();
        let repr = &segment.repr;
        if !self.accepts(segment, &mut signals) {
            return signals;
        }

        if repr.flags.rst() {
            if self.previous == State::Listen {
                net_trace!("tcp: half-open connection reset, listening again");
                self.remote_port = 0;
                self.remote_addr = Ipv6Address::UNSPECIFIED;
                signals.register = Some(self.context());
                signals.timer = Timer::Stop;
                self.change_state(State::Listen);
            } else {
                self.close_signals(&mut signals);
            }
            return signals;
        }

        if repr.flags.syn() {
            signals.answer = Some(Self::reset_for(segment));
            self.close_signals(&mut signals);
            return signals;
        }

        let ack = match repr.ack_number {
            Some(ack) => ack,
            None => return signals,
        };

        if ack < self.send.unacked || self.send.next < ack {
            signals.answer = Some(Self::reset_for(segment));
            return signals;
        }

        self.send.unacked = ack;
        self.set_window(repr, ack);
        signals.timer = Timer::Stop;

        if repr.flags.fin() && repr.seq_number == self.recv.next && segment.payload_len == 0 {
            self.recv.next += 1;
            signals.answer = Some(self.ack_answer());
            self.change_state(State::CloseWait);
        } else {
            self.change_state(State::Established);
        }
        signals
    }

    /// Handle a segment in one of the synchronized states.
    fn arrives_synchronized(&mut self, segment: &Segment) -> Signals {
        let mut signals = Signals::default();
        let repr = &segment.repr;
        if !self.accepts(segment, &mut signals) {
            return signals;
        }

        if repr.flags.rst() {
            net_debug!("tcp: connection on port {} reset by peer", self.local_port);
            self.close_signals(&mut signals);
            return signals;
        }

        if repr.flags.syn() {
            signals.answer = Some(Self::reset_for(segment));
            self.close_signals(&mut signals);
            return signals;
        }

        let ack = match repr.ack_number {
            Some(ack) => ack,
            None => return signals,
        };

        if self.send.next < ack {
            // Acknowledges something we never sent.
            signals.answer = Some(self.ack_answer());
            return signals;
        }

        if self.send.unacked < ack {
            self.send.unacked = ack;
        }
        if self.send.unacked <= ack {
            self.update_window(repr, ack);
        }

        let fin_acked = self.send.unacked == self.send.next;
        let fin = repr.flags.fin()
            && repr.seq_number == self.recv.next
            && segment.payload_len == 0;
        if fin {
            self.recv.next += 1;
        }

        match self.current {
            State::Established if fin => self.change_state(State::CloseWait),
            State::FinWait1 => match (fin, fin_acked) {
                (true, true) => self.change_state(State::TimeWait),
                (true, false) => self.change_state(State::Closing),
                (false, true) => self.change_state(State::FinWait2),
                (false, false) => (),
            },
            State::FinWait2 if fin => self.change_state(State::TimeWait),
            State::Closing if fin_acked => self.change_state(State::TimeWait),
            State::LastAck if fin_acked => {
                self.close_signals(&mut signals);
                return signals;
            },
            _ => (),
        }

        // Every FIN, including retransmitted ones, is acknowledged.
        if repr.flags.fin() {
            signals.answer = Some(self.ack_answer());
        }
        signals
    }

    /// Check the acceptability of a segment in the window.
    ///
    /// Unacceptable segments are answered with a bare ACK unless they carry RST.
    fn accepts(&self, segment: &Segment, signals: &mut Signals) -> bool {
        let repr = &segment.repr;
        let len = segment.payload_len + repr.sequence_len();
        if acceptable(repr.seq_number, len, self.recv.next, self.recv.window) {
            return true;
        }

        net_trace!("tcp: unacceptable segment seq={} len={}", repr.seq_number, len);
        if !repr.flags.rst() {
            signals.answer = Some(self.ack_answer());
        }
        false
    }

    /// Take over the send window from a segment, if it is newer than the last update.
    fn update_window(&mut self, repr: &TcpRepr, ack: TcpSeqNumber) {
        let newer = self.send.last_window_seq < repr.seq_number
            || (self.send.last_window_seq == repr.seq_number && self.send.last_window_ack <= ack);
        if newer {
            self.set_window(repr, ack);
        }
    }

    fn set_window(&mut self, repr: &TcpRepr, ack: TcpSeqNumber) {
        self.send.window = repr.window_len;
        self.send.last_window_seq = repr.seq_number;
        self.send.last_window_ack = ack;
    }

    /// Close the connection and unregister it.
    fn close_signals(&mut self, signals: &mut Signals) {
        signals.unregister = true;
        signals.register = None;
        signals.timer = Timer::Stop;
        self.change_state(State::Closed);
    }

    fn change_state(&mut self, new: State) {
        net_trace!("tcp: port {} {:?} -> {:?}", self.local_port, self.current, new);
        self.previous = self.current;
        self.current = new;
    }

    /// A segment of this connection carrying only control flags.
    ///
    /// Acknowledges everything received unless it resets, and announces our segment size with SYN.
    fn control(&self, flags: TcpFlags, seq_number: TcpSeqNumber) -> TcpRepr {
        let (flags, ack_number) = if flags.rst() {
            (flags, None)
        } else if flags.syn() && self.current == State::Closed {
            (flags, None)
        } else {
            (flags | TcpFlags::ACK, Some(self.recv.next))
        };

        TcpRepr {
            src_port: self.local_port,
            dst_port: self.remote_port,
            flags,
            seq_number,
            ack_number,
            window_len: self.recv.window,
            max_seg_size: if flags.syn() { Some(self.config.mss) } else { None },
        }
    }

    fn ack_answer(&self) -> TcpRepr {
        self.control(TcpFlags::default(), self.send.next)
    }

    /// The reset answering a segment, as in rfc793 'Reset Generation'.
    fn reset_for(segment: &Segment) -> TcpRepr {
        let repr = &segment.repr;
        let (flags, seq_number, ack_number) = match repr.ack_number {
            Some(ack) => (TcpFlags::RST, ack, None),
            None => {
                let len = segment.payload_len + repr.sequence_len();
                (TcpFlags::RST | TcpFlags::ACK, TcpSeqNumber(0), Some(repr.seq_number + len))
            },
        };

        TcpRepr {
            src_port: repr.dst_port,
            dst_port: repr.src_port,
            flags,
            seq_number,
            ack_number,
            window_len: 0,
            max_seg_size: None,
        }
    }
}

impl Default for State {
    fn default() -> Self {
        State::Closed
    }
}

impl Default for Timer {
    fn default() -> Self {
        Timer::Unchanged
    }
}
