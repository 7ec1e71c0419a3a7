//! Threads and their mailboxes.
//!
//! Each thread of the stack is addressed by a [`Pid`] and receives [`Msg`]s through its
//! [`Mailbox`]. The [`Threads`] table maps pids to the sending side of the mailboxes, so that
//! layers only need to know a pid from the registry to deliver a packet.
//!
//! [`Pid`]: struct.Pid.html
//! [`Msg`]: enum.Msg.html
//! [`Mailbox`]: struct.Mailbox.html
//! [`Threads`]: struct.Threads.html
use core::fmt;
use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread;
use std::time::Duration;

use spin::Mutex;

use crate::pktbuf::Snip;

/// The identifier of a thread with a mailbox.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pid(pub u32);

/// A message between threads of the stack.
///
/// Packet messages transfer one reference on the packet to the receiver.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Msg {
    /// A packet travelling up the stack.
    Rcv(Snip),
    /// A packet travelling down the stack.
    Snd(Snip),
    /// Stop the current blocking operation.
    Abort,
}

/// The table of all mailboxes of a stack.
#[derive(Clone, Default)]
pub struct Threads {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    next_pid: AtomicU32,
    senders: Mutex<HashMap<Pid, Sender<Msg>>>,
}

/// The receiving end of a thread's messages.
///
/// Dropping the mailbox removes its pid from the table.
pub struct Mailbox {
    pid: Pid,
    rx: Receiver<Msg>,
    inner: Weak<Inner>,
}

impl Threads {
    pub fn new() -> Self {
        Threads::default()
    }

    /// Create a new mailbox with a fresh pid.
    pub fn mailbox(&self) -> Mailbox {
        // Pid 0 is never handed out.
        let pid = Pid(self.inner.next_pid.fetch_add(1, Ordering::Relaxed) + 1);
        let (tx, rx) = mpsc::channel();
        self.inner.senders.lock().insert(pid, tx);
        Mailbox {
            pid,
            rx,
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Post a message to a thread.
    ///
    /// The message is given back if the thread does not exist (anymore). Sending happens under
    /// the table lock, once [`Mailbox::close`] returned no message reaches the mailbox.
    ///
    /// [`Mailbox::close`]: struct.Mailbox.html#method.close
    pub fn send(&self, pid: Pid, msg: Msg) -> Result<(), Msg> {
        match self.inner.senders.lock().get(&pid) {
            Some(sender) => sender.send(msg).map_err(|err| err.0),
            None => Err(msg),
        }
    }

    /// Check if the thread has a mailbox.
    pub fn exists(&self, pid: Pid) -> bool {
        self.inner.senders.lock().contains_key(&pid)
    }

    /// Start a named thread running `f` with its own mailbox.
    ///
    /// The pid is known before the thread runs, so messages sent right after spawning are not
    /// lost.
    pub fn spawn<F>(&self, name: &str, stack_size: usize, f: F) -> io::Result<Pid>
        where F: FnOnce(Mailbox) + Send + 'static
    {
        let mailbox = self.mailbox();
        let pid = mailbox.pid();
        thread::Builder::new()
            .name(name.into())
            .stack_size(stack_size)
            .spawn(move || f(mailbox))?;
        Ok(pid)
    }
}

impl Mailbox {
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Wait for the next message, at most for `timeout` if given.
    pub fn recv(&self, timeout: Option<Duration>) -> Result<Msg, RecvTimeoutError> {
        match timeout {
            Some(timeout) => self.rx.recv_timeout(timeout),
            None => self.rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
        }
    }

    /// Take a message if one is already waiting.
    pub fn try_recv(&self) -> Option<Msg> {
        self.rx.try_recv().ok()
    }

    /// Remove the pid from the table, later sends fail.
    ///
    /// Messages already queued can still be taken with `try_recv`.
    pub fn close(&self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.senders.lock().remove(&self.pid);
        }
    }
}

impl Drop for Mailbox {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Mailbox {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Mailbox")
            .field("pid", &self.pid)
            .finish()
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "pid {}", self.0)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::mpsc::channel;

    #[test]
    fn deliver_to_mailbox() {
        let threads = Threads::new();
        let mailbox = threads.mailbox();
        assert!(threads.send(mailbox.pid(), Msg::Abort).is_ok());
        assert_eq!(mailbox.recv(Some(Duration::from_millis(10))), Ok(Msg::Abort));
        assert_eq!(mailbox.recv(Some(Duration::from_millis(10))),
            Err(RecvTimeoutError::Timeout));
    }

    #[test]
    fn dropped_mailbox_is_gone() {
        let threads = Threads::new();
        let mailbox = threads.mailbox();
        let pid = mailbox.pid();
        drop(mailbox);
        assert!(!threads.exists(pid));
        assert_eq!(threads.send(pid, Msg::Abort), Err(Msg::Abort));
    }

    #[test]
    fn closed_mailbox_keeps_queue() {
        let threads = Threads::new();
        let mailbox = threads.mailbox();
        threads.send(mailbox.pid(), Msg::Abort).unwrap();
        mailbox.close();
        assert_eq!(threads.send(mailbox.pid(), Msg::Abort), Err(Msg::Abort));
        assert_eq!(mailbox.try_recv(), Some(Msg::Abort));
        assert_eq!(mailbox.try_recv(), None);
    }

    #[test]
    fn spawned_thread_answers() {
        let threads = Threads::new();
        let (tx, rx) = channel();
        let pid = threads.spawn("echo", 64 * 1024, move |mailbox| {
            let msg = mailbox.recv(None);
            let _ = tx.send(msg);
        }).unwrap();
        threads.send(pid, Msg::Abort).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), Ok(Msg::Abort));
    }
}
