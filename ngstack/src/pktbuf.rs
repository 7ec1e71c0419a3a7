//! The shared packet buffer.
//!
//! Packets are chains of snips, outermost header first. Every snip is a typed byte range with a
//! reference count (`users`) and is addressed by a [`Snip`] handle. Handles carry the generation
//! of their slot so a handle to a freed snip never resolves to a newer one that reused the slot.
//!
//! The buffer does not know about ownership beyond the counts. Everyone who receives a handle
//! holds exactly one reference to every snip of the chain behind it and gives it back with
//! [`release`]. Before mutating a packet that may be shared, take a private version with
//! [`start_write`].
//!
//! [`Snip`]: struct.Snip.html
//! [`release`]: struct.Pktbuf.html#method.release
//! [`start_write`]: struct.Pktbuf.html#method.start_write
use core::fmt;
use spin::Mutex;

use crate::netreg::NetType;

/// A handle to a snip in the packet buffer.
///
/// The handle remains valid until the snip is freed. Accessing the buffer with the handle after
/// that fails, even if the slot has been reused for another snip.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Snip {
    idx: u32,
    generation: u32,
}

/// The packet arena shared by all layers of a stack.
pub struct Pktbuf {
    inner: Mutex<Arena>,
}

struct Arena {
    slots: Vec<Slot>,
    free: Vec<u32>,
    /// Maximum number of payload octets, if bounded.
    capacity: Option<usize>,
    used: usize,
}

struct Slot {
    generation: u32,
    entry: Option<Entry>,
}

struct Entry {
    ty: NetType,
    data: Vec<u8>,
    next: Option<Snip>,
    users: u32,
}

impl Pktbuf {
    /// Create a buffer that grows as needed.
    pub fn new() -> Self {
        Pktbuf {
            inner: Mutex::new(Arena {
                slots: Vec::new(),
                free: Vec::new(),
                capacity: None,
                used: 0,
            }),
        }
    }

    /// Create a buffer that can hold at most `bytes` octets of snip data at any time.
    pub fn with_capacity(bytes: usize) -> Self {
        let buffer = Pktbuf::new();
        buffer.inner.lock().capacity = Some(bytes);
        buffer
    }

    /// Prepend a new snip containing a copy of `data` to the chain `next`.
    ///
    /// The new snip is held once. Returns `None` if the buffer is exhausted.
    pub fn add(&self, next: Option<Snip>, data: &[u8], ty: NetType) -> Option<Snip> {
        self.inner.lock().insert(next, data.to_vec(), ty)
    }

    /// Prepend a new zeroed snip of `size` octets to the chain `next`.
    pub fn alloc(&self, next: Option<Snip>, size: usize, ty: NetType) -> Option<Snip> {
        self.inner.lock().insert(next, vec![0; size], ty)
    }

    /// Add `n` references to every snip of the chain.
    pub fn hold(&self, pkt: Snip, n: usize) {
        let mut arena = self.inner.lock();
        let mut cursor = Some(pkt);
        while let Some(snip) = cursor {
            match arena.get_mut(snip) {
                Some(entry) => {
                    entry.users += n as u32;
                    cursor = entry.next;
                },
                None => break,
            }
        }
    }

    /// Give back one reference to every snip of the chain, freeing those that reach zero.
    pub fn release(&self, pkt: Snip) {
        self.inner.lock().release_chain(Some(pkt))
    }

    /// Ensure exclusive access to a packet before writing to it.
    ///
    /// Returns `pkt` itself if every snip of the chain has a single user. Otherwise the chain is
    /// copied, the reference on the original is given back and the private copy is returned. On
    /// exhaustion `None` is returned and the reference on `pkt` is kept.
    pub fn start_write(&self, pkt: Snip) -> Option<Snip> {
        let mut arena = self.inner.lock();
        let chain = arena.chain(pkt);
        if chain.is_empty() {
            return None;
        }

        let shared = chain.iter()
            .filter_map(|&snip| arena.get(snip))
            .any(|entry| entry.users > 1);
        if !shared {
            return Some(pkt);
        }

        let copies: Vec<(NetType, Vec<u8>)> = chain.iter()
            .filter_map(|&snip| arena.get(snip))
            .map(|entry| (entry.ty, entry.data.clone()))
            .collect();
        let total: usize = copies.iter().map(|(_, data)| data.len()).sum();
        if !arena.fits(total) {
            net_debug!("pktbuf: no space to copy {} octets for writing", total);
            return None;
        }

        let mut next = None;
        for (ty, data) in copies.into_iter().rev() {
            next = arena.insert(next, data, ty);
        }
        arena.release_chain(Some(pkt));
        next
    }

    /// Split the leading `size` octets of `snip` off as their own snip of type `ty`.
    ///
    /// `snip` keeps the marked octets and the new type, the remaining octets move into a new snip
    /// of undefined type that is linked directly after it. Returns the handle of that remainder.
    pub fn mark(&self, snip: Snip, size: usize, ty: NetType) -> Option<Snip> {
        let mut arena = self.inner.lock();
        let (rest, users, next) = {
            let entry = arena.get_mut(snip)?;
            if entry.data.len() < size {
                return None;
            }
            let rest = entry.data.split_off(size);
            entry.ty = ty;
            (rest, entry.users, entry.next)
        };

        let idx = arena.vacant();
        let generation = arena.slots[idx as usize].generation;
        arena.slots[idx as usize].entry = Some(Entry {
            ty: NetType::Undef,
            data: rest,
            next,
            users,
        });
        let marked = Snip { idx, generation };
        arena.get_mut(snip)?.next = Some(marked);
        Some(marked)
    }

    /// Collapse the chain into its head snip.
    ///
    /// The head keeps its type. Every other snip gives back the reference of this chain. Fails
    /// without changes when the tail is shared and its copy does not fit the buffer.
    pub fn merge(&self, pkt: Snip) -> bool {
        let mut arena = self.inner.lock();
        let tail = match arena.get(pkt) {
            Some(entry) => entry.next,
            None => return false,
        };

        let mut data = Vec::new();
        // Octets given back by tail snips this chain holds the last reference to.
        let mut freed = 0;
        if let Some(tail) = tail {
            for snip in arena.chain(tail) {
                if let Some(entry) = arena.get(snip) {
                    data.extend_from_slice(&entry.data);
                    if entry.users == 1 {
                        freed += entry.data.len();
                    }
                }
            }
        }

        if !arena.fits(data.len() - freed) {
            net_debug!("pktbuf: exhausted merging {} octets", data.len());
            return false;
        }

        arena.release_chain(tail);
        arena.used += data.len();
        match arena.get_mut(pkt) {
            Some(head) => {
                head.data.extend_from_slice(&data);
                head.next = None;
                true
            },
            None => false,
        }
    }

    /// Find the first snip of type `ty` in the chain.
    pub fn search_type(&self, pkt: Snip, ty: NetType) -> Option<Snip> {
        let arena = self.inner.lock();
        arena.chain(pkt).into_iter()
            .find(|&snip| arena.get(snip).map(|entry| entry.ty) == Some(ty))
    }

    /// The number of octets in the chain starting at `pkt`.
    pub fn size(&self, pkt: Snip) -> usize {
        let arena = self.inner.lock();
        arena.chain(pkt).into_iter()
            .filter_map(|snip| arena.get(snip))
            .map(|entry| entry.data.len())
            .sum()
    }

    /// The number of octets of the single snip.
    pub fn len(&self, snip: Snip) -> usize {
        self.inner.lock().get(snip).map_or(0, |entry| entry.data.len())
    }

    pub fn next(&self, snip: Snip) -> Option<Snip> {
        self.inner.lock().get(snip)?.next
    }

    pub fn ty(&self, snip: Snip) -> Option<NetType> {
        self.inner.lock().get(snip).map(|entry| entry.ty)
    }

    pub fn set_type(&self, snip: Snip, ty: NetType) {
        if let Some(entry) = self.inner.lock().get_mut(snip) {
            entry.ty = ty;
        }
    }

    pub fn users(&self, snip: Snip) -> u32 {
        self.inner.lock().get(snip).map_or(0, |entry| entry.users)
    }

    /// Check if the handle still refers to a live snip.
    pub fn contains(&self, snip: Snip) -> bool {
        self.inner.lock().get(snip).is_some()
    }

    /// The number of octets held by live snips.
    pub fn used(&self) -> usize {
        self.inner.lock().used
    }

    /// The number of live snips.
    pub fn live(&self) -> usize {
        self.inner.lock().slots.iter()
            .filter(|slot| slot.entry.is_some())
            .count()
    }

    /// Inspect the octets of a snip.
    ///
    /// The buffer is locked while `f` runs, it must not access the buffer again.
    pub fn read<R>(&self, snip: Snip, f: impl FnOnce(&[u8]) -> R) -> Option<R> {
        let arena = self.inner.lock();
        arena.get(snip).map(|entry| f(&entry.data))
    }

    /// Modify the octets of a snip.
    ///
    /// The buffer is locked while `f` runs, it must not access the buffer again.
    pub fn write<R>(&self, snip: Snip, f: impl FnOnce(&mut [u8]) -> R) -> Option<R> {
        let mut arena = self.inner.lock();
        arena.get_mut(snip).map(|entry| f(&mut entry.data))
    }

    /// Copy the octets of the chain starting at `pkt`.
    pub fn to_vec(&self, pkt: Snip) -> Vec<u8> {
        let arena = self.inner.lock();
        let mut data = Vec::new();
        for snip in arena.chain(pkt) {
            if let Some(entry) = arena.get(snip) {
                data.extend_from_slice(&entry.data);
            }
        }
        data
    }

    /// Shorten a single snip to `len` octets.
    pub fn trim(&self, snip: Snip, len: usize) {
        let mut arena = self.inner.lock();
        let freed = match arena.get_mut(snip) {
            Some(entry) if entry.data.len() > len => {
                let freed = entry.data.len() - len;
                entry.data.truncate(len);
                freed
            },
            _ => return,
        };
        arena.used -= freed;
    }

    /// Drop the head of the chain, returning the rest.
    ///
    /// Only the head gives back a reference, the returned chain keeps the one of the caller.
    pub fn remove_head(&self, pkt: Snip) -> Option<Snip> {
        let mut arena = self.inner.lock();
        let entry = arena.get_mut(pkt)?;
        let next = entry.next.take();
        entry.users -= 1;
        if entry.users == 0 {
            arena.remove(pkt);
        }
        next
    }
}

impl Default for Pktbuf {
    fn default() -> Self {
        Pktbuf::new()
    }
}

impl fmt::Debug for Pktbuf {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let arena = self.inner.lock();
        f.debug_struct("Pktbuf")
            .field("snips", &arena.slots.iter().filter(|slot| slot.entry.is_some()).count())
            .field("used", &arena.used)
            .field("capacity", &arena.capacity)
            .finish()
    }
}

impl Arena {
    fn get(&self, snip: Snip) -> Option<&Entry> {
        let slot = self.slots.get(snip.idx as usize)?;
        if slot.generation != snip.generation {
            return None;
        }
        slot.entry.as_ref()
    }

    fn get_mut(&mut self, snip: Snip) -> Option<&mut Entry> {
        let slot = self.slots.get_mut(snip.idx as usize)?;
        if slot.generation != snip.generation {
            return None;
        }
        slot.entry.as_mut()
    }

    fn fits(&self, size: usize) -> bool {
        match self.capacity {
            Some(capacity) => self.used + size <= capacity,
            None => true,
        }
    }

    /// Find an empty slot, the data accounting is up to the caller.
    fn vacant(&mut self) -> u32 {
        match self.free.pop() {
            Some(idx) => idx,
            None => {
                self.slots.push(Slot { generation: 0, entry: None });
                (self.slots.len() - 1) as u32
            },
        }
    }

    fn insert(&mut self, next: Option<Snip>, data: Vec<u8>, ty: NetType) -> Option<Snip> {
        if !self.fits(data.len()) {
            net_debug!("pktbuf: exhausted allocating {} octets", data.len());
            return None;
        }

        self.used += data.len();
        let idx = self.vacant();
        let slot = &mut self.slots[idx as usize];
        slot.entry = Some(Entry { ty, data, next, users: 1 });
        Some(Snip { idx, generation: slot.generation })
    }

    fn remove(&mut self, snip: Snip) {
        let slot = &mut self.slots[snip.idx as usize];
        if let Some(entry) = slot.entry.take() {
            self.used -= entry.data.len();
        }
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(snip.idx);
    }

    fn release_chain(&mut self, pkt: Option<Snip>) {
        let mut cursor = pkt;
        while let Some(snip) = cursor {
            let entry = match self.get_mut(snip) {
                Some(entry) => entry,
                None => break,
            };
            cursor = entry.next;
            entry.users -= 1;
            if entry.users == 0 {
                self.remove(snip);
            }
        }
    }

    fn chain(&self, pkt: Snip) -> Vec<Snip> {
        let mut chain = Vec::new();
        let mut cursor = Some(pkt);
        while let Some(snip) = cursor {
            match self.get(snip) {
                Some(entry) => {
                    chain.push(snip);
                    cursor = entry.next;
                },
                None => break,
            }
        }
        chain
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn two_snips(buffer: &Pktbuf) -> Snip {
        let payload = buffer.add(None, b"payload", NetType::Undef).unwrap();
        buffer.add(Some(payload), &[0xaa; 4], NetType::Tcp).unwrap()
    }

    #[test]
    fn hold_and_release() {
        let buffer = Pktbuf::new();
        let pkt = two_snips(&buffer);
        assert_eq!(buffer.live(), 2);
        assert_eq!(buffer.size(pkt), 11);

        buffer.hold(pkt, 2);
        assert_eq!(buffer.users(pkt), 3);
        buffer.release(pkt);
        buffer.release(pkt);
        assert_eq!(buffer.live(), 2);
        buffer.release(pkt);
        assert_eq!(buffer.live(), 0);
        assert!(!buffer.contains(pkt));
    }

    #[test]
    fn stale_handle() {
        let buffer = Pktbuf::new();
        let old = buffer.add(None, &[1], NetType::Undef).unwrap();
        buffer.release(old);
        let new = buffer.add(None, &[2], NetType::Undef).unwrap();
        assert_ne!(old, new);
        assert_eq!(buffer.read(old, |data| data.to_vec()), None);
        assert_eq!(buffer.read(new, |data| data.to_vec()), Some(vec![2]));
    }

    #[test]
    fn start_write_exclusive() {
        let buffer = Pktbuf::new();
        let pkt = two_snips(&buffer);
        assert_eq!(buffer.start_write(pkt), Some(pkt));
        assert_eq!(buffer.live(), 2);
    }

    #[test]
    fn start_write_shared() {
        let buffer = Pktbuf::new();
        let pkt = two_snips(&buffer);
        buffer.hold(pkt, 1);

        let copy = buffer.start_write(pkt).unwrap();
        assert_ne!(copy, pkt);
        assert_eq!(buffer.users(pkt), 1);
        assert_eq!(buffer.users(copy), 1);
        assert_eq!(buffer.to_vec(copy), buffer.to_vec(pkt));
        assert_eq!(buffer.ty(copy), Some(NetType::Tcp));

        buffer.write(copy, |data| data[0] = 0).unwrap();
        assert_eq!(buffer.read(pkt, |data| data[0]), Some(0xaa));

        buffer.release(pkt);
        buffer.release(copy);
        assert_eq!(buffer.live(), 0);
    }

    #[test]
    fn mark_header() {
        let buffer = Pktbuf::new();
        let pkt = buffer.add(None, &[1, 2, 3, 4, 5, 6], NetType::Undef).unwrap();
        let rest = buffer.mark(pkt, 2, NetType::Ipv6).unwrap();
        assert_eq!(buffer.next(pkt), Some(rest));
        assert_eq!(buffer.ty(pkt), Some(NetType::Ipv6));
        assert_eq!(buffer.ty(rest), Some(NetType::Undef));
        assert_eq!(buffer.read(pkt, |data| data.to_vec()), Some(vec![1, 2]));
        assert_eq!(buffer.read(rest, |data| data.to_vec()), Some(vec![3, 4, 5, 6]));
        assert_eq!(buffer.mark(rest, 5, NetType::Tcp), None);

        buffer.release(pkt);
        assert_eq!(buffer.live(), 0);
    }

    #[test]
    fn merge_chain() {
        let buffer = Pktbuf::new();
        let pkt = two_snips(&buffer);
        assert!(buffer.merge(pkt));
        assert_eq!(buffer.live(), 1);
        assert_eq!(buffer.next(pkt), None);
        assert_eq!(buffer.len(pkt), 11);
        assert_eq!(buffer.ty(pkt), Some(NetType::Tcp));
        assert_eq!(buffer.used(), 11);
        buffer.release(pkt);
        assert_eq!(buffer.live(), 0);
        assert_eq!(buffer.used(), 0);
    }

    #[test]
    fn merge_shared_tail() {
        let buffer = Pktbuf::with_capacity(20);
        let pkt = two_snips(&buffer);
        let payload = buffer.next(pkt).unwrap();
        buffer.hold(payload, 1);

        // The payload stays alive for the other holder, the head grows by a copy.
        assert!(buffer.merge(pkt));
        assert_eq!(buffer.used(), 18);
        assert_eq!(buffer.len(pkt), 11);
        assert_eq!(buffer.users(payload), 1);
        buffer.release(payload);
        assert_eq!(buffer.used(), 11);
        buffer.release(pkt);
        assert_eq!(buffer.used(), 0);

        // A copy that would exceed the capacity leaves the chain untouched.
        let pkt = two_snips(&buffer);
        let payload = buffer.next(pkt).unwrap();
        buffer.hold(payload, 1);
        buffer.alloc(None, 4, NetType::Undef).unwrap();
        assert!(!buffer.merge(pkt));
        assert_eq!(buffer.next(pkt), Some(payload));
        assert_eq!(buffer.users(payload), 2);
        assert_eq!(buffer.used(), 15);
    }

    #[test]
    fn remove_head_keeps_rest() {
        let buffer = Pktbuf::new();
        let pkt = two_snips(&buffer);
        let rest = buffer.remove_head(pkt).unwrap();
        assert!(!buffer.contains(pkt));
        assert_eq!(buffer.to_vec(rest), b"payload".to_vec());
        assert_eq!(buffer.search_type(rest, NetType::Tcp), None);
        buffer.release(rest);
        assert_eq!(buffer.live(), 0);
    }

    #[test]
    fn bounded_capacity() {
        let buffer = Pktbuf::with_capacity(8);
        let first = buffer.alloc(None, 6, NetType::Undef).unwrap();
        assert_eq!(buffer.alloc(None, 4, NetType::Undef), None);
        buffer.hold(first, 1);
        // A private copy does not fit either.
        assert_eq!(buffer.start_write(first), None);
        assert_eq!(buffer.users(first), 2);
        buffer.trim(first, 2);
        assert!(buffer.alloc(None, 4, NetType::Undef).is_some());
    }
}
