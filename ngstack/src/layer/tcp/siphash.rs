//! Initial sequence number generation, as recommended by rfc6528.
//!
//! Uses a keyed cryptographic hash function (SipHash-2-4) instead of appending the secret key to
//! the four tuple for hashing. That should be better anyways. Hash function SipHash-2-4 from:
//!
//! > SipHash: a fast short-input PRFJean-Philippe Aumasson1and Daniel J. Bernstein
//!
//! The same keyed function draws the ephemeral ports of active opens.
use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hasher};
use std::time::Duration;

use super::FourTuple;
use crate::wire::{Ipv6Address, TcpSeqNumber};

pub struct IsnGenerator {
    keys: (u64, u64),
}

// Yes, that's the initial values.
const IV: [&[u8; 8]; 4] = [
    b"somepseu",
    b"dorandom",
    b"lygenera",
    b"tedbytes"];

struct State {
    v0: u64,
    v1: u64,
    v2: u64,
    v3: u64,
}

impl IsnGenerator {
    pub fn new(k0: u64, k1: u64) -> Self {
        IsnGenerator { keys: (k0, k1) }
    }

    /// A generator with a secret key drawn from the randomly seeded std hasher.
    pub fn from_entropy() -> Self {
        let random = RandomState::new();
        let mut k0 = random.build_hasher();
        k0.write_u8(0);
        let mut k1 = random.build_hasher();
        k1.write_u8(1);
        IsnGenerator::new(k0.finish(), k1.finish())
    }

    /// Get the initial sequence number for a connection.
    ///
    /// `time` is the time since an arbitrary, fixed epoch. The value advances every 4µs as
    /// required for the clock component and varies when the underlying secret key is updated.
    pub fn get_isn(&self, connection: FourTuple, time: Duration) -> TcpSeqNumber {
        let mut state = State::init(self.keys.0, self.keys.1);

        let (m0, m1) = Self::ipv6_to_messages(connection.local);
        let (m2, m3) = Self::ipv6_to_messages(connection.remote);
        let p = u64::from(connection.local_port)
            | u64::from(connection.remote_port) << 16
            // Message length = 36
            | 36_u64 << 56;
        state.absorb(m0);
        state.absorb(m1);
        state.absorb(m2);
        state.absorb(m3);
        state.absorb(p);
        let num = state.finalize();

        let clock = (time.as_micros() / 4) as u32;
        TcpSeqNumber((num as u32).wrapping_add(clock) as i32)
    }

    /// Draw a pseudo random number for the nonce.
    pub fn pseudo_random(&self, nonce: u64) -> u64 {
        let mut state = State::init(self.keys.0, self.keys.1);
        state.absorb(nonce);
        // Message length = 8
        state.absorb(8_u64 << 56);
        state.finalize()
    }

    fn ipv6_to_messages(addr: Ipv6Address) -> (u64, u64) {
        let Ipv6Address([a, b, c, d, e, f, g, h, i, j, k, l, m, n, o, p]) = addr;
        let m0 = u64::from_be_bytes([a, b, c, d, e, f, g, h]);
        let m1 = u64::from_be_bytes([i, j, k, l, m, n, o, p]);
        (m0, m1)
    }
}

impl State {
    const SIP_C: usize = 2;
    const SIP_D: usize = 4;

    fn init(k0: u64, k1: u64) -> Self {
        State {
            v0: u64::from_be_bytes(*IV[0]) ^ k0,
            v1: u64::from_be_bytes(*IV[1]) ^ k1,
            v2: u64::from_be_bytes(*IV[2]) ^ k0,
            v3: u64::from_be_bytes(*IV[3]) ^ k1,
        }
    }

    fn round(&mut self) {
        self.v0 = self.v0.wrapping_add(self.v1);
        self.v1 = self.v1.rotate_left(13);
        self.v1 ^= self.v0;
        self.v0 = self.v0.rotate_left(32);
        self.v2 = self.v2.wrapping_add(self.v3);
        self.v3 = self.v3.rotate_left(16);
        self.v3 ^= self.v2;
        self.v0 = self.v0.wrapping_add(self.v3);
        self.v3 = self.v3.rotate_left(21);
        self.v3 ^= self.v0;
        self.v2 = self.v2.wrapping_add(self.v1);
        self.v1 = self.v1.rotate_left(17);
        self.v1 ^= self.v2;
        self.v2 = self.v2.rotate_left(32);
    }

    /// Process a single portion of the message.
    fn absorb(&mut self, m: u64) {
        self.v3 ^= m;
        (0..Self::SIP_C).for_each(|_| self.round());
        self.v0 ^= m;
    }

    fn finalize(mut self) -> u64 {
        self.v2 ^= 0xff;
        (0..Self::SIP_D).for_each(|_| self.round());
        self.v0 ^ self.v1 ^ self.v2 ^ self.v3
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// See the paper–Appendix A
    #[test]
    fn manual_test_vectors() {
        let k0 = u64::from_le_bytes(0x0001020304050607_u64.to_be_bytes());
        let k1 = u64::from_le_bytes(0x08090a0b0c0d0e0f_u64.to_be_bytes());

        let mut state = State::init(k0, k1);
        let m0 = u64::from_le_bytes(0x0001020304050607_u64.to_be_bytes());
        state.absorb(m0);
        let m1 = u64::from_le_bytes(0x08090a0b0c0d0e0f_u64.to_be_bytes());
        state.absorb(m1);

        assert_eq!(state.finalize(), 0xa129ca6149be45e5);
    }

    #[test]
    fn isn_depends_on_tuple_and_clock() {
        let isn = IsnGenerator::new(1, 2);
        let tuple = FourTuple {
            local: Ipv6Address::LOOPBACK,
            local_port: 1,
            remote: Ipv6Address::LOOPBACK,
            remote_port: 2,
        };
        let swapped = FourTuple { local_port: 2, remote_port: 1, ..tuple };

        let start = isn.get_isn(tuple, Duration::from_secs(0));
        assert_eq!(start, isn.get_isn(tuple, Duration::from_micros(3)));
        assert_eq!(start + 1, isn.get_isn(tuple, Duration::from_micros(4)));
        assert_ne!(start, isn.get_isn(swapped, Duration::from_secs(0)));
    }
}
