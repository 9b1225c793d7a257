//! End-to-end stream encryption: per-stream X25519 ECDH, HKDF-SHA256 key
//! derivation, ChaCha20-Poly1305 sealing, and strict anti-replay.
//!
//! Ingress and exit each contribute an ephemeral key per stream; the derived
//! material splits into one subkey per direction. Transit agents never hold
//! any of this. Nonces are a fixed 4-byte direction prefix followed by a
//! monotonically increasing 8-byte counter; a counter that does not strictly
//! exceed the highest value seen is rejected.

use std::sync::atomic::{AtomicU64, Ordering};

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hkdf::Hkdf;
use sha2::Sha256;
use x25519_dalek::{EphemeralSecret, PublicKey};
use zeroize::Zeroize;

use crate::error::CryptoError;
use crate::frame::MAX_PAYLOAD;

/// Nonce (12) plus Poly1305 tag (16).
pub const AEAD_OVERHEAD: usize = 28;
/// Largest plaintext that seals into a single frame payload.
pub const MAX_PLAINTEXT: usize = MAX_PAYLOAD - AEAD_OVERHEAD;

const NONCE_LEN: usize = 12;
const PREFIX_I2R: [u8; 4] = *b"I2R\0";
const PREFIX_R2I: [u8; 4] = *b"R2I\0";

/// Which side of the ECDH this key set belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

/// One ephemeral X25519 keypair, generated per stream open and consumed by
/// the agreement. The private half zeroizes on drop.
pub struct EphemeralKeyPair {
    secret: EphemeralSecret,
    public: PublicKey,
}

impl EphemeralKeyPair {
    pub fn generate() -> Self {
        let secret = EphemeralSecret::random();
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn public_bytes(&self) -> [u8; 32] {
        *self.public.as_bytes()
    }

    /// Performs the agreement, consuming the private key.
    pub fn agree(self, peer_pub: &[u8; 32]) -> x25519_dalek::SharedSecret {
        self.secret.diffie_hellman(&PublicKey::from(*peer_pub))
    }
}

impl std::fmt::Debug for EphemeralKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EphemeralKeyPair({:02x?}..)", &self.public.as_bytes()[..4])
    }
}

struct DirectionKey {
    cipher: ChaCha20Poly1305,
    prefix: [u8; 4],
}

impl DirectionKey {
    fn new(mut key: [u8; 32], prefix: [u8; 4]) -> Self {
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
        key.zeroize();
        Self { cipher, prefix }
    }

    fn nonce(&self, counter: u64) -> Nonce {
        let mut raw = [0u8; NONCE_LEN];
        raw[..4].copy_from_slice(&self.prefix);
        raw[4..].copy_from_slice(&counter.to_be_bytes());
        Nonce::from(raw)
    }
}

/// Per-stream AEAD state. Send nonces strictly increase; receive nonces must
/// strictly exceed the highest value accepted so far.
pub struct SessionKey {
    send: DirectionKey,
    recv: DirectionKey,
    send_counter: AtomicU64,
    recv_high_water: AtomicU64,
}

impl SessionKey {
    /// Derives the two direction subkeys from the ECDH shared secret.
    ///
    /// `okm = HKDF-SHA256(ikm = shared, salt = zero,
    ///                    info = request_id_be || initiator_pub || responder_pub)`
    /// with the first 32 bytes keying initiator→responder and the second 32
    /// keying responder→initiator. The shared secret drops (and zeroizes)
    /// before this returns.
    pub fn derive(
        shared: x25519_dalek::SharedSecret,
        request_id: u64,
        initiator_pub: &[u8; 32],
        responder_pub: &[u8; 32],
        role: Role,
    ) -> Self {
        let mut info = [0u8; 8 + 32 + 32];
        info[..8].copy_from_slice(&request_id.to_be_bytes());
        info[8..40].copy_from_slice(initiator_pub);
        info[40..].copy_from_slice(responder_pub);

        let hk = Hkdf::<Sha256>::new(None, shared.as_bytes());
        let mut okm = [0u8; 64];
        hk.expand(&info, &mut okm)
            .expect("64 bytes is a valid HKDF-SHA256 output length");
        drop(shared);

        let mut i2r = [0u8; 32];
        let mut r2i = [0u8; 32];
        i2r.copy_from_slice(&okm[..32]);
        r2i.copy_from_slice(&okm[32..]);
        okm.zeroize();

        let (send, recv) = match role {
            Role::Initiator => (
                DirectionKey::new(i2r, PREFIX_I2R),
                DirectionKey::new(r2i, PREFIX_R2I),
            ),
            Role::Responder => (
                DirectionKey::new(r2i, PREFIX_R2I),
                DirectionKey::new(i2r, PREFIX_I2R),
            ),
        };

        Self {
            send,
            recv,
            send_counter: AtomicU64::new(0),
            recv_high_water: AtomicU64::new(0),
        }
    }

    /// Seals a plaintext chunk: `nonce || ciphertext || tag`, 28 bytes of
    /// overhead. The empty plaintext seals to exactly 28 bytes.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        debug_assert!(plaintext.len() <= MAX_PLAINTEXT);
        let counter = self.send_counter.fetch_add(1, Ordering::Relaxed);
        if counter == u64::MAX {
            return Err(CryptoError::Exhausted);
        }
        let nonce = self.send.nonce(counter);
        let ciphertext = self
            .send
            .cipher
            .encrypt(
                &nonce,
                Payload {
                    msg: plaintext,
                    aad: &[],
                },
            )
            .map_err(|_| CryptoError::Auth)?;
        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Opens a sealed chunk, rejecting short input, tag failures, and any
    /// counter at or below the receive high-water mark.
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if sealed.len() < AEAD_OVERHEAD {
            return Err(CryptoError::TooShort);
        }
        let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
        if nonce_bytes[..4] != self.recv.prefix {
            return Err(CryptoError::Auth);
        }
        let counter = u64::from_be_bytes(
            nonce_bytes[4..]
                .try_into()
                .expect("nonce counter is 8 bytes"),
        );
        // Counter 0 is the first valid value; the high-water mark stores
        // counter + 1 so zero needs no special case.
        if counter.checked_add(1).is_none() {
            return Err(CryptoError::Exhausted);
        }
        if counter + 1 <= self.recv_high_water.load(Ordering::Acquire) {
            return Err(CryptoError::Replay);
        }
        let plaintext = self
            .recv
            .cipher
            .decrypt(
                Nonce::from_slice(nonce_bytes),
                Payload {
                    msg: ciphertext,
                    aad: &[],
                },
            )
            .map_err(|_| CryptoError::Auth)?;
        // Publish the new high-water mark; a concurrent higher value wins.
        let mut current = self.recv_high_water.load(Ordering::Acquire);
        loop {
            if counter + 1 <= current {
                return Err(CryptoError::Replay);
            }
            match self.recv_high_water.compare_exchange(
                current,
                counter + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
        Ok(plaintext)
    }

    /// Number of chunks sealed so far.
    pub fn sent(&self) -> u64 {
        self.send_counter.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionKey")
            .field("sent", &self.send_counter.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Derives the matched pair of session keys for both roles; test helper and
/// the loopback path used by single-process wiring.
pub fn derive_pair(request_id: u64) -> (SessionKey, SessionKey) {
    let initiator = EphemeralKeyPair::generate();
    let responder = EphemeralKeyPair::generate();
    let init_pub = initiator.public_bytes();
    let resp_pub = responder.public_bytes();
    let initiator_key = SessionKey::derive(
        initiator.agree(&resp_pub),
        request_id,
        &init_pub,
        &resp_pub,
        Role::Initiator,
    );
    let responder_key = SessionKey::derive(
        responder.agree(&init_pub),
        request_id,
        &init_pub,
        &resp_pub,
        Role::Responder,
    );
    (initiator_key, responder_key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_round_trip() {
        let (ingress, exit) = derive_pair(1);
        let sealed = ingress.seal(b"hello mesh").unwrap();
        assert_eq!(sealed.len(), b"hello mesh".len() + AEAD_OVERHEAD);
        assert_eq!(exit.open(&sealed).unwrap(), b"hello mesh");
    }

    #[test]
    fn empty_plaintext_seals_to_overhead_bytes() {
        let (ingress, exit) = derive_pair(2);
        let sealed = ingress.seal(b"").unwrap();
        assert_eq!(sealed.len(), AEAD_OVERHEAD);
        assert_eq!(exit.open(&sealed).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn replayed_nonce_is_rejected() {
        let (ingress, exit) = derive_pair(3);
        let first = ingress.seal(b"one").unwrap();
        let second = ingress.seal(b"two").unwrap();
        let third = ingress.seal(b"three").unwrap();
        assert!(exit.open(&first).is_ok());
        assert!(exit.open(&second).is_ok());
        assert!(exit.open(&third).is_ok());
        // Feeding nonce 1 again must fail closed.
        assert!(matches!(exit.open(&second), Err(CryptoError::Replay)));
    }

    #[test]
    fn decreasing_counter_is_rejected_even_unseen() {
        let (ingress, exit) = derive_pair(4);
        let first = ingress.seal(b"a").unwrap();
        let second = ingress.seal(b"b").unwrap();
        assert!(exit.open(&second).is_ok());
        assert!(matches!(exit.open(&first), Err(CryptoError::Replay)));
    }

    #[test]
    fn tampered_ciphertext_fails_auth() {
        let (ingress, exit) = derive_pair(5);
        let mut sealed = ingress.seal(b"payload").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(matches!(exit.open(&sealed), Err(CryptoError::Auth)));
    }

    #[test]
    fn short_input_rejected() {
        let (_, exit) = derive_pair(6);
        assert!(matches!(
            exit.open(&[0u8; AEAD_OVERHEAD - 1]),
            Err(CryptoError::TooShort)
        ));
    }

    #[test]
    fn directions_are_independent() {
        let (ingress, exit) = derive_pair(7);
        // Exit's own traffic cannot be reflected back to it.
        let sealed = exit.seal(b"downstream").unwrap();
        assert!(exit.open(&sealed).is_err());
        assert_eq!(ingress.open(&sealed).unwrap(), b"downstream");
    }

    #[test]
    fn keys_differ_per_request_id() {
        let a = EphemeralKeyPair::generate();
        let b = EphemeralKeyPair::generate();
        let (a_pub, b_pub) = (a.public_bytes(), b.public_bytes());
        let k1 = SessionKey::derive(a.agree(&b_pub), 1, &a_pub, &b_pub, Role::Initiator);
        let c = EphemeralKeyPair::generate();
        let d = EphemeralKeyPair::generate();
        let (c_pub, d_pub) = (c.public_bytes(), d.public_bytes());
        let k2 = SessionKey::derive(c.agree(&d_pub), 1, &c_pub, &d_pub, Role::Responder);
        let sealed = k1.seal(b"x").unwrap();
        assert!(k2.open(&sealed).is_err());
    }

    #[test]
    fn send_counter_increases() {
        let (ingress, _) = derive_pair(8);
        ingress.seal(b"1").unwrap();
        ingress.seal(b"2").unwrap();
        assert_eq!(ingress.sent(), 2);
    }
}
