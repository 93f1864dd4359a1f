//! WireGuard Handshake (initiator half)
//!
//! Noise_IKpsk2_25519_ChaChaPoly_BLAKE2s as framed by WireGuard:
//!
//! - Initiator sends: e, es, s, ss (+ TAI64N timestamp payload)
//! - Responder sends: e, ee, se, psk (+ empty payload)
//!
//! Only the messages needed to prove a responder is alive are built here;
//! no transport keys are ever derived from the result.
//!
//! # Initiation (148 bytes)
//!
//! ```text
//! 0      4        8             40              88            116    132    148
//! | type | sender | ephemeral    | static+tag    | tai64n+tag  | mac1 | mac2 |
//! ```
//!
//! # Response (92 bytes)
//!
//! ```text
//! 0      4        8          12            44          60     76     92
//! | type | sender | receiver | ephemeral   | empty+tag | mac1 | mac2 |
//! ```

use crate::keys::{KeyError, PresharedKey, PrivateKey, PublicKey};
use blake2::digest::consts::U16;
use blake2::{Blake2s256, Blake2sMac, Digest};
use chacha20poly1305::aead::{Aead, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, KeyInit, Nonce};
use hmac::{Mac, SimpleHmac};
use std::time::{SystemTime, UNIX_EPOCH};

pub const CONSTRUCTION: &[u8] = b"Noise_IKpsk2_25519_ChaChaPoly_BLAKE2s";
pub const IDENTIFIER: &[u8] = b"WireGuard v1 zx2c4 Jason@zx2c4.com";
pub const LABEL_MAC1: &[u8] = b"mac1----";

pub const MESSAGE_INITIATION: u8 = 1;
pub const MESSAGE_RESPONSE: u8 = 2;

pub const INITIATION_LEN: usize = 148;
pub const RESPONSE_LEN: usize = 92;

/// Sender index carried by every probe initiation. Real responders echo it
/// back in the receiver field, so it must stay fixed.
pub const PROBE_SENDER_INDEX: u32 = 28;

/// TAI64 label of the Unix epoch (2^62 + 10).
pub const TAI64_EPOCH_OFFSET: u64 = 4611686018427387914;

const AEAD_TAG_LEN: usize = 16;
const MAC_LEN: usize = 16;
const MAC1_OFFSET: usize = INITIATION_LEN - 2 * MAC_LEN;

type HmacBlake2s = SimpleHmac<Blake2s256>;
type Mac128 = Blake2sMac<U16>;

/// Handshake errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandshakeError {
    #[error("Response too short or oversized ({0} bytes, expected 92)")]
    BadLength(usize),

    #[error("Unexpected message type {0}")]
    UnexpectedType(u8),

    #[error("Receiver index {got} does not match sender index {expected}")]
    IndexMismatch { expected: u32, got: u32 },

    #[error("Response failed authentication")]
    Decrypt,

    #[error("Response carried a non-empty payload ({0} bytes)")]
    UnexpectedPayload(usize),

    #[error("Key error: {0}")]
    Key(#[from] KeyError),

    #[error("Crypto primitive error")]
    Crypto,
}

/// TAI64N timestamp: big-endian TAI64 seconds followed by nanoseconds.
pub fn tai64n(now: SystemTime) -> [u8; 12] {
    let since_epoch = now.duration_since(UNIX_EPOCH).unwrap_or_default();

    let mut out = [0u8; 12];
    out[..8].copy_from_slice(&(TAI64_EPOCH_OFFSET + since_epoch.as_secs()).to_be_bytes());
    out[8..].copy_from_slice(&since_epoch.subsec_nanos().to_be_bytes());
    out
}

fn hash(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Blake2s256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

fn hmac(key: &[u8], parts: &[&[u8]]) -> Result<[u8; 32], HandshakeError> {
    let mut mac = <HmacBlake2s as Mac>::new_from_slice(key).map_err(|_| HandshakeError::Crypto)?;
    for part in parts {
        mac.update(part);
    }
    Ok(mac.finalize().into_bytes().into())
}

/// HKDF over HMAC-BLAKE2s, returning the first `N` output blocks.
fn kdf<const N: usize>(chaining_key: &[u8; 32], input: &[u8]) -> Result<[[u8; 32]; N], HandshakeError> {
    let prk = hmac(chaining_key, &[input])?;

    let mut out = [[0u8; 32]; N];
    let mut previous: Vec<u8> = Vec::new();
    for (i, block) in out.iter_mut().enumerate() {
        let counter = [(i + 1) as u8];
        *block = hmac(&prk, &[&previous, &counter])?;
        previous = block.to_vec();
    }
    Ok(out)
}

fn mac1(peer: &PublicKey, message: &[u8]) -> Result<[u8; MAC_LEN], HandshakeError> {
    let key = hash(&[LABEL_MAC1, peer.as_bytes()]);
    let mut mac = <Mac128 as Mac>::new_from_slice(&key).map_err(|_| HandshakeError::Crypto)?;
    mac.update(message);
    Ok(mac.finalize().into_bytes().into())
}

fn seal(key: &[u8; 32], plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, HandshakeError> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .encrypt(Nonce::from_slice(&[0u8; 12]), Payload { msg: plaintext, aad })
        .map_err(|_| HandshakeError::Crypto)
}

fn open(key: &[u8; 32], ciphertext: &[u8], aad: &[u8]) -> Result<Vec<u8>, HandshakeError> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .decrypt(Nonce::from_slice(&[0u8; 12]), Payload { msg: ciphertext, aad })
        .map_err(|_| HandshakeError::Decrypt)
}

/// Initial chaining key and hash after mixing in the responder static key.
fn initial_state(responder: &PublicKey) -> ([u8; 32], [u8; 32]) {
    let chaining_key = hash(&[CONSTRUCTION]);
    let h = hash(&[&chaining_key, IDENTIFIER]);
    (chaining_key, hash(&[&h, responder.as_bytes()]))
}

fn read_u32(bytes: &[u8]) -> u32 {
    let mut arr = [0u8; 4];
    arr.copy_from_slice(&bytes[..4]);
    u32::from_le_bytes(arr)
}

/// Long-lived initiator identity: our static key, the responder key and
/// the optional preshared key.
#[derive(Debug, Clone)]
pub struct HandshakeInitiator {
    local: PrivateKey,
    local_public: PublicKey,
    peer: PublicKey,
    psk: PresharedKey,
}

impl HandshakeInitiator {
    pub fn new(local: PrivateKey, peer: PublicKey, psk: Option<PresharedKey>) -> Self {
        let local_public = local.public_key();
        Self {
            local,
            local_public,
            peer,
            psk: psk.unwrap_or(PresharedKey::ZERO),
        }
    }

    pub fn peer(&self) -> &PublicKey {
        &self.peer
    }

    /// Build a framed initiation using `ephemeral` and `timestamp`.
    pub fn initiate(
        &self,
        ephemeral: PrivateKey,
        sender_index: u32,
        timestamp: [u8; 12],
    ) -> Result<Initiation, HandshakeError> {
        let (mut chaining_key, mut h) = initial_state(&self.peer);
        let ephemeral_public = ephemeral.public_key();

        let mut packet = [0u8; INITIATION_LEN];
        packet[0] = MESSAGE_INITIATION;
        packet[4..8].copy_from_slice(&sender_index.to_le_bytes());
        packet[8..40].copy_from_slice(ephemeral_public.as_bytes());

        // e
        [chaining_key] = kdf::<1>(&chaining_key, ephemeral_public.as_bytes())?;
        h = hash(&[&h, ephemeral_public.as_bytes()]);

        // es
        let [ck, key] = kdf::<2>(&chaining_key, &ephemeral.diffie_hellman(&self.peer)?)?;
        chaining_key = ck;

        // s
        let encrypted_static = seal(&key, self.local_public.as_bytes(), &h)?;
        packet[40..88].copy_from_slice(&encrypted_static);
        h = hash(&[&h, &encrypted_static]);

        // ss
        let [ck, key] = kdf::<2>(&chaining_key, &self.local.diffie_hellman(&self.peer)?)?;
        chaining_key = ck;

        let encrypted_timestamp = seal(&key, &timestamp, &h)?;
        packet[88..116].copy_from_slice(&encrypted_timestamp);
        h = hash(&[&h, &encrypted_timestamp]);

        let tag = mac1(&self.peer, &packet[..MAC1_OFFSET])?;
        packet[MAC1_OFFSET..MAC1_OFFSET + MAC_LEN].copy_from_slice(&tag);
        // mac2 stays zero: no cookie has been received

        Ok(Initiation {
            packet,
            sender_index,
            chaining_key,
            hash: h,
            ephemeral,
            local: self.local.clone(),
            psk: self.psk,
        })
    }
}

/// A built initiation together with the state needed to check the reply.
pub struct Initiation {
    packet: [u8; INITIATION_LEN],
    sender_index: u32,
    chaining_key: [u8; 32],
    hash: [u8; 32],
    ephemeral: PrivateKey,
    local: PrivateKey,
    psk: PresharedKey,
}

impl Initiation {
    pub fn packet(&self) -> &[u8; INITIATION_LEN] {
        &self.packet
    }

    pub fn sender_index(&self) -> u32 {
        self.sender_index
    }

    /// Validate a response datagram and finish the responder's message
    /// processing. Returns the responder's own index on success.
    pub fn consume_response(&self, datagram: &[u8]) -> Result<u32, HandshakeError> {
        if datagram.len() != RESPONSE_LEN {
            return Err(HandshakeError::BadLength(datagram.len()));
        }
        if datagram[0] != MESSAGE_RESPONSE {
            return Err(HandshakeError::UnexpectedType(datagram[0]));
        }

        let responder_index = read_u32(&datagram[4..8]);
        let receiver_index = read_u32(&datagram[8..12]);
        if receiver_index != self.sender_index {
            return Err(HandshakeError::IndexMismatch {
                expected: self.sender_index,
                got: receiver_index,
            });
        }

        let mut responder_ephemeral = [0u8; 32];
        responder_ephemeral.copy_from_slice(&datagram[12..44]);
        let responder_ephemeral = PublicKey::from_bytes(responder_ephemeral);

        // e
        let [mut chaining_key] = kdf::<1>(&self.chaining_key, responder_ephemeral.as_bytes())?;
        let mut h = hash(&[&self.hash, responder_ephemeral.as_bytes()]);

        // ee
        [chaining_key] = kdf::<1>(&chaining_key, &self.ephemeral.diffie_hellman(&responder_ephemeral)?)?;
        // se
        [chaining_key] = kdf::<1>(&chaining_key, &self.local.diffie_hellman(&responder_ephemeral)?)?;

        // psk
        let [_, tau, key] = kdf::<3>(&chaining_key, self.psk.as_bytes())?;
        h = hash(&[&h, &tau]);

        let payload = open(&key, &datagram[44..44 + AEAD_TAG_LEN], &h)?;
        if !payload.is_empty() {
            return Err(HandshakeError::UnexpectedPayload(payload.len()));
        }

        Ok(responder_index)
    }
}

#[cfg(test)]
pub(crate) mod responder {
    //! Minimal responder used to exercise the initiator in tests.

    use super::*;

    pub(crate) struct Responder {
        pub(crate) static_key: PrivateKey,
        pub(crate) psk: PresharedKey,
        pub(crate) index: u32,
    }

    impl Responder {
        pub(crate) fn new(static_key: PrivateKey) -> Self {
            Self {
                static_key,
                psk: PresharedKey::ZERO,
                index: 0x0a0b_0c0d,
            }
        }

        /// Consume an initiation and produce a matching response.
        pub(crate) fn respond(&self, initiation: &[u8], ephemeral: PrivateKey) -> Result<[u8; RESPONSE_LEN], HandshakeError> {
            if initiation.len() != INITIATION_LEN || initiation[0] != MESSAGE_INITIATION {
                return Err(HandshakeError::BadLength(initiation.len()));
            }
            let our_public = self.static_key.public_key();
            if mac1(&our_public, &initiation[..MAC1_OFFSET])? != initiation[MAC1_OFFSET..MAC1_OFFSET + MAC_LEN] {
                return Err(HandshakeError::Decrypt);
            }

            let (mut chaining_key, mut h) = initial_state(&our_public);
            let mut bytes = [0u8; 32];
            bytes.copy_from_slice(&initiation[8..40]);
            let initiator_ephemeral = PublicKey::from_bytes(bytes);

            [chaining_key] = kdf::<1>(&chaining_key, initiator_ephemeral.as_bytes())?;
            h = hash(&[&h, initiator_ephemeral.as_bytes()]);

            let [ck, key] = kdf::<2>(&chaining_key, &self.static_key.diffie_hellman(&initiator_ephemeral)?)?;
            chaining_key = ck;
            let static_plain = open(&key, &initiation[40..88], &h)?;
            h = hash(&[&h, &initiation[40..88]]);
            bytes.copy_from_slice(&static_plain);
            let initiator_static = PublicKey::from_bytes(bytes);

            let [ck, key] = kdf::<2>(&chaining_key, &self.static_key.diffie_hellman(&initiator_static)?)?;
            chaining_key = ck;
            open(&key, &initiation[88..116], &h)?;
            h = hash(&[&h, &initiation[88..116]]);

            let ephemeral_public = ephemeral.public_key();
            let mut response = [0u8; RESPONSE_LEN];
            response[0] = MESSAGE_RESPONSE;
            response[4..8].copy_from_slice(&self.index.to_le_bytes());
            response[8..12].copy_from_slice(&initiation[4..8]);
            response[12..44].copy_from_slice(ephemeral_public.as_bytes());

            [chaining_key] = kdf::<1>(&chaining_key, ephemeral_public.as_bytes())?;
            h = hash(&[&h, ephemeral_public.as_bytes()]);
            [chaining_key] = kdf::<1>(&chaining_key, &ephemeral.diffie_hellman(&initiator_ephemeral)?)?;
            [chaining_key] = kdf::<1>(&chaining_key, &ephemeral.diffie_hellman(&initiator_static)?)?;
            let [_, tau, key] = kdf::<3>(&chaining_key, self.psk.as_bytes())?;
            h = hash(&[&h, &tau]);

            let empty = seal(&key, &[], &h)?;
            response[44..60].copy_from_slice(&empty);
            let tag = mac1(&initiator_static, &response[..60])?;
            response[60..76].copy_from_slice(&tag);
            Ok(response)
        }
    }
}
