//! Per-session cryptography: ephemeral key agreement, record sealing, and
//! rekeying.
//!
//! # Suite
//!
//! - **Key agreement**: X25519, one ephemeral keypair per exchange.
//! - **Key schedule**: HKDF-SHA256 over the shared secret and a responder
//!   contribution, salted with both public keys so the derivation binds the
//!   full exchange.
//! - **Record protection**: ChaCha20-Poly1305 with a random 96-bit nonce,
//!   then HMAC-SHA256 over `seq ‖ nonce ‖ ciphertext`. The outer MAC is what
//!   the wire format carries; it is verified in constant time before any
//!   decryption is attempted.
//! - **Replay**: strictly increasing 64-bit sequence numbers per direction;
//!   a record at or below the receive highwater mark is rejected.
//!
//! # Key lifecycle
//!
//! Keys install with both sequence counters reset. The superseded keys are
//! retained only until the first record is sealed under the new keys, then
//! dropped; all key material zeroizes on drop. No key is ever shared across
//! sessions.
//!
//! All crypto uses audited RustCrypto implementations; nothing here rolls
//! its own primitive.

use std::time::{Duration, Instant};

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use x25519_dalek::{EphemeralSecret, PublicKey};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::{ProtocolError, ProtocolResult};
use crate::record::{CipherFrame, SealedContribution, MAC_LEN, NONCE_LEN, PUBLIC_KEY_LEN};

type HmacSha256 = Hmac<Sha256>;

/// Length of the responder's secret contribution.
pub const CONTRIBUTION_LEN: usize = 32;

/// Sequence threshold that forces a rekey long before nonce or counter
/// exhaustion becomes a concern.
pub const SEQ_REKEY_THRESHOLD: u64 = 1 << 48;

const CONTRIBUTION_INFO: &[u8] = b"palaver contribution v1";
const SESSION_INFO: &[u8] = b"palaver session v1";
const FINISH_LABEL: &[u8] = b"palaver finish v1";
const REKEY_CONFIRM_LABEL: &[u8] = b"palaver rekey v1";

/// Symmetric key pair for one key epoch.
///
/// Zeroizes on drop; `Clone` is deliberately not implemented so key material
/// cannot silently multiply.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SessionKeys {
    session_key: [u8; 32],
    mac_key: [u8; 32],
}

impl SessionKeys {
    /// Computes the record MAC over `seq ‖ nonce ‖ ciphertext`.
    #[must_use]
    pub fn record_mac(&self, seq: u64, nonce: &[u8; NONCE_LEN], ciphertext: &[u8]) -> [u8; MAC_LEN] {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.mac_key)
            .expect("HMAC accepts any key length");
        mac.update(&seq.to_be_bytes());
        mac.update(nonce);
        mac.update(ciphertext);
        mac.finalize().into_bytes().into()
    }

    /// Computes a transcript MAC for the completion record of an exchange.
    #[must_use]
    pub fn transcript_mac(
        &self,
        label: TranscriptLabel,
        initiator_pub: &[u8; PUBLIC_KEY_LEN],
        responder_pub: &[u8; PUBLIC_KEY_LEN],
    ) -> [u8; MAC_LEN] {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.mac_key)
            .expect("HMAC accepts any key length");
        mac.update(label.bytes());
        mac.update(initiator_pub);
        mac.update(responder_pub);
        mac.finalize().into_bytes().into()
    }

    /// Verifies a transcript MAC in constant time.
    #[must_use]
    pub fn verify_transcript_mac(
        &self,
        label: TranscriptLabel,
        initiator_pub: &[u8; PUBLIC_KEY_LEN],
        responder_pub: &[u8; PUBLIC_KEY_LEN],
        mac: &[u8; MAC_LEN],
    ) -> bool {
        let expected = self.transcript_mac(label, initiator_pub, responder_pub);
        expected.ct_eq(mac).into()
    }

    fn cipher(&self) -> ChaCha20Poly1305 {
        ChaCha20Poly1305::new(Key::from_slice(&self.session_key))
    }

    #[cfg(test)]
    fn is_zeroed(&self) -> bool {
        self.session_key.iter().all(|&b| b == 0) && self.mac_key.iter().all(|&b| b == 0)
    }
}

/// Which exchange a transcript MAC finalizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranscriptLabel {
    /// The initial handshake.
    Handshake,
    /// A mid-session rekey.
    Rekey,
}

impl TranscriptLabel {
    const fn bytes(self) -> &'static [u8] {
        match self {
            Self::Handshake => FINISH_LABEL,
            Self::Rekey => REKEY_CONFIRM_LABEL,
        }
    }
}

/// One side of an X25519 exchange (handshake or rekey).
///
/// The secret is single-use: completing the exchange consumes it.
pub struct KeyExchange {
    secret: EphemeralSecret,
    public: PublicKey,
}

impl KeyExchange {
    /// Generates a fresh ephemeral keypair from the OS entropy source.
    #[must_use]
    pub fn generate() -> Self {
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// The public half, as carried on the wire.
    #[must_use]
    pub fn public_key(&self) -> [u8; PUBLIC_KEY_LEN] {
        self.public.to_bytes()
    }

    /// Responder side: derives keys against the initiator's public key and
    /// produces the sealed contribution the initiator needs to reach the
    /// same keys.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Handshake`] if sealing fails.
    pub fn respond(
        self,
        initiator_pub: &[u8; PUBLIC_KEY_LEN],
    ) -> ProtocolResult<(SealedContribution, SessionKeys)> {
        let responder_pub = self.public_key();
        let shared = self.secret.diffie_hellman(&PublicKey::from(*initiator_pub));

        let mut contribution = Zeroizing::new([0u8; CONTRIBUTION_LEN]);
        OsRng.fill_bytes(&mut contribution[..]);

        let seal_key = contribution_key(shared.as_bytes(), initiator_pub);
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&seal_key[..]));
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), &contribution[..])
            .map_err(|_| ProtocolError::Handshake("contribution sealing failed"))?;

        let keys = derive_session_keys(
            shared.as_bytes(),
            &contribution,
            initiator_pub,
            &responder_pub,
        );
        Ok((SealedContribution { nonce, ciphertext }, keys))
    }

    /// Initiator side: unseals the responder's contribution and derives the
    /// same keys.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Handshake`] if the contribution does not
    /// unseal or has the wrong length.
    pub fn complete(
        self,
        responder_pub: &[u8; PUBLIC_KEY_LEN],
        sealed: &SealedContribution,
    ) -> ProtocolResult<SessionKeys> {
        let initiator_pub = self.public_key();
        let shared = self.secret.diffie_hellman(&PublicKey::from(*responder_pub));

        let seal_key = contribution_key(shared.as_bytes(), &initiator_pub);
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&seal_key[..]));
        let plain = Zeroizing::new(
            cipher
                .decrypt(Nonce::from_slice(&sealed.nonce), sealed.ciphertext.as_slice())
                .map_err(|_| ProtocolError::Handshake("contribution did not unseal"))?,
        );
        if plain.len() != CONTRIBUTION_LEN {
            return Err(ProtocolError::Handshake("contribution has wrong length"));
        }
        let mut contribution = Zeroizing::new([0u8; CONTRIBUTION_LEN]);
        contribution.copy_from_slice(&plain);

        Ok(derive_session_keys(
            shared.as_bytes(),
            &contribution,
            &initiator_pub,
            responder_pub,
        ))
    }
}

/// Key used to seal the contribution to the initiator.
fn contribution_key(shared: &[u8; 32], initiator_pub: &[u8; PUBLIC_KEY_LEN]) -> Zeroizing<[u8; 32]> {
    let hk = Hkdf::<Sha256>::new(Some(initiator_pub.as_slice()), shared.as_slice());
    let mut key = Zeroizing::new([0u8; 32]);
    hk.expand(CONTRIBUTION_INFO, &mut key[..])
        .expect("32 bytes is a valid HKDF output length");
    key
}

/// Derives the record keys, binding both public keys through the salt.
fn derive_session_keys(
    shared: &[u8; 32],
    contribution: &[u8; CONTRIBUTION_LEN],
    initiator_pub: &[u8; PUBLIC_KEY_LEN],
    responder_pub: &[u8; PUBLIC_KEY_LEN],
) -> SessionKeys {
    let mut salt = [0u8; PUBLIC_KEY_LEN * 2];
    salt[..PUBLIC_KEY_LEN].copy_from_slice(initiator_pub);
    salt[PUBLIC_KEY_LEN..].copy_from_slice(responder_pub);

    let mut ikm = Zeroizing::new([0u8; 32 + CONTRIBUTION_LEN]);
    ikm[..32].copy_from_slice(shared);
    ikm[32..].copy_from_slice(contribution);

    let hk = Hkdf::<Sha256>::new(Some(salt.as_slice()), &ikm[..]);
    let mut okm = Zeroizing::new([0u8; 64]);
    hk.expand(SESSION_INFO, &mut okm[..])
        .expect("64 bytes is a valid HKDF output length");

    let mut keys = SessionKeys {
        session_key: [0u8; 32],
        mac_key: [0u8; 32],
    };
    keys.session_key.copy_from_slice(&okm[..32]);
    keys.mac_key.copy_from_slice(&okm[32..]);
    keys
}

/// One key epoch with its per-direction sequence state.
struct Epoch {
    keys: SessionKeys,
    send_seq: u64,
    recv_highwater: u64,
    installed_at: Instant,
}

impl Epoch {
    fn new(keys: SessionKeys, now: Instant) -> Self {
        Self {
            keys,
            send_seq: 0,
            recv_highwater: 0,
            installed_at: now,
        }
    }

    fn open(&mut self, frame: &CipherFrame) -> ProtocolResult<Vec<u8>> {
        if frame.seq <= self.recv_highwater {
            return Err(ProtocolError::Replay {
                seq: frame.seq,
                highwater: self.recv_highwater,
            });
        }

        let expected = self.keys.record_mac(frame.seq, &frame.nonce, &frame.ciphertext);
        if !bool::from(expected.ct_eq(&frame.mac)) {
            return Err(ProtocolError::Integrity);
        }

        let plaintext = self
            .keys
            .cipher()
            .decrypt(
                Nonce::from_slice(&frame.nonce),
                Payload {
                    msg: frame.ciphertext.as_slice(),
                    aad: &frame.seq.to_be_bytes(),
                },
            )
            .map_err(|_| ProtocolError::Integrity)?;

        self.recv_highwater = frame.seq;
        Ok(plaintext)
    }
}

/// Record-layer state for one live session.
///
/// Holds the current key epoch and, during the short window after a rekey,
/// the superseded epoch for inbound records that were sealed before the
/// peer switched. All operations are serialized by the owning connection;
/// nothing here is shared across tasks.
pub struct CryptoSession {
    current: Epoch,
    /// Superseded epoch, open-only. Destroyed on the first record sealed or
    /// opened under the current epoch.
    previous: Option<Epoch>,
}

impl CryptoSession {
    /// Wraps freshly derived keys. Sequence counters start at zero; the
    /// first sealed record carries sequence 1.
    #[must_use]
    pub fn new(keys: SessionKeys, now: Instant) -> Self {
        Self {
            current: Epoch::new(keys, now),
            previous: None,
        }
    }

    /// Next outbound sequence number minus one; strictly increasing within
    /// an epoch.
    #[must_use]
    pub const fn send_seq(&self) -> u64 {
        self.current.send_seq
    }

    /// Highest inbound sequence accepted so far in the current epoch.
    #[must_use]
    pub const fn recv_highwater(&self) -> u64 {
        self.current.recv_highwater
    }

    /// Instant the current keys were installed.
    #[must_use]
    pub const fn installed_at(&self) -> Instant {
        self.current.installed_at
    }

    /// True once either rekey trigger has fired: key age past `interval`,
    /// or the send sequence approaching exhaustion.
    #[must_use]
    pub fn needs_rekey(&self, interval: Duration, now: Instant) -> bool {
        now.duration_since(self.current.installed_at) >= interval
            || self.current.send_seq >= SEQ_REKEY_THRESHOLD
    }

    /// Seals a plaintext into a cipher frame and advances the send
    /// sequence.
    ///
    /// The first seal after a rekey destroys the superseded epoch: nothing
    /// will ever be sealed under it again, and the peer has no further
    /// claim on it once it sees a current-epoch record.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Integrity`] if AEAD encryption fails.
    pub fn seal(&mut self, plaintext: &[u8]) -> ProtocolResult<CipherFrame> {
        let seq = self
            .current
            .send_seq
            .checked_add(1)
            .ok_or(ProtocolError::Handshake("send sequence exhausted"))?;

        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let ciphertext = self
            .current
            .keys
            .cipher()
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: &seq.to_be_bytes(),
                },
            )
            .map_err(|_| ProtocolError::Integrity)?;

        let mac = self.current.keys.record_mac(seq, &nonce, &ciphertext);
        self.current.send_seq = seq;
        self.previous = None;

        Ok(CipherFrame {
            seq,
            nonce,
            ciphertext,
            mac,
        })
    }

    /// Verifies and decrypts a cipher frame.
    ///
    /// During the rekey grace window a record that fails under the current
    /// keys is retried against the superseded epoch; the first record that
    /// opens under the current epoch destroys the superseded one.
    ///
    /// # Errors
    ///
    /// - [`ProtocolError::Replay`] if the sequence does not advance.
    /// - [`ProtocolError::Integrity`] on MAC mismatch or AEAD failure.
    pub fn open(&mut self, frame: &CipherFrame) -> ProtocolResult<Vec<u8>> {
        match self.current.open(frame) {
            Ok(plaintext) => {
                // First current-epoch record: the old keys no longer exist.
                self.previous = None;
                Ok(plaintext)
            },
            Err(current_err) => {
                if let Some(previous) = self.previous.as_mut() {
                    if let Ok(plaintext) = previous.open(frame) {
                        return Ok(plaintext);
                    }
                }
                Err(current_err)
            },
        }
    }

    /// Installs a fresh key epoch. Both sequence counters reset; the old
    /// epoch stays available for inbound records until the first record is
    /// sealed or opened under the new keys.
    pub fn install(&mut self, keys: SessionKeys, now: Instant) {
        let old = std::mem::replace(&mut self.current, Epoch::new(keys, now));
        self.previous = Some(old);
    }

    /// Access to the current keys for transcript MACs.
    #[must_use]
    pub const fn keys(&self) -> &SessionKeys {
        &self.current.keys
    }

    #[cfg(test)]
    pub(crate) fn has_previous_epoch(&self) -> bool {
        self.previous.is_some()
    }
}

/// Runs a complete exchange between two in-process endpoints and returns
/// `(initiator_keys, responder_keys)`.
///
/// The daemon drives the same primitives record by record; this one-call
/// form exists for tests and tools.
///
/// # Errors
///
/// Propagates any sealing or unsealing failure.
pub fn handshake_pair() -> ProtocolResult<(SessionKeys, SessionKeys)> {
    let initiator = KeyExchange::generate();
    let responder = KeyExchange::generate();
    let initiator_pub = initiator.public_key();
    let responder_pub = responder.public_key();

    let (sealed, responder_keys) = responder.respond(&initiator_pub)?;
    let initiator_keys = initiator.complete(&responder_pub, &sealed)?;
    Ok((initiator_keys, responder_keys))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session_pair() -> (CryptoSession, CryptoSession) {
        let (a, b) = handshake_pair().unwrap();
        let now = Instant::now();
        (CryptoSession::new(a, now), CryptoSession::new(b, now))
    }

    #[test]
    fn both_sides_derive_identical_keys() {
        let (a, b) = handshake_pair().unwrap();
        assert_eq!(a.session_key, b.session_key);
        assert_eq!(a.mac_key, b.mac_key);
        assert_ne!(a.session_key, a.mac_key);
    }

    #[test]
    fn independent_exchanges_derive_distinct_keys() {
        let (a, _) = handshake_pair().unwrap();
        let (b, _) = handshake_pair().unwrap();
        assert_ne!(a.session_key, b.session_key);
    }

    #[test]
    fn seal_open_identity() {
        let (mut tx, mut rx) = session_pair();
        let frame = tx.seal(b"hello").unwrap();
        assert_eq!(rx.open(&frame).unwrap(), b"hello");
    }

    #[test]
    fn send_sequence_is_strictly_increasing() {
        let (mut tx, _) = session_pair();
        let first = tx.seal(b"a").unwrap();
        let second = tx.seal(b"b").unwrap();
        assert_eq!(first.seq, 1);
        assert_eq!(second.seq, first.seq + 1);
    }

    #[test]
    fn replayed_frame_is_rejected() {
        let (mut tx, mut rx) = session_pair();
        let frame = tx.seal(b"once").unwrap();
        assert!(rx.open(&frame).is_ok());
        assert!(matches!(
            rx.open(&frame),
            Err(ProtocolError::Replay { seq: 1, highwater: 1 })
        ));
    }

    #[test]
    fn stale_sequence_is_rejected_even_unopened() {
        let (mut tx, mut rx) = session_pair();
        let old = tx.seal(b"one").unwrap();
        let new = tx.seal(b"two").unwrap();
        assert!(rx.open(&new).is_ok());
        // `old` was never delivered, but its sequence is now below the
        // highwater mark, so it must be treated as a replay.
        assert!(matches!(rx.open(&old), Err(ProtocolError::Replay { .. })));
    }

    #[test]
    fn any_flipped_bit_fails_integrity() {
        let (mut tx, mut rx) = session_pair();
        let frame = tx.seal(b"tamper target").unwrap();

        let mut ct = frame.clone();
        ct.ciphertext[0] ^= 0x01;
        assert!(matches!(rx.open(&ct), Err(ProtocolError::Integrity)));

        let mut mac = frame.clone();
        mac.mac[MAC_LEN - 1] ^= 0x80;
        assert!(matches!(rx.open(&mac), Err(ProtocolError::Integrity)));

        let mut nonce = frame.clone();
        nonce.nonce[3] ^= 0x10;
        assert!(matches!(rx.open(&nonce), Err(ProtocolError::Integrity)));

        let mut seq = frame;
        seq.seq += 1;
        assert!(matches!(rx.open(&seq), Err(ProtocolError::Integrity)));
    }

    #[test]
    fn rekey_triggers_on_age_and_sequence() {
        let (mut tx, _) = session_pair();
        let now = Instant::now();
        assert!(!tx.needs_rekey(Duration::from_secs(1800), now));
        assert!(tx.needs_rekey(Duration::from_secs(0), now));

        tx.current.send_seq = SEQ_REKEY_THRESHOLD;
        assert!(tx.needs_rekey(Duration::from_secs(1800), now));
    }

    #[test]
    fn install_resets_counters_and_retires_the_old_epoch() {
        let (mut tx, mut rx) = session_pair();
        tx.seal(b"pre").unwrap();

        let (new_a, new_b) = handshake_pair().unwrap();
        let now = Instant::now();
        tx.install(new_a, now);
        rx.install(new_b, now);

        assert_eq!(tx.send_seq(), 0);
        assert_eq!(rx.recv_highwater(), 0);
        assert!(tx.has_previous_epoch());

        // First seal under the new epoch destroys the old keys.
        let frame = tx.seal(b"post").unwrap();
        assert!(!tx.has_previous_epoch());
        assert_eq!(frame.seq, 1);
        assert_eq!(rx.open(&frame).unwrap(), b"post");
    }

    #[test]
    fn pre_rekey_frames_stay_readable_until_the_first_new_epoch_record() {
        let (mut tx, mut rx) = session_pair();
        let in_flight = tx.seal(b"sealed before the switch").unwrap();

        let (new_a, new_b) = handshake_pair().unwrap();
        let now = Instant::now();
        tx.install(new_a, now);
        rx.install(new_b, now);

        // Grace window: the receiver still holds the old epoch.
        assert_eq!(rx.open(&in_flight).unwrap(), b"sealed before the switch");
        assert!(rx.has_previous_epoch());

        // The first current-epoch record ends the window.
        let fresh = tx.seal(b"new epoch").unwrap();
        assert_eq!(rx.open(&fresh).unwrap(), b"new epoch");
        assert!(!rx.has_previous_epoch());

        // Old-epoch records are now undecryptable: the keys are gone.
        let (mut old_tx, _) = session_pair();
        old_tx.seal(b"skip").unwrap();
        let stale = old_tx.seal(b"no such epoch").unwrap();
        assert!(matches!(rx.open(&stale), Err(ProtocolError::Integrity)));
    }

    #[test]
    fn replay_of_a_pre_rekey_frame_is_still_rejected_in_the_grace_window() {
        let (mut tx, mut rx) = session_pair();
        let in_flight = tx.seal(b"once only").unwrap();

        let (new_a, new_b) = handshake_pair().unwrap();
        let now = Instant::now();
        tx.install(new_a, now);
        rx.install(new_b, now);

        assert!(rx.open(&in_flight).is_ok());
        // Replaying the same old-epoch frame fails: its sequence no longer
        // advances the superseded epoch's highwater mark.
        assert!(rx.open(&in_flight).is_err());
    }

    #[test]
    fn explicit_zeroize_clears_key_material() {
        let (mut keys, _) = handshake_pair().unwrap();
        assert!(!keys.is_zeroed());
        keys.zeroize();
        assert!(keys.is_zeroed());
    }

    #[test]
    fn transcript_mac_verifies_and_rejects_forgeries() {
        let (keys, peer) = handshake_pair().unwrap();
        let a = [1u8; PUBLIC_KEY_LEN];
        let b = [2u8; PUBLIC_KEY_LEN];

        let mac = keys.transcript_mac(TranscriptLabel::Handshake, &a, &b);
        assert!(peer.verify_transcript_mac(TranscriptLabel::Handshake, &a, &b, &mac));
        // Wrong label, swapped keys, or a flipped bit must all fail.
        assert!(!peer.verify_transcript_mac(TranscriptLabel::Rekey, &a, &b, &mac));
        assert!(!peer.verify_transcript_mac(TranscriptLabel::Handshake, &b, &a, &mac));
        let mut bad = mac;
        bad[0] ^= 1;
        assert!(!peer.verify_transcript_mac(TranscriptLabel::Handshake, &a, &b, &bad));
    }

    #[test]
    fn tampered_contribution_does_not_unseal() {
        let initiator = KeyExchange::generate();
        let responder = KeyExchange::generate();
        let initiator_pub = initiator.public_key();
        let responder_pub = responder.public_key();

        let (mut sealed, _) = responder.respond(&initiator_pub).unwrap();
        sealed.ciphertext[0] ^= 0xFF;
        assert!(matches!(
            initiator.complete(&responder_pub, &sealed),
            Err(ProtocolError::Handshake(_))
        ));
    }
}
