//! Record layer: tag-dispatched payloads carried inside length-prefixed
//! frames.
//!
//! A record payload is a 1-byte type tag followed by a type-specific body:
//!
//! | tag    | record          | body                                        |
//! |--------|-----------------|---------------------------------------------|
//! | `0x01` | HandshakeHello  | public key, optionally a sealed contribution|
//! | `0x02` | HandshakeFinish | 32-byte transcript MAC                      |
//! | `0x03` | AuthRequest     | UTF-8 JSON credentials blob                 |
//! | `0x04` | AuthResponse    | UTF-8 JSON principal or error               |
//! | `0x10` | CipherFrame     | seq (8B BE), nonce (12B), ciphertext, MAC   |
//! | `0x20` | Keepalive       | empty                                       |
//! | `0x30` | Rekey           | phase byte + phase-specific body            |
//! | `0xFF` | Close           | 1-byte reason code (absent means normal)    |
//!
//! Unknown tags fail closed: there is no default coercion, the connection is
//! terminated with a protocol error.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{CloseReason, ProtocolError, ProtocolResult};

/// X25519 public key length.
pub const PUBLIC_KEY_LEN: usize = 32;

/// AEAD nonce length (96 bits).
pub const NONCE_LEN: usize = 12;

/// Record MAC length (HMAC-SHA256).
pub const MAC_LEN: usize = 32;

/// Upper bound on a sealed handshake contribution (32-byte secret plus the
/// 16-byte AEAD tag, with headroom for future suites).
pub const MAX_CONTRIBUTION_LEN: usize = 256;

/// A secret contribution sealed to the receiver's public key.
///
/// Used in the client HandshakeHello and in the rekey response. The receiver
/// unseals it with the shared secret of its own keypair and the sender's
/// public key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedContribution {
    /// AEAD nonce chosen by the sealer.
    pub nonce: [u8; NONCE_LEN],
    /// AEAD ciphertext of the contribution bytes.
    pub ciphertext: Vec<u8>,
}

/// Encrypted application record.
///
/// The MAC covers `seq ‖ nonce ‖ ciphertext` and is verified before any
/// decryption is attempted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CipherFrame {
    /// Monotone per-direction sequence number.
    pub seq: u64,
    /// Random per-record nonce.
    pub nonce: [u8; NONCE_LEN],
    /// AEAD ciphertext (includes the 16-byte AEAD tag).
    pub ciphertext: Vec<u8>,
    /// HMAC-SHA256 over `seq ‖ nonce ‖ ciphertext`.
    pub mac: [u8; MAC_LEN],
}

/// Phase of the three-step rekey sub-exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RekeyPhase {
    /// Initiator advertises a fresh public key.
    Init {
        /// Fresh X25519 public key.
        public_key: [u8; PUBLIC_KEY_LEN],
    },
    /// Responder answers with its fresh key and a sealed contribution.
    Response {
        /// Fresh X25519 public key.
        public_key: [u8; PUBLIC_KEY_LEN],
        /// Contribution sealed to the initiator's fresh key.
        contribution: SealedContribution,
    },
    /// Initiator confirms under the newly derived MAC key.
    Confirm {
        /// HMAC-SHA256 over the rekey transcript.
        mac: [u8; MAC_LEN],
    },
}

/// Decoded record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    /// Public key announcement; the client copy carries a sealed secret
    /// contribution, the server copy does not.
    HandshakeHello {
        /// Sender's ephemeral X25519 public key.
        public_key: [u8; PUBLIC_KEY_LEN],
        /// Present only on the client hello.
        contribution: Option<SealedContribution>,
    },
    /// MAC-covered completion marker ending the handshake.
    HandshakeFinish {
        /// HMAC-SHA256 over the handshake transcript.
        mac: [u8; MAC_LEN],
    },
    /// Credentials blob (UTF-8 JSON), parsed by the auth layer.
    AuthRequest(Bytes),
    /// Principal-or-error blob (UTF-8 JSON).
    AuthResponse(Bytes),
    /// Encrypted application record.
    Cipher(CipherFrame),
    /// Explicit keepalive (the zero-length frame is the implicit form).
    Keepalive,
    /// Rekey sub-exchange message.
    Rekey(RekeyPhase),
    /// Connection close with a category reason.
    Close(CloseReason),
}

/// Record type tags. Values are part of the wire contract.
mod tag {
    pub const HANDSHAKE_HELLO: u8 = 0x01;
    pub const HANDSHAKE_FINISH: u8 = 0x02;
    pub const AUTH_REQUEST: u8 = 0x03;
    pub const AUTH_RESPONSE: u8 = 0x04;
    pub const CIPHER: u8 = 0x10;
    pub const KEEPALIVE: u8 = 0x20;
    pub const REKEY: u8 = 0x30;
    pub const CLOSE: u8 = 0xFF;
}

/// Rekey phase discriminants.
mod rekey_phase {
    pub const INIT: u8 = 0x01;
    pub const RESPONSE: u8 = 0x02;
    pub const CONFIRM: u8 = 0x03;
}

impl Record {
    /// Wire tag for this record.
    #[must_use]
    pub const fn tag(&self) -> u8 {
        match self {
            Self::HandshakeHello { .. } => tag::HANDSHAKE_HELLO,
            Self::HandshakeFinish { .. } => tag::HANDSHAKE_FINISH,
            Self::AuthRequest(_) => tag::AUTH_REQUEST,
            Self::AuthResponse(_) => tag::AUTH_RESPONSE,
            Self::Cipher(_) => tag::CIPHER,
            Self::Keepalive => tag::KEEPALIVE,
            Self::Rekey(_) => tag::REKEY,
            Self::Close(_) => tag::CLOSE,
        }
    }

    /// Human-readable record name for diagnostics.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::HandshakeHello { .. } => "handshake-hello",
            Self::HandshakeFinish { .. } => "handshake-finish",
            Self::AuthRequest(_) => "auth-request",
            Self::AuthResponse(_) => "auth-response",
            Self::Cipher(_) => "cipher",
            Self::Keepalive => "keepalive",
            Self::Rekey(_) => "rekey",
            Self::Close(_) => "close",
        }
    }

    /// Serializes the record into a frame payload.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_hint());
        buf.put_u8(self.tag());
        match self {
            Self::HandshakeHello {
                public_key,
                contribution,
            } => {
                buf.extend_from_slice(public_key);
                if let Some(sealed) = contribution {
                    buf.extend_from_slice(&sealed.nonce);
                    #[allow(clippy::cast_possible_truncation)] // bounded below MAX_CONTRIBUTION_LEN
                    buf.put_u16(sealed.ciphertext.len() as u16);
                    buf.extend_from_slice(&sealed.ciphertext);
                }
            },
            Self::HandshakeFinish { mac } => buf.extend_from_slice(mac),
            Self::AuthRequest(body) | Self::AuthResponse(body) => buf.extend_from_slice(body),
            Self::Cipher(frame) => {
                buf.put_u64(frame.seq);
                buf.extend_from_slice(&frame.nonce);
                buf.extend_from_slice(&frame.ciphertext);
                buf.extend_from_slice(&frame.mac);
            },
            Self::Keepalive => {},
            Self::Rekey(phase) => match phase {
                RekeyPhase::Init { public_key } => {
                    buf.put_u8(rekey_phase::INIT);
                    buf.extend_from_slice(public_key);
                },
                RekeyPhase::Response {
                    public_key,
                    contribution,
                } => {
                    buf.put_u8(rekey_phase::RESPONSE);
                    buf.extend_from_slice(public_key);
                    buf.extend_from_slice(&contribution.nonce);
                    #[allow(clippy::cast_possible_truncation)]
                    buf.put_u16(contribution.ciphertext.len() as u16);
                    buf.extend_from_slice(&contribution.ciphertext);
                },
                RekeyPhase::Confirm { mac } => {
                    buf.put_u8(rekey_phase::CONFIRM);
                    buf.extend_from_slice(mac);
                },
            },
            Self::Close(reason) => buf.put_u8(*reason as u8),
        }
        buf.freeze()
    }

    /// Parses a frame payload into a record.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::UnknownTag`] for unrecognized tags and
    /// [`ProtocolError::Malformed`] for structurally invalid bodies. Empty
    /// payloads decode as [`Record::Keepalive`] (the zero-length NOOP).
    pub fn decode(payload: &[u8]) -> ProtocolResult<Self> {
        let Some((&tag_byte, body)) = payload.split_first() else {
            return Ok(Self::Keepalive);
        };

        match tag_byte {
            tag::HANDSHAKE_HELLO => decode_hello(body),
            tag::HANDSHAKE_FINISH => {
                let mac = fixed::<MAC_LEN>(body, "handshake-finish mac")?;
                Ok(Self::HandshakeFinish { mac })
            },
            tag::AUTH_REQUEST => Ok(Self::AuthRequest(Bytes::copy_from_slice(body))),
            tag::AUTH_RESPONSE => Ok(Self::AuthResponse(Bytes::copy_from_slice(body))),
            tag::CIPHER => decode_cipher(body),
            tag::KEEPALIVE => {
                if body.is_empty() {
                    Ok(Self::Keepalive)
                } else {
                    Err(ProtocolError::Malformed("keepalive carries a body"))
                }
            },
            tag::REKEY => decode_rekey(body),
            tag::CLOSE => {
                let reason = match body {
                    [] => CloseReason::Normal,
                    [byte] => CloseReason::from_byte(*byte)
                        .ok_or(ProtocolError::Malformed("unknown close reason"))?,
                    _ => return Err(ProtocolError::Malformed("close body too long")),
                };
                Ok(Self::Close(reason))
            },
            other => Err(ProtocolError::UnknownTag { tag: other }),
        }
    }

    fn encoded_hint(&self) -> usize {
        match self {
            Self::Cipher(frame) => 1 + 8 + NONCE_LEN + frame.ciphertext.len() + MAC_LEN,
            Self::AuthRequest(body) | Self::AuthResponse(body) => 1 + body.len(),
            _ => 128,
        }
    }
}

fn decode_hello(body: &[u8]) -> ProtocolResult<Record> {
    if body.len() < PUBLIC_KEY_LEN {
        return Err(ProtocolError::Malformed("hello shorter than a public key"));
    }
    let mut public_key = [0u8; PUBLIC_KEY_LEN];
    public_key.copy_from_slice(&body[..PUBLIC_KEY_LEN]);
    let rest = &body[PUBLIC_KEY_LEN..];

    if rest.is_empty() {
        return Ok(Record::HandshakeHello {
            public_key,
            contribution: None,
        });
    }

    let contribution = decode_contribution(rest)?;
    Ok(Record::HandshakeHello {
        public_key,
        contribution: Some(contribution),
    })
}

fn decode_contribution(body: &[u8]) -> ProtocolResult<SealedContribution> {
    if body.len() < NONCE_LEN + 2 {
        return Err(ProtocolError::Malformed("sealed contribution truncated"));
    }
    let mut nonce = [0u8; NONCE_LEN];
    nonce.copy_from_slice(&body[..NONCE_LEN]);
    let len = u16::from_be_bytes([body[NONCE_LEN], body[NONCE_LEN + 1]]) as usize;
    if len > MAX_CONTRIBUTION_LEN {
        return Err(ProtocolError::Malformed("sealed contribution too large"));
    }
    let rest = &body[NONCE_LEN + 2..];
    if rest.len() != len {
        return Err(ProtocolError::Malformed("sealed contribution length mismatch"));
    }
    Ok(SealedContribution {
        nonce,
        ciphertext: rest.to_vec(),
    })
}

fn decode_cipher(body: &[u8]) -> ProtocolResult<Record> {
    const MIN: usize = 8 + NONCE_LEN + MAC_LEN;
    if body.len() < MIN {
        return Err(ProtocolError::Malformed("cipher frame truncated"));
    }
    let seq = u64::from_be_bytes(body[..8].try_into().expect("slice length checked"));
    let mut nonce = [0u8; NONCE_LEN];
    nonce.copy_from_slice(&body[8..8 + NONCE_LEN]);
    let tail = body.len() - MAC_LEN;
    let ciphertext = body[8 + NONCE_LEN..tail].to_vec();
    let mut mac = [0u8; MAC_LEN];
    mac.copy_from_slice(&body[tail..]);
    Ok(Record::Cipher(CipherFrame {
        seq,
        nonce,
        ciphertext,
        mac,
    }))
}

fn decode_rekey(body: &[u8]) -> ProtocolResult<Record> {
    let Some((&phase, rest)) = body.split_first() else {
        return Err(ProtocolError::Malformed("rekey missing phase byte"));
    };
    let phase = match phase {
        rekey_phase::INIT => RekeyPhase::Init {
            public_key: fixed::<PUBLIC_KEY_LEN>(rest, "rekey init key")?,
        },
        rekey_phase::RESPONSE => {
            if rest.len() < PUBLIC_KEY_LEN {
                return Err(ProtocolError::Malformed("rekey response truncated"));
            }
            let mut public_key = [0u8; PUBLIC_KEY_LEN];
            public_key.copy_from_slice(&rest[..PUBLIC_KEY_LEN]);
            RekeyPhase::Response {
                public_key,
                contribution: decode_contribution(&rest[PUBLIC_KEY_LEN..])?,
            }
        },
        rekey_phase::CONFIRM => RekeyPhase::Confirm {
            mac: fixed::<MAC_LEN>(rest, "rekey confirm mac")?,
        },
        _ => return Err(ProtocolError::Malformed("unknown rekey phase")),
    };
    Ok(Record::Rekey(phase))
}

fn fixed<const N: usize>(body: &[u8], what: &'static str) -> ProtocolResult<[u8; N]> {
    let arr: [u8; N] = body
        .try_into()
        .map_err(|_| ProtocolError::Malformed(what))?;
    Ok(arr)
}
