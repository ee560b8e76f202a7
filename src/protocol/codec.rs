use anyhow::{Context, Result, bail};
use flate2::Compression;
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use std::io::{Read, Write};

use super::messages::Message;
use crate::security::Keyring;

/// Estimated per-part envelope cost inside a compound packet, reserved when
/// budgeting piggybacked broadcasts.
pub const COMPOUND_OVERHEAD: usize = 8;

/// Upper bound on an inflated payload; anything larger is treated as a
/// malformed (or hostile) packet.
const MAX_INFLATED_LEN: u64 = 8 * 1024 * 1024;

pub fn encode(msg: &Message) -> Result<Vec<u8>> {
    bincode::serialize(msg).context("failed to encode message")
}

pub fn decode(buf: &[u8]) -> Result<Message> {
    bincode::deserialize(buf).context("failed to decode message")
}

fn deflate(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

fn inflate(data: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    DeflateDecoder::new(data)
        .take(MAX_INFLATED_LEN)
        .read_to_end(&mut out)
        .context("failed to inflate payload")?;
    Ok(out)
}

/// Applies (and strips) the compression and encryption envelopes around a
/// message according to the local security policy.
#[derive(Clone, Default)]
pub struct PacketCodec {
    pub compress: bool,
    pub keyring: Option<Keyring>,
    pub verify_incoming: bool,
    pub verify_outgoing: bool,
}

impl PacketCodec {
    fn encrypts(&self) -> bool {
        self.verify_outgoing
            && self.keyring.as_ref().map(|r| !r.is_empty()).unwrap_or(false)
    }

    fn has_keys(&self) -> bool {
        self.keyring.as_ref().map(|r| !r.is_empty()).unwrap_or(false)
    }

    /// Serializes a message for the wire, compressing and encrypting as
    /// configured.
    pub fn seal(&self, msg: &Message) -> Result<Vec<u8>> {
        let mut buf = encode(msg)?;
        if self.compress {
            buf = encode(&Message::Compressed(deflate(&buf)?))?;
        }
        if self.encrypts() {
            let ring = self.keyring.as_ref().expect("checked by encrypts()");
            buf = encode(&Message::Encrypted(ring.encrypt(&buf)?))?;
        }
        Ok(buf)
    }

    /// Parses a wire payload, undoing the envelopes. Enforces the incoming
    /// verification policy: encrypted payloads need a matching key, and when
    /// `verify_incoming` is set plaintext packets are rejected outright.
    pub fn open(&self, buf: &[u8]) -> Result<Message> {
        let msg = match decode(buf)? {
            Message::Encrypted(data) => {
                let Some(ring) = self.keyring.as_ref().filter(|r| !r.is_empty()) else {
                    bail!("received encrypted packet but no keys are installed");
                };
                decode(&ring.decrypt(&data)?)?
            }
            plain => {
                if self.has_keys() && self.verify_incoming {
                    bail!("rejected unencrypted packet (verify_incoming is set)");
                }
                plain
            }
        };

        let msg = match msg {
            Message::Compressed(data) => decode(&inflate(&data)?)?,
            other => other,
        };

        // A well-formed sender never nests envelopes any deeper.
        if matches!(msg, Message::Encrypted(_) | Message::Compressed(_)) {
            bail!("unexpected nested {} envelope", msg.kind());
        }
        Ok(msg)
    }
}

/// Bundles an already-encoded primary message with piggybacked broadcast
/// payloads into a compound message. Returns `None` when there is nothing to
/// piggyback, so the common case stays a plain single message on the wire.
pub fn with_piggyback(primary: Vec<u8>, piggyback: Vec<Vec<u8>>) -> Option<Message> {
    if piggyback.is_empty() {
        return None;
    }
    let mut parts = Vec::with_capacity(1 + piggyback.len());
    parts.push(primary);
    parts.extend(piggyback);
    Some(Message::Compound(parts))
}
