//! Wire Protocol
//!
//! Message definitions and the packet codec. The gossip wire is
//! bincode-serialized [`messages::Message`] values, optionally wrapped in
//! envelopes: `Compound` bundles piggybacked gossip with probe traffic under
//! the packet size limit, `Compressed` deflates a payload, and `Encrypted`
//! carries an AES-GCM sealed payload. Envelope nesting on the wire is always
//! `Encrypted(Compressed(Compound(...)))`, outermost first.
//!
//! All parsing is defensive: malformed, undecryptable or
//! version-incompatible input is reported as an error to be dropped and
//! logged by the caller, never a panic.

pub mod codec;
pub mod messages;
