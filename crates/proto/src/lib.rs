//! Wire-level primitives for the Minecraft line protocol: framing and
//! compression codec, the AES/CFB8 channel cipher, the RSA key broker used
//! to re-originate the login handshake, and the packet registry.
//!
//! This crate is transport-agnostic; the gateway crate owns sockets and the
//! session state machine.

pub mod cipher;
pub mod codec;
pub mod error;
pub mod keys;
pub mod packet;

pub use error::{ProtoError, Result};
