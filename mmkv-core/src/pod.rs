// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Framing for `POD`-typed objects (spec.md section 3: "HLL / POD:
//! typed-payload strings (value byte buffer begins with a small type
//! header)").
//!
//! The original project lets callers register a destructor for arbitrary
//! typed payloads at runtime. Here the set of payload kinds is closed at
//! compile time instead (spec.md section 9's "POD registration" open
//! question, resolved in DESIGN.md): a `POD` object's bytes always start
//! with one of the headers below, and this module only frames/unframes
//! that header. It never encodes or decodes the payload body itself --
//! HyperLogLog register manipulation and any other schema's bytes are an
//! external collaborator's concern, same as command bodies.

use crate::error::{Error, Result};

const HLL_MAGIC: u8 = 1;
const OPAQUE_MAGIC: u8 = 2;

/// Header byte count common to every schema: a 1-byte magic plus a 4-byte
/// schema-specific field.
pub const HEADER_LEN: usize = 5;

/// The closed set of payload kinds a `POD` object's header can describe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodSchema {
    /// A HyperLogLog register array of `register_bytes` bytes follows the
    /// header. Register layout/merge semantics are out of scope here.
    HyperLogLog { register_bytes: u32 },
    /// An opaque, caller-defined payload tagged with a 32-bit `tag` so a
    /// command layer can distinguish its own extension schemas.
    Opaque { tag: u32 },
}

impl PodSchema {
    fn magic(&self) -> u8 {
        match self {
            PodSchema::HyperLogLog { .. } => HLL_MAGIC,
            PodSchema::Opaque { .. } => OPAQUE_MAGIC,
        }
    }

    fn field(&self) -> u32 {
        match *self {
            PodSchema::HyperLogLog { register_bytes } => register_bytes,
            PodSchema::Opaque { tag } => tag,
        }
    }

    /// Encodes this schema's header. The caller appends the payload body
    /// immediately after.
    pub fn encode_header(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0] = self.magic();
        buf[1..5].copy_from_slice(&self.field().to_ne_bytes());
        buf
    }

    /// Reads the header off the front of `bytes`, returning the schema and
    /// the remaining payload slice.
    pub fn decode(bytes: &[u8]) -> Result<(Self, &[u8])> {
        if bytes.len() < HEADER_LEN {
            return Err(Error::Corrupt("pod payload shorter than its header".into()));
        }
        let field = u32::from_ne_bytes(bytes[1..5].try_into().unwrap());
        let schema = match bytes[0] {
            HLL_MAGIC => PodSchema::HyperLogLog { register_bytes: field },
            OPAQUE_MAGIC => PodSchema::Opaque { tag: field },
            other => return Err(Error::Corrupt(format!("unknown pod schema magic {other}"))),
        };
        Ok((schema, &bytes[HEADER_LEN..]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hyperloglog_header_round_trips() {
        let schema = PodSchema::HyperLogLog { register_bytes: 16384 };
        let mut bytes = schema.encode_header().to_vec();
        bytes.extend_from_slice(&[0u8; 4]);
        let (decoded, payload) = PodSchema::decode(&bytes).unwrap();
        assert_eq!(decoded, schema);
        assert_eq!(payload, &[0u8; 4]);
    }

    #[test]
    fn opaque_header_round_trips() {
        let schema = PodSchema::Opaque { tag: 7 };
        let bytes = schema.encode_header();
        let (decoded, payload) = PodSchema::decode(&bytes).unwrap();
        assert_eq!(decoded, schema);
        assert!(payload.is_empty());
    }

    #[test]
    fn unknown_magic_is_reported_as_corrupt() {
        let mut bytes = [0u8; HEADER_LEN];
        bytes[0] = 99;
        assert!(PodSchema::decode(&bytes).is_err());
    }

    #[test]
    fn truncated_header_is_reported_as_corrupt() {
        assert!(PodSchema::decode(&[1, 2, 3]).is_err());
    }
}
