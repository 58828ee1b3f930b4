// Copyright (c) Facebook, Inc. and its affiliates.
//
// This source code is licensed under the MIT license found in the
// LICENSE file in the root directory of this source tree.

use rand::Rng;
use std::fmt::{self, Debug, Display, Formatter};

/// Object IDs are caller-assigned, opaque, 20-byte identifiers; there is no
/// global namespace beyond byte equality.
pub const OBJECT_ID_BYTES: usize = 20;

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectId([u8; OBJECT_ID_BYTES]);

impl ObjectId {
    /// Returns a new object ID instantiated from the specified bytes.
    pub fn new(bytes: [u8; OBJECT_ID_BYTES]) -> Self {
        ObjectId(bytes)
    }

    /// Returns a new object ID instantiated from a random sequence of bytes.
    pub fn rand() -> Self {
        ObjectId(rand::thread_rng().gen())
    }

    /// Returns the binary representation of the object ID.
    pub fn to_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Returns the hexadecimal representation of the object ID.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parses an object ID from a hex string; used by the CLI and tests.
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let mut bytes = [0u8; OBJECT_ID_BYTES];
        hex::decode_to_slice(s, &mut bytes)?;
        Ok(ObjectId(bytes))
    }
}

impl Debug for ObjectId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl Display for ObjectId {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}
