// Copyright (c) Facebook, Inc. and its affiliates.
//
// This source code is licensed under the MIT license found in the
// LICENSE file in the root directory of this source tree.

//! Request/result shapes for `Wait`. Each request names an object and
//! whether a local-only or local-or-remote sighting satisfies it; each
//! result is tagged the way a per-request result is tagged in a
//! multi-peer protocol reply (`Local`/`Remote`/`Nonexistent` instead of an
//! untyped status byte), grounded in the same "one tag per item" idiom.

use crate::errors::TransportError;
use crate::object_id::ObjectId;
use crate::protocol::{read_object_id, read_u8, write_object_id, write_u8};
use std::io::{Read, Write};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitQuery {
    /// Satisfied only by the local store.
    Local,
    /// Satisfied by either the local store or a manager-known remote copy.
    Anywhere,
}

impl WaitQuery {
    fn tag(self) -> u8 {
        match self {
            WaitQuery::Local => 0,
            WaitQuery::Anywhere => 1,
        }
    }

    fn from_tag(tag: u8) -> Result<Self, TransportError> {
        match tag {
            0 => Ok(WaitQuery::Local),
            1 => Ok(WaitQuery::Anywhere),
            _ => Err(TransportError::MalformedHeader),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitRequest {
    pub object_id: ObjectId,
    pub query: WaitQuery,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitResult {
    Local,
    Remote,
    Nonexistent,
}

impl WaitResult {
    fn tag(self) -> u8 {
        match self {
            WaitResult::Local => 0,
            WaitResult::Remote => 1,
            WaitResult::Nonexistent => 2,
        }
    }

    fn from_tag(tag: u8) -> Result<Self, TransportError> {
        match tag {
            0 => Ok(WaitResult::Local),
            1 => Ok(WaitResult::Remote),
            2 => Ok(WaitResult::Nonexistent),
            _ => Err(TransportError::MalformedHeader),
        }
    }
}

pub fn write_wait_requests(w: &mut impl Write, requests: &[WaitRequest]) -> std::io::Result<()> {
    crate::protocol::write_u16_le(w, requests.len() as u16)?;
    for req in requests {
        write_object_id(w, &req.object_id)?;
        write_u8(w, req.query.tag())?;
    }
    Ok(())
}

pub fn read_wait_requests(r: &mut impl Read) -> Result<Vec<WaitRequest>, TransportError> {
    let count = crate::protocol::read_u16_le(r).map_err(TransportError::Io)?;
    let mut requests = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let object_id = read_object_id(r).map_err(TransportError::Io)?;
        let query = WaitQuery::from_tag(read_u8(r).map_err(TransportError::Io)?)?;
        requests.push(WaitRequest { object_id, query });
    }
    Ok(requests)
}

pub fn write_wait_results(w: &mut impl Write, results: &[WaitResult]) -> std::io::Result<()> {
    crate::protocol::write_u16_le(w, results.len() as u16)?;
    for result in results {
        write_u8(w, result.tag())?;
    }
    Ok(())
}

pub fn read_wait_results(r: &mut impl Read) -> Result<Vec<WaitResult>, TransportError> {
    let count = crate::protocol::read_u16_le(r).map_err(TransportError::Io)?;
    let mut results = Vec::with_capacity(count as usize);
    for _ in 0..count {
        results.push(WaitResult::from_tag(read_u8(r).map_err(TransportError::Io)?)?);
    }
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_requests_round_trip() {
        let requests = vec![
            WaitRequest {
                object_id: ObjectId::rand(),
                query: WaitQuery::Local,
            },
            WaitRequest {
                object_id: ObjectId::rand(),
                query: WaitQuery::Anywhere,
            },
        ];
        let mut buf = Vec::new();
        write_wait_requests(&mut buf, &requests).unwrap();
        let mut cursor = std::io::Cursor::new(buf);
        let decoded = read_wait_requests(&mut cursor).unwrap();
        assert_eq!(requests, decoded);
    }

    #[test]
    fn wait_results_round_trip() {
        let results = vec![WaitResult::Local, WaitResult::Remote, WaitResult::Nonexistent];
        let mut buf = Vec::new();
        write_wait_results(&mut buf, &results).unwrap();
        let mut cursor = std::io::Cursor::new(buf);
        let decoded = read_wait_results(&mut cursor).unwrap();
        assert_eq!(results, decoded);
    }
}
