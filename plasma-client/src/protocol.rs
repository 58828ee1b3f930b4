// Copyright (c) Facebook, Inc. and its affiliates.
//
// This source code is licensed under the MIT license found in the
// LICENSE file in the root directory of this source tree.

//! Wire codec for the store and manager sockets: a fixed `{type, length}`
//! header followed by a fixed payload per message type, plus the helpers for
//! reading/writing the length-prefixed object-ID lists that several payloads
//! embed. Mirrors the framing idiom of a request/reply stream protocol, but
//! synchronous (single outstanding call at a time) rather than pipelined.

use crate::errors::TransportError;
use crate::object_id::{ObjectId, OBJECT_ID_BYTES};
use std::io::{self, Read, Write};

/// Default cap on a single frame's payload length; guards against a
/// corrupted or malicious length field causing an unbounded allocation.
pub const DEFAULT_MAX_FRAME_LEN: u64 = 64 * 1024 * 1024;

pub const HEADER_LEN: usize = 4 + 8;

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Connect = 1,
    Create = 2,
    Seal = 3,
    Abort = 4,
    Release = 5,
    Contains = 6,
    Get = 7,
    Delete = 8,
    Evict = 9,
    Subscribe = 10,
    GetDebugString = 11,
    Hash = 12,
    Notification = 13,
    Fetch = 14,
    Wait = 15,
    Transfer = 16,
    Info = 17,
}

impl MessageType {
    pub fn from_u32(v: u32) -> Result<Self, TransportError> {
        use MessageType::*;
        Ok(match v {
            1 => Connect,
            2 => Create,
            3 => Seal,
            4 => Abort,
            5 => Release,
            6 => Contains,
            7 => Get,
            8 => Delete,
            9 => Evict,
            10 => Subscribe,
            11 => GetDebugString,
            12 => Hash,
            13 => Notification,
            14 => Fetch,
            15 => Wait,
            16 => Transfer,
            17 => Info,
            _ => return Err(TransportError::MalformedHeader),
        })
    }
}

/// Store-reported layout descriptor for one object (spec data model
/// `PlasmaObject`). `data_size == -1` is the not-ready/absent sentinel used
/// by `Get` reply slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlasmaObject {
    pub store_fd_id: u64,
    pub map_size: u64,
    pub data_offset: u64,
    pub data_size: i64,
    pub metadata_offset: u64,
    pub metadata_size: i64,
    pub device_num: i32,
}

impl PlasmaObject {
    pub const ABSENT_SENTINEL: i64 = -1;

    pub fn is_absent(&self) -> bool {
        self.data_size == Self::ABSENT_SENTINEL
    }

    pub fn total_len(&self) -> usize {
        self.data_size.max(0) as usize + self.metadata_size.max(0) as usize
    }
}

/// Single-byte status codes carried at the front of reply payloads that can
/// fail in more than one way (`Create`, `Seal`, `Delete`, ...).
pub mod status {
    pub const OK: u8 = 0;
    pub const ALREADY_EXISTS: u8 = 1;
    pub const OUT_OF_MEMORY: u8 = 2;
    pub const TRANSIENT_STORE_FULL: u8 = 3;
    pub const NOT_FOUND: u8 = 4;
}

/// A decoded frame: message type, raw payload bytes, and an optional
/// out-of-band file descriptor carried via `SCM_RIGHTS` when the reply hands
/// the client a new mapping.
#[derive(Debug)]
pub struct Frame {
    pub msg_type: MessageType,
    pub payload: Vec<u8>,
}

pub fn write_u8(w: &mut impl Write, v: u8) -> io::Result<()> {
    w.write_all(&[v])
}

pub fn read_u8(r: &mut impl Read) -> io::Result<u8> {
    let mut buf = [0u8; 1];
    r.read_exact(&mut buf)?;
    Ok(buf[0])
}

pub fn write_u16_le(w: &mut impl Write, v: u16) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

pub fn read_u16_le(r: &mut impl Read) -> io::Result<u16> {
    let mut buf = [0u8; 2];
    r.read_exact(&mut buf)?;
    Ok(u16::from_le_bytes(buf))
}

pub fn write_u32_le(w: &mut impl Write, v: u32) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

pub fn read_u32_le(r: &mut impl Read) -> io::Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

pub fn write_i32_le(w: &mut impl Write, v: i32) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

pub fn read_i32_le(r: &mut impl Read) -> io::Result<i32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(i32::from_le_bytes(buf))
}

pub fn write_u64_le(w: &mut impl Write, v: u64) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

pub fn read_u64_le(r: &mut impl Read) -> io::Result<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

pub fn write_i64_le(w: &mut impl Write, v: i64) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

pub fn read_i64_le(r: &mut impl Read) -> io::Result<i64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(i64::from_le_bytes(buf))
}

pub fn write_object_id(w: &mut impl Write, id: &ObjectId) -> io::Result<()> {
    w.write_all(id.to_bytes())
}

pub fn read_object_id(r: &mut impl Read) -> io::Result<ObjectId> {
    let mut buf = [0u8; OBJECT_ID_BYTES];
    r.read_exact(&mut buf)?;
    Ok(ObjectId::new(buf))
}

/// Object-ID lists are length-prefixed with a `u16` count, matching the
/// framing the rest of the catalogue uses for bounded-size repeated fields.
pub fn write_object_id_list(w: &mut impl Write, ids: &[ObjectId]) -> io::Result<()> {
    write_u16_le(w, ids.len() as u16)?;
    for id in ids {
        write_object_id(w, id)?;
    }
    Ok(())
}

pub fn read_object_id_list(r: &mut impl Read) -> io::Result<Vec<ObjectId>> {
    let count = read_u16_le(r)?;
    let mut ids = Vec::with_capacity(count as usize);
    for _ in 0..count {
        ids.push(read_object_id(r)?);
    }
    Ok(ids)
}

pub fn write_plasma_object(w: &mut impl Write, obj: &PlasmaObject) -> io::Result<()> {
    write_u64_le(w, obj.store_fd_id)?;
    write_u64_le(w, obj.map_size)?;
    write_u64_le(w, obj.data_offset)?;
    write_i64_le(w, obj.data_size)?;
    write_u64_le(w, obj.metadata_offset)?;
    write_i64_le(w, obj.metadata_size)?;
    write_i32_le(w, obj.device_num)
}

pub fn read_plasma_object(r: &mut impl Read) -> io::Result<PlasmaObject> {
    Ok(PlasmaObject {
        store_fd_id: read_u64_le(r)?,
        map_size: read_u64_le(r)?,
        data_offset: read_u64_le(r)?,
        data_size: read_i64_le(r)?,
        metadata_offset: read_u64_le(r)?,
        metadata_size: read_i64_le(r)?,
        device_num: read_i32_le(r)?,
    })
}

/// Writes a complete `{type, length, payload}` frame.
pub fn write_frame(w: &mut impl Write, msg_type: MessageType, payload: &[u8]) -> io::Result<()> {
    write_u32_le(w, msg_type as u32)?;
    write_u64_le(w, payload.len() as u64)?;
    w.write_all(payload)
}

/// Reads a complete frame, enforcing `max_len` against the declared length
/// before allocating the payload buffer.
pub fn read_frame(r: &mut impl Read, max_len: u64) -> Result<Frame, TransportError> {
    let raw_type = read_u32_le(r).map_err(TransportError::Io)?;
    let msg_type = MessageType::from_u32(raw_type)?;
    let len = read_u64_le(r).map_err(TransportError::Io)?;
    if len > max_len {
        return Err(TransportError::LengthExceedsCap(len, max_len));
    }
    let mut payload = vec![0u8; len as usize];
    r.read_exact(&mut payload)
        .map_err(|e| match e.kind() {
            io::ErrorKind::UnexpectedEof => TransportError::ShortRead {
                expected: len as usize,
                actual: 0,
            },
            _ => TransportError::Io(e),
        })?;
    Ok(Frame { msg_type, payload })
}
