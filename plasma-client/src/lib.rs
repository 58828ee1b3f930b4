// Copyright (c) Facebook, Inc. and its affiliates.
//
// This source code is licensed under the MIT license found in the
// LICENSE file in the root directory of this source tree.

//! A Rust-native client for the Plasma shared-memory object store. The
//! client speaks the store's Unix-domain-socket wire protocol directly
//! (framing, `SCM_RIGHTS` descriptor passing, `mmap`) rather than wrapping
//! the C++ reference implementation.
//!
//! A single [`PlasmaClient`] instance is single-threaded: it takes no
//! internal locks, so callers must serialize their own calls to it (e.g.
//! behind a mutex) if shared across threads.

pub mod buffer;
pub mod client;
pub mod config;
pub mod errors;
pub mod inuse_table;
pub mod lifecycle;
pub mod mmap_table;
pub mod notification;
pub mod object_id;
pub mod protocol;
pub mod release_history;
pub mod transport;
pub mod wait;

pub use buffer::{CreateBuffer, DeviceBuffer, ObjectBuffer};
pub use client::{ObjectInfo, PlasmaClient};
pub use config::{ClientConfig, ConnectOptions};
pub use errors::{PlasmaError, Result, TransportError};
pub use lifecycle::ObjectState;
pub use notification::Notification;
pub use object_id::ObjectId;
pub use transport::NotificationChannel;
pub use wait::{WaitQuery, WaitRequest, WaitResult};
