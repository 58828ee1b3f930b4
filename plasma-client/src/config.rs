// Copyright (c) Facebook, Inc. and its affiliates.
//
// This source code is licensed under the MIT license found in the
// LICENSE file in the root directory of this source tree.

//! Connection-time configuration. The client owns no environment variables,
//! CLI parsing, or on-disk state — everything flows through this struct and
//! the `Connect` call.

use crate::release_history::default_release_byte_threshold;

/// Options governing one `Connect` call. Fixed for the lifetime of the
/// resulting client.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub store_socket_name: String,
    pub manager_socket_name: Option<String>,
    pub release_delay: usize,
    pub num_retries: u32,
    /// Overrides the derived `store_capacity / L3_RATIO` byte threshold;
    /// `None` computes it from the capacity reported by the store at
    /// connect time.
    pub release_byte_threshold_override: Option<u64>,
    pub max_frame_len: u64,
}

impl ConnectOptions {
    pub fn new(store_socket_name: impl Into<String>) -> Self {
        ConnectOptions {
            store_socket_name: store_socket_name.into(),
            manager_socket_name: None,
            release_delay: 64,
            num_retries: 50,
            release_byte_threshold_override: None,
            max_frame_len: crate::protocol::DEFAULT_MAX_FRAME_LEN,
        }
    }

    pub fn with_manager(mut self, manager_socket_name: impl Into<String>) -> Self {
        self.manager_socket_name = Some(manager_socket_name.into());
        self
    }

    pub fn with_release_delay(mut self, release_delay: usize) -> Self {
        self.release_delay = release_delay;
        self
    }

    pub fn with_num_retries(mut self, num_retries: u32) -> Self {
        self.num_retries = num_retries;
        self
    }

    pub fn with_release_byte_threshold(mut self, threshold: u64) -> Self {
        self.release_byte_threshold_override = Some(threshold);
        self
    }
}

/// Client-internal configuration, fixed at Connect time, derived from
/// [`ConnectOptions`] and the store's reported capacity.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub release_delay: usize,
    pub release_byte_threshold: u64,
    pub max_frame_len: u64,
}

impl ClientConfig {
    pub fn from_options(options: &ConnectOptions, store_capacity: u64) -> Self {
        let release_byte_threshold = options
            .release_byte_threshold_override
            .unwrap_or_else(|| default_release_byte_threshold(store_capacity));
        ClientConfig {
            release_delay: options.release_delay,
            release_byte_threshold,
            max_frame_len: options.max_frame_len,
        }
    }
}
