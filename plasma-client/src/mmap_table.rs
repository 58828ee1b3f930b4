// Copyright (c) Facebook, Inc. and its affiliates.
//
// This source code is licensed under the MIT license found in the
// LICENSE file in the root directory of this source tree.

//! Per-process table of memory-mapped regions shared with the store, keyed
//! by the store's stable file-descriptor identifier. Owns the address-space
//! region: unmaps exactly when the last referencing in-use entry is gone,
//! never early (callers holding aliased buffers would crash) and never late
//! (would exhaust address space).

use std::collections::HashMap;
use std::os::unix::io::RawFd;

struct MmapEntry {
    base: *mut u8,
    length: usize,
    active_count: u32,
    writable: bool,
}

// The mapped region is process-private address space, not a Rust reference;
// nothing else in the process can invalidate it behind the table's back as
// long as `active_count` bookkeeping is correct. The client is single-
// threaded per spec, so this is never raced.
unsafe impl Send for MmapEntry {}

pub struct MmapTable {
    entries: HashMap<u64, MmapEntry>,
}

impl MmapTable {
    pub fn new() -> Self {
        MmapTable {
            entries: HashMap::new(),
        }
    }

    /// Returns the base pointer for an already-mapped region, or performs a
    /// fresh `mmap` of `raw_fd` and records it under `store_fd_id` if this
    /// is the first time the client has seen that store-side handle. The OS
    /// descriptor is closed once mapped — only the mapping persists.
    ///
    /// One backing file can hold many objects, so a cache hit can ask for
    /// write access to a region this process first mapped read-only (e.g.
    /// for an earlier `Get` of a different object sharing the file). In
    /// that case the existing mapping's protection is upgraded in place via
    /// `mprotect` rather than handed back unwritable to a caller that is
    /// about to write through it.
    pub fn lookup_or_mmap(
        &mut self,
        store_fd_id: u64,
        raw_fd: RawFd,
        length: usize,
        writable: bool,
    ) -> std::io::Result<*mut u8> {
        if let Some(entry) = self.entries.get_mut(&store_fd_id) {
            if writable && !entry.writable {
                let rc = unsafe {
                    libc::mprotect(
                        entry.base as *mut libc::c_void,
                        entry.length,
                        libc::PROT_READ | libc::PROT_WRITE,
                    )
                };
                if rc != 0 {
                    return Err(std::io::Error::last_os_error());
                }
                entry.writable = true;
            }
            return Ok(entry.base);
        }

        let prot = if writable {
            libc::PROT_READ | libc::PROT_WRITE
        } else {
            libc::PROT_READ
        };
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                length,
                prot,
                libc::MAP_SHARED,
                raw_fd,
                0,
            )
        };
        let close_result = unsafe { libc::close(raw_fd) };
        if ptr == libc::MAP_FAILED {
            return Err(std::io::Error::last_os_error());
        }
        if close_result != 0 {
            // The mapping itself is already valid; a failure to close the
            // now-redundant fd does not affect correctness, only leaks one
            // descriptor, so it is not treated as fatal.
            tracing::debug!(store_fd_id, "failed to close mmap source fd after mapping");
        }

        self.entries.insert(
            store_fd_id,
            MmapEntry {
                base: ptr as *mut u8,
                length,
                active_count: 0,
                writable,
            },
        );
        Ok(ptr as *mut u8)
    }

    /// Returns the base pointer of an already-mapped region, if any, without
    /// touching its reference count.
    pub fn base_ptr(&self, store_fd_id: u64) -> Option<*mut u8> {
        self.entries.get(&store_fd_id).map(|e| e.base)
    }

    /// Increments the reference count for the mapping that backs
    /// `store_fd_id`. The entry must already exist (callers always mmap
    /// before incrementing).
    pub fn increment(&mut self, store_fd_id: u64) {
        let entry = self
            .entries
            .get_mut(&store_fd_id)
            .expect("mmap entry must exist before increment: in-use table is corrupt");
        entry.active_count += 1;
    }

    /// Decrements the reference count, unmapping and removing the entry
    /// when it reaches zero. Decrementing below zero is a fatal invariant
    /// violation: it means the in-use table and mmap table have diverged.
    pub fn decrement(&mut self, store_fd_id: u64) {
        let should_remove = {
            let entry = self
                .entries
                .get_mut(&store_fd_id)
                .expect("mmap entry must exist before decrement: in-use table is corrupt");
            if entry.active_count == 0 {
                panic!(
                    "mmap entry active_count underflow for store_fd_id {}: invariant violation",
                    store_fd_id
                );
            }
            entry.active_count -= 1;
            entry.active_count == 0
        };
        if should_remove {
            let entry = self.entries.remove(&store_fd_id).unwrap();
            unsafe {
                libc::munmap(entry.base as *mut libc::c_void, entry.length);
            }
        }
    }

    #[cfg(test)]
    pub fn active_count(&self, store_fd_id: u64) -> Option<u32> {
        self.entries.get(&store_fd_id).map(|e| e.active_count)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

impl Default for MmapTable {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MmapTable {
    fn drop(&mut self) {
        for (_, entry) in self.entries.drain() {
            unsafe {
                libc::munmap(entry.base as *mut libc::c_void, entry.length);
            }
        }
    }
}
