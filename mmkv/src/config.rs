// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The `OpenOptions`/`CreateOptions` pair from `original_source/src/mmkv_options.hpp`,
//! carried over field-for-field and with the same defaults, plus the
//! logging knobs spec.md section 6 names alongside them.

use crate::log::LogConfig;
use std::path::PathBuf;

/// Sizing knobs for a segment created for the first time. Mirrors the
/// upstream project's `CreateOptions`; has no effect when attaching to an
/// already-initialized segment.
#[derive(Debug, Clone)]
pub struct CreateOptions {
    /// Total segment size in bytes, split between the two arenas by
    /// `keyspace_factor`.
    pub size: u64,
    /// Fraction of `size` given to the key arena; the remainder goes to the
    /// value arena.
    pub keyspace_factor: f32,
    /// Whether the value arena grows itself (by `ensure_space_size`) on
    /// exhaustion instead of returning [`mmkv_core::Error::OutOfSpace`].
    pub autoexpand: bool,
    /// Bytes added to the value arena per autoexpand step.
    pub ensure_space_size: u64,
}

impl Default for CreateOptions {
    fn default() -> Self {
        CreateOptions {
            size: 1024 * 1024 * 1024,
            keyspace_factor: 0.25,
            autoexpand: false,
            ensure_space_size: 512 * 1024 * 1024,
        }
    }
}

impl CreateOptions {
    pub(crate) fn to_core(&self) -> mmkv_core::CreateOptions {
        let key_arena_size = ((self.size as f64) * (self.keyspace_factor as f64)) as u64;
        let value_arena_size = self.size.saturating_sub(key_arena_size);
        mmkv_core::CreateOptions {
            key_arena_size: key_arena_size.max(1),
            value_arena_size: value_arena_size.max(1),
            mode: 0o600,
        }
    }
}

/// Open-time configuration, mirroring the upstream `OpenOptions` plus the
/// ambient logging surface.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory the segment (and its directory-wide init lock) lives in.
    pub dir: PathBuf,
    /// Opens the segment for reads only; every mutating `Store` method
    /// returns [`mmkv_core::Error::PermissionDenied`] without touching the
    /// mapping.
    pub readonly: bool,
    /// Creates a fresh segment under `dir` if one does not already exist.
    pub create_if_notexist: bool,
    pub create_options: CreateOptions,
    /// Disables the process-shared reader-writer lock for single-process
    /// embedding; every `Store` operation then runs unsynchronized.
    pub use_lock: bool,
    /// `mlock`s the key arena's backing pages after open.
    pub reserve_keyspace: bool,
    /// `mlock`s the value arena's backing pages after open.
    pub reserve_valuespace: bool,
    /// Runs [`mmkv_core::db::verify_all`] on open and logs any damage found.
    pub verify: bool,
    pub log: LogConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            dir: PathBuf::from("./mmkv"),
            readonly: false,
            create_if_notexist: false,
            create_options: CreateOptions::default(),
            use_lock: false,
            reserve_keyspace: false,
            reserve_valuespace: false,
            verify: true,
            log: LogConfig::default(),
        }
    }
}
