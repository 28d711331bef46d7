// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The error taxonomy from spec.md section 6. Every fallible public entry
//! point returns `Result<T, Error>`; invariant violations that indicate
//! corruption (a sorted set's two indexes disagreeing, a free list cycle)
//! are programmer errors and `panic!`/`unreachable!` instead, per the
//! propagation policy.

use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("key not found")]
    NotExist,

    #[error("value is not the requested type")]
    WrongType,

    #[error("object already exists")]
    AlreadyExists,

    #[error("operation not permitted in readonly mode")]
    PermissionDenied,

    #[error("both arenas are exhausted")]
    OutOfSpace,

    #[error("value is out of range")]
    OutOfRange,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("value is not a number")]
    NotNumber,

    #[error("value is not an integer")]
    NotInteger,

    #[error("range is invalid")]
    InvalidRange,

    #[error("mapping is corrupt: {0}")]
    Corrupt(String),

    #[error("snapshot failed: {0}")]
    SnapshotFailed(#[source] io::Error),

    #[error("restore failed: {0}")]
    RestoreFailed(#[source] io::Error),

    #[error("lock is broken (writer pid no longer exists)")]
    LockBroken,

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
