// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]

//! Core of an embeddable, multi-process mmap-backed key-value store.
//!
//! The entire store lives in one memory-mapped file, attached by possibly
//! many OS processes, synchronized by a single process-shared
//! reader-writer lock ([`lock`]). A command handler acquires that lock,
//! resolves a database's key table ([`db`]) to an [`object::Object`], and
//! either reads an inline scalar or follows an offset pointer into a
//! collection ([`collections`]) rooted in one of two arenas managed by
//! [`alloc`]. [`snapshot`] compresses the live region into a portable,
//! restorable file.
//!
//! This crate implements the data structures and the locking/allocation
//! substrate they run on; it does not implement a command protocol or
//! wire format for talking to a remote process -- callers embed it
//! in-process, the way the `mmkv` facade crate does.

pub mod alloc;
pub mod collections;
pub mod db;
pub mod error;
pub mod lock;
pub mod mapping;
pub mod object;
pub mod offset;
pub mod pod;
pub mod snapshot;
pub mod ttl;

pub use error::{Error, Result};
pub use mapping::{CreateOptions, Mapping};
