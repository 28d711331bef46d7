// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]

//! Embeddable facade over `mmkv-core`.
//!
//! `mmkv-core` implements the mapping, lock, allocator, object model and
//! collections; this crate is the part an application actually links
//! against: [`Config`] mirrors the original project's `OpenOptions`, a
//! [`Store`] owns one open segment and resolves the process-shared lock
//! and autoexpand policy around every database operation, and [`log`]
//! wires `mmkv-core`'s `tracing` events to either stderr or a
//! caller-supplied callback.
//!
//! This crate does not implement a command protocol, wire format, or
//! per-command glue for a remote client -- those are explicitly out of
//! scope; it only provides the generic `lookup`/`get_or_create_typed`/
//! `remove`/`rename`/`dbsize`/`flush_db`/`flush_all` surface that a
//! protocol layer would sit on top of.

mod config;
mod log;
mod store;

pub use config::{Config, CreateOptions};
pub use log::{LogCallback, LogConfig, LogLevel};
pub use store::Store;

pub use mmkv_core::db::Damage;
pub use mmkv_core::object::{Object, ObjectType};
pub use mmkv_core::{Error, Result};
