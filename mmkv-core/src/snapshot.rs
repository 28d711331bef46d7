// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Snapshot & restore (spec.md section 4.8 / 6): compress the live prefix
//! of both arenas into a portable directory, and invert that back into a
//! fresh data file whose live prefix is byte-identical to the source.
//!
//! Grounded in the original implementation's `Backup`/`Restore` (see
//! `original_source/src/memory.cpp`): a magic/version header, a
//! length-prefixed Meta and Header, then one LZ4 block-framed stream per
//! arena, each block self-describing its original and compressed length
//! and the stream terminated by a zero-length block. A sidecar checksum
//! file holds the hex concatenation of an XXH64 and an XXH32 digest taken
//! over the same bytes in the same order, incrementally, the way the
//! original's `xxhash_cksum_callback` folds every chunk into one running
//! hash rather than hashing the compressed file as a whole.

use crate::alloc::{Allocator, ArenaKind};
use crate::error::{Error, Result};
use crate::mapping::{CreateOptions, Mapping};
use std::fs;
use std::io::{Read, Write};
use std::path::Path;
use tracing::{debug, info};
use xxhash_rust::xxh32::Xxh32;
use xxhash_rust::xxh64::Xxh64;

const MAGIC: u32 = 0xCD_007B;
const VERSION: u32 = 1;

/// Arena bytes are compressed in chunks rather than as one LZ4 block, so a
/// multi-gigabyte arena never needs a single contiguous compression buffer
/// the size of the whole live region.
const CHUNK_SIZE: usize = 4 << 20;

const SNAPSHOT_FILE_NAME: &str = "snapshot.bin";
const CHECKSUM_FILE_NAME: &str = "xxhash.cksm";

/// A running pair of XXH64/XXH32 hashers folded over bytes in the exact
/// order they appear in the snapshot's uncompressed payload.
struct Checksum {
    xxh64: Xxh64,
    xxh32: Xxh32,
}

impl Checksum {
    fn new() -> Self {
        Checksum { xxh64: Xxh64::new(0), xxh32: Xxh32::new(0) }
    }

    fn update(&mut self, bytes: &[u8]) {
        self.xxh64.update(bytes);
        self.xxh32.update(bytes);
    }

    /// Hex concatenation of the 64-bit digest then the 32-bit digest,
    /// matching spec.md section 6's sidecar format.
    fn to_hex(&self) -> String {
        format!("{:016x}{:08x}", self.xxh64.digest(), self.xxh32.digest())
    }
}

/// Snapshots `mapping`'s live state into `dest_dir`, which is created if it
/// does not already exist. Takes the read lock for the duration of the
/// walk -- this blocks all writers, per spec.md section 5's note that a
/// snapshot is one of the "long operations" that hold the critical section
/// for its whole duration.
pub fn backup(mapping: &Mapping, alloc: &Allocator, dest_dir: impl AsRef<Path>) -> Result<()> {
    let dest_dir = dest_dir.as_ref();
    mapping.lock().lock_read();
    let result = backup_locked(mapping, alloc, dest_dir);
    mapping.lock().unlock_read();
    result
}

fn backup_locked(mapping: &Mapping, alloc: &Allocator, dest_dir: &Path) -> Result<()> {
    fs::create_dir_all(dest_dir).map_err(Error::SnapshotFailed)?;
    info!(dest = %dest_dir.display(), "writing mmkv snapshot");

    let mut checksum = Checksum::new();
    let mut out = fs::File::create(dest_dir.join(SNAPSHOT_FILE_NAME)).map_err(Error::SnapshotFailed)?;

    write_u32(&mut out, MAGIC)?;
    write_u32(&mut out, VERSION)?;

    let meta_bytes = mapping.meta_bytes();
    write_u16(&mut out, meta_bytes.len() as u16)?;
    out.write_all(meta_bytes).map_err(Error::SnapshotFailed)?;
    checksum.update(meta_bytes);

    let header_bytes = mapping.header_bytes();
    write_u32(&mut out, header_bytes.len() as u32)?;
    out.write_all(header_bytes).map_err(Error::SnapshotFailed)?;
    checksum.update(header_bytes);

    // SAFETY: the read lock excludes any writer from mutating either
    // arena's bump frontier or live bytes for the duration of this walk.
    let key_bytes = unsafe { alloc.key_arena().as_bytes() };
    write_arena_blocks(&mut out, key_bytes, &mut checksum)?;

    let value_bytes = unsafe { alloc.value_arena().as_bytes() };
    write_arena_blocks(&mut out, value_bytes, &mut checksum)?;

    out.flush().map_err(Error::SnapshotFailed)?;

    fs::write(dest_dir.join(CHECKSUM_FILE_NAME), checksum.to_hex()).map_err(Error::SnapshotFailed)?;
    debug!(key_bytes = key_bytes.len(), value_bytes = value_bytes.len(), "snapshot complete");
    Ok(())
}

fn write_arena_blocks(out: &mut fs::File, bytes: &[u8], checksum: &mut Checksum) -> Result<()> {
    for chunk in bytes.chunks(CHUNK_SIZE) {
        checksum.update(chunk);
        let compressed = lz4_flex::block::compress(chunk);
        write_u32(out, chunk.len() as u32)?;
        write_u32(out, compressed.len() as u32)?;
        out.write_all(&compressed).map_err(Error::SnapshotFailed)?;
    }
    // Terminator: an `orig_len` of zero closes the block stream even when
    // the arena's live prefix is empty.
    write_u32(out, 0)
}

/// Restores a snapshot written by [`backup`] from `from_dir` into a fresh
/// segment directory at `to_path`. `to_path` must not already exist:
/// restore always creates a new `data`/`locks` pair sized to reproduce the
/// source's exact arena layout, rather than overwrite one in place. The
/// restored segment gets a brand new `locks` file -- the source's lock
/// state is never part of the snapshot (see `mapping`'s module docs).
pub fn restore(from_dir: impl AsRef<Path>, to_path: impl AsRef<Path>) -> Result<Mapping> {
    let from_dir = from_dir.as_ref();
    let to_path = to_path.as_ref();
    info!(src = %from_dir.display(), dest = %to_path.display(), "restoring mmkv snapshot");

    let mut input = fs::File::open(from_dir.join(SNAPSHOT_FILE_NAME)).map_err(Error::RestoreFailed)?;
    let mut checksum = Checksum::new();

    let magic = read_u32(&mut input)?;
    if magic != MAGIC {
        return Err(Error::Corrupt("snapshot magic mismatch".into()));
    }
    let version = read_u32(&mut input)?;
    if version != VERSION {
        return Err(Error::Corrupt(format!("unsupported snapshot format version {version}")));
    }

    let meta_len = read_u16(&mut input)? as usize;
    let mut meta_bytes = vec![0u8; meta_len];
    input.read_exact(&mut meta_bytes).map_err(Error::RestoreFailed)?;
    checksum.update(&meta_bytes);

    let header_len = read_u32(&mut input)? as usize;
    let mut header_bytes = vec![0u8; header_len];
    input.read_exact(&mut header_bytes).map_err(Error::RestoreFailed)?;
    checksum.update(&header_bytes);

    let (key_arena_size, value_arena_size) = crate::mapping::Meta::read_arena_sizes(&meta_bytes);
    let key_bytes = read_arena_blocks(&mut input, &mut checksum)?;
    let value_bytes = read_arena_blocks(&mut input, &mut checksum)?;

    let expected = fs::read_to_string(from_dir.join(CHECKSUM_FILE_NAME)).map_err(Error::RestoreFailed)?;
    if expected.trim() != checksum.to_hex() {
        return Err(Error::Corrupt("snapshot checksum mismatch".into()));
    }

    let options = CreateOptions {
        key_arena_size,
        value_arena_size,
        ..Default::default()
    };
    let mut mapping = Mapping::open_or_create(to_path, &options)?;

    // SAFETY: `mapping` was just created by this call and is not yet
    // shared with any other thread or process.
    unsafe {
        mapping.overwrite_meta_and_header(&meta_bytes, &header_bytes);
        mapping.overwrite_arena_prefix(ArenaKind::Key, &key_bytes);
        mapping.overwrite_arena_prefix(ArenaKind::Value, &value_bytes);
    }

    debug!(key_bytes = key_bytes.len(), value_bytes = value_bytes.len(), "restore complete");
    Ok(mapping)
}

fn read_arena_blocks(input: &mut fs::File, checksum: &mut Checksum) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    loop {
        let orig_len = read_u32(input)? as usize;
        if orig_len == 0 {
            break;
        }
        let comp_len = read_u32(input)? as usize;
        let mut compressed = vec![0u8; comp_len];
        input.read_exact(&mut compressed).map_err(Error::RestoreFailed)?;
        let decompressed = lz4_flex::block::decompress(&compressed, orig_len)
            .map_err(|e| Error::Corrupt(format!("bad lz4 block in snapshot: {e}")))?;
        checksum.update(&decompressed);
        out.extend_from_slice(&decompressed);
    }
    Ok(out)
}

fn write_u16(out: &mut fs::File, v: u16) -> Result<()> {
    out.write_all(&v.to_ne_bytes()).map_err(Error::SnapshotFailed)
}

fn write_u32(out: &mut fs::File, v: u32) -> Result<()> {
    out.write_all(&v.to_ne_bytes()).map_err(Error::SnapshotFailed)
}

fn read_u16(input: &mut fs::File) -> Result<u16> {
    let mut buf = [0u8; 2];
    input.read_exact(&mut buf).map_err(Error::RestoreFailed)?;
    Ok(u16::from_ne_bytes(buf))
}

fn read_u32(input: &mut fs::File) -> Result<u32> {
    let mut buf = [0u8; 4];
    input.read_exact(&mut buf).map_err(Error::RestoreFailed)?;
    Ok(u32::from_ne_bytes(buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::ArenaKind;
    use crate::object::Object;
    use tempfile::tempdir;

    #[test]
    fn backup_then_restore_reproduces_live_arena_bytes() {
        let dir = tempdir().unwrap();
        let options = CreateOptions {
            key_arena_size: 1 << 16,
            value_arena_size: 1 << 16,
            ..Default::default()
        };
        let mapping = Mapping::open_or_create(dir.path().join("source"), &options).unwrap();
        let alloc = mapping.allocator();

        let key = Object::new_string(&alloc, ArenaKind::Key, b"hello").unwrap();
        let value = Object::new_string(&alloc, ArenaKind::Value, b"world, a long enough value to leave the inline range").unwrap();
        let mut table = crate::collections::RelocHashMap::new_in(alloc.key_arena());
        table.insert(key, value, &alloc);

        let key_before = unsafe { alloc.key_arena().as_bytes() }.to_vec();
        let value_before = unsafe { alloc.value_arena().as_bytes() }.to_vec();

        let snap_dir = dir.path().join("snap");
        backup(&mapping, &alloc, &snap_dir).unwrap();

        let restored = restore(&snap_dir, dir.path().join("restored")).unwrap();
        let restored_alloc = restored.allocator();
        let key_after = unsafe { restored_alloc.key_arena().as_bytes() }.to_vec();
        let value_after = unsafe { restored_alloc.value_arena().as_bytes() }.to_vec();

        assert_eq!(key_before, key_after);
        assert_eq!(value_before, value_after);
        assert_eq!(restored.generation(), mapping.generation());
    }

    #[test]
    fn restore_rejects_a_tampered_checksum() {
        let dir = tempdir().unwrap();
        let mapping = Mapping::open_or_create(
            dir.path().join("source"),
            &CreateOptions { key_arena_size: 1 << 16, value_arena_size: 1 << 16, ..Default::default() },
        )
        .unwrap();
        let alloc = mapping.allocator();
        let snap_dir = dir.path().join("snap");
        backup(&mapping, &alloc, &snap_dir).unwrap();

        fs::write(snap_dir.join(CHECKSUM_FILE_NAME), "0000000000000000deadbeef").unwrap();

        let err = restore(&snap_dir, dir.path().join("restored")).unwrap_err();
        assert!(matches!(err, Error::Corrupt(_)));
    }

    #[test]
    fn empty_arenas_round_trip_through_zero_length_block_streams() {
        let dir = tempdir().unwrap();
        let mapping = Mapping::open_or_create(
            dir.path().join("source"),
            &CreateOptions { key_arena_size: 1 << 16, value_arena_size: 1 << 16, ..Default::default() },
        )
        .unwrap();
        let alloc = mapping.allocator();
        let snap_dir = dir.path().join("snap");
        backup(&mapping, &alloc, &snap_dir).unwrap();
        let restored = restore(&snap_dir, dir.path().join("restored")).unwrap();
        assert_eq!(restored.generation(), 1);
    }
}
