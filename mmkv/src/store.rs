// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The embeddable entry point: opens a segment per [`Config`], installs
//! logging, runs the optional verify pass, and exposes the database-level
//! command surface (`lookup`, `get_or_create_typed`, `remove`, `rename`,
//! `dbsize`, `flush_db`, `flush_all`) from spec.md section 4.7. Autoexpand
//! and the process-shared lock are handled once here rather than by every
//! caller.

use crate::config::Config;
use crate::log;
use mmkv_core::db::{self, CollectionKind, Damage, Database as CoreDatabase};
use mmkv_core::object::Object;
use mmkv_core::{Error, Mapping, Result};
use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::{Mutex, RwLock};

/// An open segment plus the databases resolved from it so far.
pub struct Store {
    mapping: RwLock<Mapping>,
    config: Config,
    databases: Mutex<HashMap<u32, CoreDatabase>>,
}

impl Store {
    /// Opens the segment named by `config.dir`, creating it if
    /// `config.create_if_notexist` allows it and it does not yet exist.
    pub fn open(config: Config) -> Result<Self> {
        log::install(&config.log);

        if !config.dir.exists() {
            if !config.create_if_notexist {
                return Err(Error::NotExist);
            }
            std::fs::create_dir_all(&config.dir)?;
        }

        let core_options = config.create_options.to_core();
        let mapping = Mapping::open_or_create(&config.dir, &core_options)?;

        if config.reserve_keyspace {
            mapping.mlock_arena(mmkv_core::alloc::ArenaKind::Key)?;
        }
        if config.reserve_valuespace {
            mapping.mlock_arena(mmkv_core::alloc::ArenaKind::Value)?;
        }

        let store = Store { mapping: RwLock::new(mapping), config, databases: Mutex::new(HashMap::new()) };

        if store.config.verify {
            let damage = store.verify()?;
            for entry in &damage {
                tracing::warn!(?entry, "mmkv integrity check found damage on open");
            }
        }

        Ok(store)
    }

    fn mapping(&self) -> std::sync::RwLockReadGuard<'_, Mapping> {
        self.mapping.read().expect("mmkv mapping rwlock poisoned")
    }

    fn require_writable(&self) -> Result<()> {
        if self.config.readonly {
            return Err(Error::PermissionDenied);
        }
        Ok(())
    }

    fn with_database<R>(&self, id: u32, f: impl FnOnce(&CoreDatabase, &Mapping) -> Result<R>) -> Result<R> {
        let mapping = self.mapping();
        let mut databases = self.databases.lock().expect("mmkv database registry mutex poisoned");
        let db = databases.entry(id).or_insert_with(|| CoreDatabase::new(id));
        f(db, &mapping)
    }

    fn read_locked<R>(&self, f: impl FnOnce() -> Result<R>) -> Result<R> {
        if !self.config.use_lock {
            return f();
        }
        let mapping = self.mapping();
        mapping.lock().lock_read();
        let result = f();
        mapping.lock().unlock_read();
        result
    }

    /// Runs `f` under the write lock, retrying once after growing the value
    /// arena by `ensure_space_size` if `f` fails with
    /// [`Error::OutOfSpace`] and `config.create_options.autoexpand` is set.
    fn write_locked<R>(&self, f: impl Fn() -> Result<R>) -> Result<R> {
        self.require_writable()?;
        if !self.config.use_lock {
            return self.maybe_autoexpand(f);
        }
        {
            let mapping = self.mapping();
            mapping.lock().lock_write();
            mapping.mark_writer(Some(std::process::id()));
        }
        let result = self.maybe_autoexpand(f);
        {
            let mapping = self.mapping();
            mapping.mark_writer(None);
            mapping.lock().unlock_write();
        }
        result
    }

    /// Like [`Store::write_locked`] but never retries `f`. Used for
    /// compound operations such as `rename` whose first step (removing the
    /// source entry) is not safe to repeat if a later step runs out of
    /// space -- autoexpand only helps single-allocation operations.
    fn write_locked_once<R>(&self, f: impl FnOnce() -> Result<R>) -> Result<R> {
        self.require_writable()?;
        if !self.config.use_lock {
            return f();
        }
        let mapping = self.mapping();
        mapping.lock().lock_write();
        mapping.mark_writer(Some(std::process::id()));
        let result = f();
        mapping.mark_writer(None);
        mapping.lock().unlock_write();
        result
    }

    fn maybe_autoexpand<R>(&self, f: impl Fn() -> Result<R>) -> Result<R> {
        match f() {
            Err(Error::OutOfSpace) if self.config.create_options.autoexpand => {
                let additional = self.config.create_options.ensure_space_size;
                tracing::info!(additional, "growing mmkv value arena on exhaustion");
                self.mapping.write().expect("mmkv mapping rwlock poisoned").grow_value_arena(additional)?;
                f()
            }
            other => other,
        }
    }

    /// Looks up `key` in database `db_id`, spec.md section 4.7's `lookup`.
    pub fn lookup(&self, db_id: u32, key: &Object) -> Result<Option<Object>> {
        self.read_locked(|| self.with_database(db_id, |db, mapping| db.get(mapping, key)))
    }

    pub fn contains(&self, db_id: u32, key: &Object) -> Result<bool> {
        self.read_locked(|| self.with_database(db_id, |db, mapping| db.contains(mapping, key)))
    }

    /// Sets `key` to `value` directly, for `STRING`/raw-typed values.
    pub fn set(&self, db_id: u32, key: Object, value: Object) -> Result<()> {
        self.write_locked(|| {
            self.with_database(db_id, |db, mapping| db.set(mapping, key.clone(), value.clone()))
        })
    }

    /// Resolves `key`'s collection root, creating an empty `T` if absent.
    pub fn get_or_create_typed<T: CollectionKind>(&self, db_id: u32, key: &Object) -> Result<NonNull<T>> {
        self.write_locked(|| self.with_database(db_id, |db, mapping| db.get_or_create_typed::<T>(mapping, key)))
    }

    pub fn remove(&self, db_id: u32, key: &Object) -> Result<bool> {
        self.write_locked(|| self.with_database(db_id, |db, mapping| db.remove(mapping, key)))
    }

    /// Moves `src_key` from database `src_db` to `dst_key` in database
    /// `dst_db` without re-encoding the value. `nx` refuses to overwrite an
    /// existing `dst_key`.
    pub fn rename(&self, src_db: u32, src_key: &Object, dst_db: u32, dst_key: &Object, nx: bool) -> Result<()> {
        self.write_locked_once(|| {
            let mapping = self.mapping();
            let mut databases = self.databases.lock().expect("mmkv database registry mutex poisoned");
            databases.entry(src_db).or_insert_with(|| CoreDatabase::new(src_db));
            databases.entry(dst_db).or_insert_with(|| CoreDatabase::new(dst_db));
            let from = databases.get(&src_db).expect("just inserted");
            let to = databases.get(&dst_db).expect("just inserted");
            db::rename_across(&mapping, from, src_key, to, dst_key, nx)
        })
    }

    pub fn dbsize(&self, db_id: u32) -> Result<usize> {
        self.read_locked(|| self.with_database(db_id, |db, mapping| db.dbsize(mapping)))
    }

    pub fn flush_db(&self, db_id: u32) -> Result<()> {
        self.write_locked(|| self.with_database(db_id, |db, mapping| db.flush(mapping)))
    }

    pub fn flush_all(&self) -> Result<()> {
        self.write_locked(|| db::flush_all(&self.mapping()))
    }

    /// Evicts due entries from the store-wide TTL index (spec.md section
    /// 4.8), bounded by both `max_items` and `max_duration`, deleting each
    /// expired key from its owning database too. Returns the number of keys
    /// removed.
    pub fn sweep_ttl(&self, now_millis: i64, max_items: usize, max_duration: std::time::Duration) -> Result<usize> {
        self.write_locked(|| db::sweep(&self.mapping(), now_millis, max_items, max_duration))
    }

    /// Walks every named root and key table, reporting damaged entries
    /// without repairing them (spec.md section 9 leaves repair out of
    /// scope).
    pub fn verify(&self) -> Result<Vec<Damage>> {
        self.read_locked(|| db::verify_all(&self.mapping()))
    }

    /// Writes a portable, restorable copy of the live segment to
    /// `dest_dir`. See [`mmkv_core::snapshot::backup`].
    pub fn backup(&self, dest_dir: impl AsRef<std::path::Path>) -> Result<()> {
        let mapping = self.mapping();
        let alloc = mapping.allocator();
        mmkv_core::snapshot::backup(&mapping, &alloc, dest_dir)
    }

    /// The mapping's current remap generation, bumped by growth; mainly
    /// useful for tests asserting that autoexpand fired.
    pub fn generation(&self) -> u64 {
        self.mapping().generation()
    }

    /// If the last known writer pid no longer exists, clears the lock word
    /// so a subsequent `write_locked` call does not observe it as stuck
    /// (spec.md section 9's crash-recovery escape hatch).
    pub fn reset_lock_if_dead_writer(&self) -> bool {
        self.mapping().reset_if_dead_writer()
    }
}
