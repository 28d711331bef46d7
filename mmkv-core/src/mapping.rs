// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The segment manager: owns the file-backed mapping every other module
//! builds on, and the fixed, well-known sub-regions inside it (spec.md
//! section 4.1).
//!
//! ```text
//! dir/
//!   data   +--------+----------+------------------------+------------------------+
//!          |  Meta  |  Header  |       Key Arena         |      Value Arena       |
//!          +--------+----------+------------------------+------------------------+
//!   locks  +----------------------------------------------------------------------+
//!          | magic | generation | last_writer_pid | RawRwLock                     |
//!          +----------------------------------------------------------------------+
//! ```
//!
//! The lock word lives in its own small mapping (`locks`), never in `data`
//! (spec.md section 4.1/4.2): restore always rebuilds `data` from scratch
//! in a fresh directory, and a lock word that lived inside it would force
//! restore to reason about in-flight lock state it has no business
//! touching. `Meta`/`Header` are fixed-size and fixed-offset inside `data`;
//! the two arenas grow independently, each a [`crate::alloc::Arena`] whose
//! own [`crate::alloc::ArenaControl`] header sits at its base. Every
//! attaching process requests the same preferred virtual address for both
//! mappings (spec.md's "shared at the same address" precondition);
//! `Offset`/`ArenaPtr` still make every cross-structure reference correct
//! even on the processes that lose the race for that address (see
//! DESIGN.md).

use crate::alloc::{Allocator, Arena, ArenaControl, ArenaKind};
use crate::error::{Error, Result};
use crate::lock::RawRwLock;
use nix::fcntl::{self, FcntlArg, OFlag};
use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};
use nix::unistd::ftruncate;
use std::fs::{File, OpenOptions};
use std::num::NonZeroUsize;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use tracing::{debug, info, warn};

const DATA_FILE_NAME: &str = "data";
const LOCKS_FILE_NAME: &str = "locks";

const MAGIC: u64 = 0x6d6d_6b76_3031; // "mmkv01"
const FORMAT_VERSION: u32 = 1;
const LOCKS_MAGIC: u64 = 0x6d6d_6b76_6c6b; // "mmkvlk"

/// The address every process asks the kernel for first. Chosen inside a
/// range Linux is very unlikely to hand out to anything else by default;
/// losing the race (another mapping already sits there) degrades to a
/// process-private base address, which is still correct, just unable to
/// hand out `Offset`-free raw pointers to other processes.
const PREFERRED_DATA_BASE: usize = 0x0000_7f00_0000_0000;
/// A distinct preferred address for `locks`, far enough from
/// [`PREFERRED_DATA_BASE`] that growing `data` (which can reach many GiB)
/// never collides with it.
const PREFERRED_LOCKS_BASE: usize = 0x0000_7e00_0000_0000;

/// Fixed-size, fixed-offset control block at the very start of the `data`
/// file. Never moves, never resizes; `total_size`/arena boundaries are
/// updated in place as the file grows. Carries no lock state -- see the
/// module docs for why that lives in `locks` instead.
#[repr(C)]
pub struct Meta {
    magic: AtomicU64,
    version: AtomicU32,
    total_size: AtomicU64,
    key_arena_offset: AtomicU64,
    key_arena_size: AtomicU64,
    value_arena_offset: AtomicU64,
    value_arena_size: AtomicU64,
}

impl Meta {
    pub const SIZE: usize = std::mem::size_of::<Meta>();

    fn as_ptr(base: *mut u8) -> *mut Meta {
        base as *mut Meta
    }
}

/// Fixed-size region following `Meta`: the named-objects table root and a
/// handful of reserved slots (TTL index root, database registry root).
/// Populated by the higher-level modules; the segment manager only carves
/// out the space.
#[repr(C)]
pub struct Header {
    pub named_objects_root: AtomicU64,
    pub ttl_index_root: AtomicU64,
    pub db_registry_root: AtomicU64,
    _reserved: [AtomicU64; 5],
}

impl Header {
    pub const SIZE: usize = std::mem::size_of::<Header>();
}

const HEADER_OFFSET: usize = Meta::SIZE;
const ARENA_START: usize = HEADER_OFFSET + Header::SIZE;

/// The entire contents of the `locks` mapping (spec.md section 4.2): a
/// process-shared reader-writer lock, a generation counter bumped on every
/// `data` growth so other processes know to re-derive cached pointers, and
/// the pid of whoever currently (or most recently) held the write lock,
/// for crash detection (spec.md section 9).
#[repr(C)]
struct LockRegion {
    magic: AtomicU64,
    generation: AtomicU64,
    last_writer_pid: AtomicU32,
    _pad: u32,
    lock: RawRwLock,
}

impl LockRegion {
    const SIZE: usize = std::mem::size_of::<LockRegion>();

    fn as_ptr(base: *mut u8) -> *mut LockRegion {
        base as *mut LockRegion
    }
}

/// Owns the open file descriptors and current mappings for both `data` and
/// `locks`. Dropping it unmaps both regions but leaves the backing files
/// untouched.
pub struct Mapping {
    data_file: File,
    data_base: NonNull<u8>,
    data_len: usize,
    locks_file: File,
    locks_base: NonNull<u8>,
    dir: PathBuf,
    _dir_lock: Option<DirLock>,
}

unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

/// Options controlling how a [`Mapping`] is created.
#[derive(Debug, Clone)]
pub struct CreateOptions {
    pub key_arena_size: u64,
    pub value_arena_size: u64,
    pub mode: u32,
}

impl Default for CreateOptions {
    fn default() -> Self {
        CreateOptions {
            key_arena_size: 4 << 20,
            value_arena_size: 16 << 20,
            mode: 0o600,
        }
    }
}

impl Mapping {
    /// Opens an existing segment directory, or creates one with `options`
    /// if it does not exist. `dir` holds exactly two files: `data` (the
    /// main mapping) and `locks` (spec.md section 6's directory layout).
    /// Serializes concurrent first-time initialization across processes
    /// via an advisory lock on `dir` itself.
    pub fn open_or_create(dir: impl AsRef<Path>, options: &CreateOptions) -> Result<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let dir_lock = DirLock::acquire(dir)?;

        let data_path = dir.join(DATA_FILE_NAME);
        let locks_path = dir.join(LOCKS_FILE_NAME);
        let existed = data_path.exists() && locks_path.exists();

        let data_file = OpenOptions::new().read(true).write(true).create(true).mode(options.mode).open(&data_path)?;
        let locks_file = OpenOptions::new().read(true).write(true).create(true).mode(options.mode).open(&locks_path)?;

        let mapping = if existed && data_file.metadata()?.len() >= ARENA_START as u64 {
            debug!(dir = %dir.display(), "attaching existing mmkv segment");
            Self::attach(data_file, locks_file, dir.to_path_buf(), Some(dir_lock))?
        } else {
            info!(dir = %dir.display(), "initializing new mmkv segment");
            Self::initialize(data_file, locks_file, dir.to_path_buf(), options, Some(dir_lock))?
        };
        Ok(mapping)
    }

    fn initialize(
        data_file: File,
        locks_file: File,
        dir: PathBuf,
        options: &CreateOptions,
        dir_lock: Option<DirLock>,
    ) -> Result<Self> {
        let total = ARENA_START as u64 + options.key_arena_size + options.value_arena_size;
        ftruncate(&data_file, total as i64).map_err(io_err)?;
        ftruncate(&locks_file, LockRegion::SIZE as i64).map_err(io_err)?;

        let data_base = map_at_preferred_address(&data_file, total as usize, PREFERRED_DATA_BASE)?;
        unsafe { std::ptr::write_bytes(data_base.as_ptr(), 0, total as usize) };
        let locks_base = map_at_preferred_address(&locks_file, LockRegion::SIZE, PREFERRED_LOCKS_BASE)?;
        unsafe { std::ptr::write_bytes(locks_base.as_ptr(), 0, LockRegion::SIZE) };

        let key_arena_offset = ARENA_START as u64;
        let value_arena_offset = key_arena_offset + options.key_arena_size;

        unsafe {
            let meta = Meta::as_ptr(data_base.as_ptr());
            (*meta).magic = AtomicU64::new(MAGIC);
            (*meta).version = AtomicU32::new(FORMAT_VERSION);
            (*meta).total_size = AtomicU64::new(total);
            (*meta).key_arena_offset = AtomicU64::new(key_arena_offset);
            (*meta).key_arena_size = AtomicU64::new(options.key_arena_size);
            (*meta).value_arena_offset = AtomicU64::new(value_arena_offset);
            (*meta).value_arena_size = AtomicU64::new(options.value_arena_size);

            ArenaControl::init(
                NonNull::new_unchecked(data_base.as_ptr().add(key_arena_offset as usize)),
                options.key_arena_size,
            );
            ArenaControl::init(
                NonNull::new_unchecked(data_base.as_ptr().add(value_arena_offset as usize)),
                options.value_arena_size,
            );

            let lock_region = LockRegion::as_ptr(locks_base.as_ptr());
            (*lock_region).magic = AtomicU64::new(LOCKS_MAGIC);
            (*lock_region).generation = AtomicU64::new(1);
            (*lock_region).last_writer_pid = AtomicU32::new(0);
            (*lock_region).lock.init();
        }

        Ok(Mapping {
            data_file,
            data_base,
            data_len: total as usize,
            locks_file,
            locks_base,
            dir,
            _dir_lock: dir_lock,
        })
    }

    fn attach(data_file: File, locks_file: File, dir: PathBuf, dir_lock: Option<DirLock>) -> Result<Self> {
        let data_len = data_file.metadata()?.len() as usize;
        let data_base = map_at_preferred_address(&data_file, data_len, PREFERRED_DATA_BASE)?;
        let meta = unsafe { &*Meta::as_ptr(data_base.as_ptr()) };
        if meta.magic.load(Ordering::Acquire) != MAGIC {
            return Err(Error::Corrupt("bad magic in mmkv segment header".into()));
        }
        if meta.version.load(Ordering::Acquire) != FORMAT_VERSION {
            return Err(Error::Corrupt("unsupported mmkv segment format version".into()));
        }

        let locks_len = locks_file.metadata()?.len() as usize;
        if locks_len < LockRegion::SIZE {
            return Err(Error::Corrupt("locks file shorter than a lock region".into()));
        }
        let locks_base = map_at_preferred_address(&locks_file, LockRegion::SIZE, PREFERRED_LOCKS_BASE)?;
        let lock_region = unsafe { &*LockRegion::as_ptr(locks_base.as_ptr()) };
        if lock_region.magic.load(Ordering::Acquire) != LOCKS_MAGIC {
            return Err(Error::Corrupt("bad magic in mmkv locks file".into()));
        }

        Ok(Mapping {
            data_file,
            data_base,
            data_len,
            locks_file,
            locks_base,
            dir,
            _dir_lock: dir_lock,
        })
    }

    #[inline]
    pub fn meta(&self) -> &Meta {
        unsafe { &*Meta::as_ptr(self.data_base.as_ptr()) }
    }

    #[inline]
    pub fn header(&self) -> &Header {
        unsafe { &*(self.data_base.as_ptr().add(HEADER_OFFSET) as *const Header) }
    }

    #[inline]
    fn lock_region(&self) -> &LockRegion {
        unsafe { &*LockRegion::as_ptr(self.locks_base.as_ptr()) }
    }

    #[inline]
    pub fn generation(&self) -> u64 {
        self.lock_region().generation.load(Ordering::Acquire)
    }

    #[inline]
    pub fn lock(&self) -> &RawRwLock {
        &self.lock_region().lock
    }

    /// Builds a two-arena allocator handle for the arenas at their current
    /// location in this mapping. Must be re-derived after any observed
    /// generation bump.
    pub fn allocator(&self) -> Allocator {
        let meta = self.meta();
        let key_off = meta.key_arena_offset.load(Ordering::Acquire);
        let value_off = meta.value_arena_offset.load(Ordering::Acquire);
        unsafe {
            let key_ctrl = NonNull::new_unchecked(self.data_base.as_ptr().add(key_off as usize) as *mut ArenaControl);
            let value_ctrl = NonNull::new_unchecked(self.data_base.as_ptr().add(value_off as usize) as *mut ArenaControl);
            Allocator::new(
                Arena::from_control(key_ctrl, ArenaKind::Key),
                Arena::from_control(value_ctrl, ArenaKind::Value),
            )
        }
    }

    /// Records the calling process as the current write-lock holder. Must
    /// be called by the caller immediately after acquiring the write lock,
    /// and cleared (`pid = 0`) immediately before releasing it.
    pub fn mark_writer(&self, pid: Option<u32>) {
        self.lock_region().last_writer_pid.store(pid.unwrap_or(0), Ordering::Release);
    }

    /// If the recorded last writer is a pid that no longer exists, assumes
    /// it crashed while holding the write lock, force-clears the lock word,
    /// and returns `true`. Resolves spec.md section 9's "what happens if a
    /// writer dies mid-update" open question: rather than attempt to undo a
    /// partial mutation (the in-place structures have no undo log), we only
    /// ever promise that a clean reader never observes the lock as
    /// permanently stuck, and consistency tooling (`Database::verify_all`)
    /// is expected to run after a crash recovery.
    pub fn reset_if_dead_writer(&self) -> bool {
        let region = self.lock_region();
        let pid = region.last_writer_pid.load(Ordering::Acquire);
        if pid == 0 {
            return false;
        }
        if process_is_alive(pid) {
            return false;
        }
        warn!(pid, "recovering mmkv write lock from a dead writer");
        region.last_writer_pid.store(0, Ordering::Release);
        // SAFETY: forcing the lock word clear is only safe because we've
        // established the recorded holder no longer exists to contend for
        // or release it.
        unsafe {
            let lock_ptr = &region.lock as *const RawRwLock as *mut RawRwLock;
            (*lock_ptr).init();
        }
        true
    }

    /// Grows the segment's backing storage by `additional` bytes, all of it
    /// given to the value arena, and remaps. Must be called with the write
    /// lock held. Bumps `generation` so other processes know to re-derive
    /// cached pointers.
    ///
    /// Only the value arena grows: the two-heap allocator (`crate::alloc`)
    /// already falls back to the other arena whenever its preferred one is
    /// exhausted, so `Error::OutOfSpace` only ever surfaces once *both*
    /// arenas are full, and relieving either side relieves both. There is
    /// deliberately no symmetric `grow_key_arena` -- see `DESIGN.md`.
    pub fn grow_value_arena(&mut self, additional: u64) -> Result<()> {
        let meta = self.meta();
        let new_total = meta.total_size.load(Ordering::Acquire) + additional;
        ftruncate(&self.data_file, new_total as i64).map_err(io_err)?;

        unsafe { munmap(self.data_base, self.data_len) }.map_err(io_err)?;
        let data_base = map_at_preferred_address(&self.data_file, new_total as usize, PREFERRED_DATA_BASE)?;
        self.data_base = data_base;
        self.data_len = new_total as usize;

        let meta = self.meta();
        let value_size = meta.value_arena_size.load(Ordering::Acquire) + additional;
        meta.value_arena_size.store(value_size, Ordering::Release);
        meta.total_size.store(new_total, Ordering::Release);
        self.lock_region().generation.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Pins `kind`'s arena pages in physical memory, matching
    /// `OpenOptions::reserve_keyspace`/`reserve_valuespace` in the original
    /// project: a caller that knows it will touch an entire arena
    /// repeatedly can ask the kernel not to page it out.
    #[cfg(unix)]
    pub fn mlock_arena(&self, kind: ArenaKind) -> Result<()> {
        let meta = self.meta();
        let (offset, size) = match kind {
            ArenaKind::Key => (
                meta.key_arena_offset.load(Ordering::Acquire),
                meta.key_arena_size.load(Ordering::Acquire),
            ),
            ArenaKind::Value => (
                meta.value_arena_offset.load(Ordering::Acquire),
                meta.value_arena_size.load(Ordering::Acquire),
            ),
        };
        let ptr = unsafe { self.data_base.as_ptr().add(offset as usize) } as *const libc::c_void;
        let rc = unsafe { libc::mlock(ptr, size as usize) };
        if rc != 0 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }
        Ok(())
    }

    /// Byte offset of `ptr` from this mapping's `data` base, the portable
    /// form any cross-process root pointer (named-objects root, TTL index
    /// root, a database's key-table root) must be stored as in
    /// `Header`/`NamedObjects`.
    pub fn offset_of<T>(&self, ptr: NonNull<T>) -> u64 {
        (ptr.as_ptr() as usize - self.data_base.as_ptr() as usize) as u64
    }

    /// Resolves a byte offset previously obtained from [`Mapping::offset_of`]
    /// back into a pointer valid in this process.
    ///
    /// # Safety
    /// `offset` must have been produced by `offset_of` on a mapping backed
    /// by the same `data` file, and the bytes at that offset must currently
    /// hold a live, correctly aligned `T`.
    pub unsafe fn resolve_at<T>(&self, offset: u64) -> NonNull<T> {
        NonNull::new_unchecked(self.data_base.as_ptr().add(offset as usize) as *mut T)
    }

    /// The `Meta` region's raw bytes, for a snapshot to write out verbatim
    /// (spec.md section 6's length-prefixed Meta record).
    pub fn meta_bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.data_base.as_ptr(), Meta::SIZE) }
    }

    /// The `Header` region's raw bytes, for a snapshot to write out verbatim.
    pub fn header_bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.data_base.as_ptr().add(HEADER_OFFSET), Header::SIZE) }
    }

    pub fn key_arena_size(&self) -> u64 {
        self.meta().key_arena_size.load(Ordering::Acquire)
    }

    pub fn value_arena_size(&self) -> u64 {
        self.meta().value_arena_size.load(Ordering::Acquire)
    }

    /// Overwrites this mapping's `Meta` and `Header` regions verbatim with
    /// bytes previously obtained from [`Mapping::meta_bytes`]/
    /// [`Mapping::header_bytes`] on another mapping -- the restore half of
    /// spec.md section 6's snapshot format, which writes a Meta and Header
    /// at their fixed offsets exactly as captured. `locks` is deliberately
    /// left untouched: a restored segment gets a fresh lock and generation
    /// counter, never a copy of the source's (spec.md section 4.1's
    /// rationale for keeping the two apart).
    ///
    /// # Safety
    /// This mapping must not yet be shared with any other thread or
    /// process, and `meta_bytes`/`header_bytes` must be exactly
    /// `Meta::SIZE`/`Header::SIZE` bytes long.
    pub unsafe fn overwrite_meta_and_header(&mut self, meta_bytes: &[u8], header_bytes: &[u8]) {
        debug_assert_eq!(meta_bytes.len(), Meta::SIZE);
        debug_assert_eq!(header_bytes.len(), Header::SIZE);
        std::ptr::copy_nonoverlapping(meta_bytes.as_ptr(), self.data_base.as_ptr(), Meta::SIZE);
        std::ptr::copy_nonoverlapping(header_bytes.as_ptr(), self.data_base.as_ptr().add(HEADER_OFFSET), Header::SIZE);
    }

    /// Overwrites `kind`'s arena region's leading `bytes.len()` bytes --
    /// the live prefix a snapshot captured via `Arena::as_bytes` -- with
    /// `bytes`. The remainder of the arena was already zeroed by
    /// `initialize`.
    ///
    /// # Safety
    /// This mapping must not yet be shared with any other thread or
    /// process, and `bytes` must fit within the named arena's current
    /// capacity.
    pub unsafe fn overwrite_arena_prefix(&mut self, kind: ArenaKind, bytes: &[u8]) {
        let meta = self.meta();
        let offset = match kind {
            ArenaKind::Key => meta.key_arena_offset.load(Ordering::Acquire),
            ArenaKind::Value => meta.value_arena_offset.load(Ordering::Acquire),
        };
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.data_base.as_ptr().add(offset as usize), bytes.len());
    }
}

impl Meta {
    /// Reads `key_arena_size`/`value_arena_size` out of a raw `Meta`-shaped
    /// byte buffer (as produced by [`Mapping::meta_bytes`]) without the
    /// buffer needing to be a real attached mapping -- used by snapshot
    /// restore to recreate the `CreateOptions` that reproduce a
    /// byte-identical arena layout before the captured bytes are copied in.
    pub(crate) fn read_arena_sizes(bytes: &[u8]) -> (u64, u64) {
        debug_assert!(bytes.len() >= Meta::SIZE);
        let meta = bytes.as_ptr() as *const Meta;
        unsafe {
            (
                (*meta).key_arena_size.load(Ordering::Relaxed),
                (*meta).value_arena_size.load(Ordering::Relaxed),
            )
        }
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        unsafe {
            let _ = munmap(self.data_base, self.data_len);
            let _ = munmap(self.locks_base, LockRegion::SIZE);
        }
    }
}

fn map_at_preferred_address(file: &File, len: usize, preferred: usize) -> Result<NonNull<u8>> {
    let len = NonZeroUsize::new(len).ok_or_else(|| Error::Corrupt("zero-length mmkv mapping".into()))?;
    let hint = NonZeroUsize::new(preferred);

    #[cfg(target_os = "linux")]
    let fixed_flags = MapFlags::MAP_SHARED | MapFlags::MAP_FIXED_NOREPLACE;
    #[cfg(not(target_os = "linux"))]
    let fixed_flags = MapFlags::MAP_SHARED;

    // SAFETY: `file` is open read-write and `len` bytes long (verified by
    // the caller via `ftruncate`/existing file size); the mapping is
    // immediately handed to callers who only access it through the typed
    // accessors in this module. `MAP_FIXED_NOREPLACE` makes this attempt
    // fail cleanly (rather than silently clobbering another mapping) when
    // the preferred address is already taken.
    let result = unsafe { mmap(hint, len, ProtFlags::PROT_READ | ProtFlags::PROT_WRITE, fixed_flags, file.as_raw_fd(), 0) };
    match result {
        Ok(ptr) => Ok(ptr),
        Err(_) => {
            warn!("preferred fixed mapping address unavailable, falling back to a process-chosen address");
            let ptr = unsafe {
                mmap(
                    None,
                    len,
                    ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                    MapFlags::MAP_SHARED,
                    file.as_raw_fd(),
                    0,
                )
            }
            .map_err(io_err)?;
            Ok(ptr)
        }
    }
}

fn io_err(e: nix::Error) -> Error {
    Error::Io(std::io::Error::from(e))
}

fn process_is_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

/// Advisory, directory-wide `fcntl` lock held only across first-time
/// segment creation, so two processes racing to create the same new
/// segment don't both `ftruncate`/initialize its `data`/`locks` files.
/// Dropped once creation (or attach) completes; not held for the life of
/// the `Mapping`.
struct DirLock {
    _file: File,
}

impl DirLock {
    fn acquire(dir: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .custom_flags(OFlag::O_DIRECTORY.bits())
            .open(dir)?;
        let flock = libc::flock {
            l_type: libc::F_WRLCK as i16,
            l_whence: libc::SEEK_SET as i16,
            l_start: 0,
            l_len: 0,
            l_pid: 0,
        };
        fcntl::fcntl(file.as_raw_fd(), FcntlArg::F_SETLKW(&flock)).map_err(io_err)?;
        Ok(DirLock { _file: file })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn small_options() -> CreateOptions {
        CreateOptions {
            key_arena_size: 1 << 16,
            value_arena_size: 1 << 16,
            ..Default::default()
        }
    }

    #[test]
    fn create_then_attach_round_trips_meta() {
        let dir = tempdir().unwrap();
        let segment = dir.path().join("segment");
        let options = small_options();

        {
            let mapping = Mapping::open_or_create(&segment, &options).unwrap();
            assert_eq!(mapping.generation(), 1);
            assert!(mapping.meta().magic.load(Ordering::Acquire) != 0);
        }

        let mapping2 = Mapping::open_or_create(&segment, &options).unwrap();
        assert_eq!(mapping2.generation(), 1);
    }

    #[test]
    fn segment_directory_holds_separate_data_and_locks_files() {
        let dir = tempdir().unwrap();
        let segment = dir.path().join("segment");
        let _mapping = Mapping::open_or_create(&segment, &small_options()).unwrap();
        assert!(segment.join(DATA_FILE_NAME).is_file());
        assert!(segment.join(LOCKS_FILE_NAME).is_file());
    }

    #[test]
    fn allocator_allocates_from_both_arenas() {
        let dir = tempdir().unwrap();
        let segment = dir.path().join("segment");
        let mapping = Mapping::open_or_create(&segment, &small_options()).unwrap();
        let alloc = mapping.allocator();
        let key_handle = alloc.allocate(32, ArenaKind::Key).unwrap();
        let value_handle = alloc.allocate(32, ArenaKind::Value).unwrap();
        assert_eq!(key_handle.arena, ArenaKind::Key);
        assert_eq!(value_handle.arena, ArenaKind::Value);
    }

    #[test]
    fn reset_if_dead_writer_is_noop_with_no_recorded_writer() {
        let dir = tempdir().unwrap();
        let segment = dir.path().join("segment");
        let mapping = Mapping::open_or_create(&segment, &CreateOptions::default()).unwrap();
        assert!(!mapping.reset_if_dead_writer());
    }

    #[test]
    fn reset_if_dead_writer_recovers_from_a_pid_that_no_longer_exists() {
        let dir = tempdir().unwrap();
        let segment = dir.path().join("segment");
        let mapping = Mapping::open_or_create(&segment, &CreateOptions::default()).unwrap();
        mapping.lock().lock_write();
        // A pid vanishingly unlikely to be alive in the test environment.
        mapping.mark_writer(Some(u32::MAX - 1));
        assert!(mapping.reset_if_dead_writer());
        assert!(mapping.lock().try_write());
    }

    #[test]
    fn grow_value_arena_bumps_generation_and_preserves_data() {
        let dir = tempdir().unwrap();
        let segment = dir.path().join("segment");
        let mut mapping = Mapping::open_or_create(&segment, &small_options()).unwrap();
        let gen_before = mapping.generation();

        let handle = mapping.allocator().allocate(8, ArenaKind::Value).unwrap();
        unsafe {
            let ptr = mapping.allocator().value_arena().resolve::<u8>(handle.ptr).unwrap();
            std::ptr::write(ptr.as_ptr(), 0x55);
        }

        mapping.grow_value_arena(1 << 16).unwrap();
        assert_eq!(mapping.generation(), gen_before + 1);

        unsafe {
            let ptr = mapping.allocator().value_arena().resolve::<u8>(handle.ptr).unwrap();
            assert_eq!(std::ptr::read(ptr.as_ptr()), 0x55);
        }
    }
}
