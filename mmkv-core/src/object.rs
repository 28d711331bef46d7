// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The 12-byte, encoding-polymorphic value cell described in spec.md
//! section 3/4.4.
//!
//! `Object`'s `OFFSET_PTR` payload is an [`ArenaPtr`], not the
//! field-self-relative [`crate::offset::Offset`]: an `Object` routinely
//! lives inside a movable slot (a `hashbrown` table entry, a `Vec`
//! element), and a pointer stored relative to *its own* address would go
//! stale the instant the slot moves during a rehash/growth, even though
//! the bytes it points at never moved. An arena-relative offset survives
//! that move unchanged, at the cost of needing the caller to supply which
//! arena to resolve against -- callers always know this from context (see
//! DESIGN.md's resolution of this design point).

use crate::alloc::{Allocator, ArenaKind, ArenaPtr, Handle};
use crate::error::{Error, Result};
use core::cmp::Ordering as CmpOrdering;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ObjectType {
    String = 0,
    List = 1,
    Set = 2,
    ZSet = 3,
    Hash = 4,
    Hll = 5,
    Pod = 6,
}

impl ObjectType {
    fn from_bits(bits: u32) -> Self {
        match bits {
            0 => ObjectType::String,
            1 => ObjectType::List,
            2 => ObjectType::Set,
            3 => ObjectType::ZSet,
            4 => ObjectType::Hash,
            5 => ObjectType::Hll,
            6 => ObjectType::Pod,
            _ => unreachable!("corrupt object type tag"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Encoding {
    /// Up to 8 raw bytes stored inline in the payload.
    InlineRaw = 0,
    /// A 64-bit integer stored inline in the payload.
    Integer = 1,
    /// A transient, non-owning raw pointer. Never valid inside a
    /// collection or across a lock release.
    RawPtr = 2,
    /// An arena-relative offset to owned bytes or a collection root.
    OffsetPtr = 3,
}

impl Encoding {
    fn from_bits(bits: u32) -> Self {
        match bits {
            0 => Encoding::InlineRaw,
            1 => Encoding::Integer,
            2 => Encoding::RawPtr,
            3 => Encoding::OffsetPtr,
            _ => unreachable!("corrupt encoding tag"),
        }
    }
}

const LEN_BITS: u32 = 24;
const LEN_MASK: u32 = (1 << LEN_BITS) - 1;
const TYPE_SHIFT: u32 = LEN_BITS;
const TYPE_MASK: u32 = 0b111;
const ENCODING_SHIFT: u32 = TYPE_SHIFT + 3;
const ENCODING_MASK: u32 = 0b11;
const HASTTL_SHIFT: u32 = ENCODING_SHIFT + 2;

/// The longest decimal integer string eligible for integer encoding, per
/// spec.md section 4.3 ("fits under 21 bytes").
const MAX_INT_ENCODABLE_LEN: usize = 20;

/// A 12-byte tagged, encoding-polymorphic value cell.
#[derive(Clone, Copy)]
#[repr(C)]
pub struct Object {
    tag: u32,
    payload: [u8; 8],
}

const _: () = assert!(core::mem::size_of::<Object>() == 12);

impl Object {
    #[inline]
    fn pack(kind: ObjectType, encoding: Encoding, hasttl: bool, len: u32) -> u32 {
        debug_assert!(len <= LEN_MASK, "object length overflows 24 bits");
        (len & LEN_MASK)
            | ((kind as u32 & TYPE_MASK) << TYPE_SHIFT)
            | ((encoding as u32 & ENCODING_MASK) << ENCODING_SHIFT)
            | ((hasttl as u32) << HASTTL_SHIFT)
    }

    #[inline]
    pub fn kind(&self) -> ObjectType {
        ObjectType::from_bits((self.tag >> TYPE_SHIFT) & TYPE_MASK)
    }

    #[inline]
    pub fn encoding(&self) -> Encoding {
        Encoding::from_bits((self.tag >> ENCODING_SHIFT) & ENCODING_MASK)
    }

    #[inline]
    pub fn has_ttl(&self) -> bool {
        (self.tag >> HASTTL_SHIFT) & 1 == 1
    }

    #[inline]
    pub fn set_has_ttl(&mut self, value: bool) {
        if value {
            self.tag |= 1 << HASTTL_SHIFT;
        } else {
            self.tag &= !(1 << HASTTL_SHIFT);
        }
    }

    /// Logical length: bytes for strings, unused for collection roots.
    #[inline]
    pub fn len(&self) -> u32 {
        self.tag & LEN_MASK
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // -- Constructors --------------------------------------------------

    pub fn new_inline_raw(kind: ObjectType, bytes: &[u8]) -> Self {
        debug_assert!(bytes.len() <= 8);
        let mut payload = [0u8; 8];
        payload[..bytes.len()].copy_from_slice(bytes);
        Object {
            tag: Self::pack(kind, Encoding::InlineRaw, false, bytes.len() as u32),
            payload,
        }
    }

    pub fn new_integer(kind: ObjectType, value: i64) -> Self {
        Object {
            tag: Self::pack(kind, Encoding::Integer, false, 0),
            payload: value.to_ne_bytes(),
        }
    }

    /// Builds a `STRING` object from arbitrary bytes, auto-selecting the
    /// integer encoding when the bytes are a canonical decimal `i64` under
    /// [`MAX_INT_ENCODABLE_LEN`] digits (spec.md section 4.3), the inline
    /// encoding when they fit in 8 bytes, or `OFFSET_PTR` otherwise
    /// (allocating from `alloc`'s preferred arena).
    pub fn new_string(alloc: &Allocator, preferred: ArenaKind, bytes: &[u8]) -> Result<Self> {
        if bytes.len() <= MAX_INT_ENCODABLE_LEN {
            if let Some(i) = try_parse_canonical_i64(bytes) {
                return Ok(Self::new_integer(ObjectType::String, i));
            }
        }
        if bytes.len() <= 8 {
            return Ok(Self::new_inline_raw(ObjectType::String, bytes));
        }
        let handle = alloc.allocate(bytes.len(), preferred)?;
        // SAFETY: handle was just allocated with at least `bytes.len()`
        // usable bytes by this same allocator.
        unsafe {
            let arena = match handle.arena {
                ArenaKind::Key => alloc.key_arena(),
                ArenaKind::Value => alloc.value_arena(),
            };
            let dst = arena.resolve::<u8>(handle.ptr).ok_or(Error::Corrupt("null arena pointer".into()))?;
            core::ptr::copy_nonoverlapping(bytes.as_ptr(), dst.as_ptr(), bytes.len());
        }
        Ok(Self::new_offset_ptr(ObjectType::String, handle, bytes.len() as u32))
    }

    pub fn new_offset_ptr(kind: ObjectType, handle: Handle<u8>, len: u32) -> Self {
        let mut payload = [0u8; 8];
        payload[..4].copy_from_slice(&(handle.ptr.raw_offset() as u32).to_ne_bytes());
        payload[4..8].copy_from_slice(&((handle.ptr.raw_offset() >> 32) as u32).to_ne_bytes());
        let mut obj = Object {
            tag: Self::pack(kind, Encoding::OffsetPtr, false, len),
            payload,
        };
        obj.set_arena_bit(handle.arena);
        obj
    }

    /// A transient, non-owning reference used only while an argument
    /// crosses an API boundary. Must never be written into a collection.
    pub fn new_raw_ptr(kind: ObjectType, ptr: *const u8, len: u32) -> Self {
        Object {
            tag: Self::pack(kind, Encoding::RawPtr, false, len),
            payload: (ptr as u64).to_ne_bytes(),
        }
    }

    // Bit 30 of the tag is the highest bit `pack` never writes (len takes
    // 0..24, type 24..27, encoding 27..29, hasttl bit 29) and is free for
    // OFFSET_PTR objects to remember which arena they resolve against,
    // since the payload itself holds a 48-bit-plus offset, not the arena
    // tag. Must not overlap `LEN_MASK`: that field really does use its full
    // 24 bits, and an arena bit stashed inside it would corrupt `len()` for
    // every value-arena OFFSET_PTR string.
    const ARENA_BIT: u32 = 1 << 30;

    fn set_arena_bit(&mut self, arena: ArenaKind) {
        match arena {
            ArenaKind::Key => self.tag &= !Self::ARENA_BIT,
            ArenaKind::Value => self.tag |= Self::ARENA_BIT,
        }
    }

    fn arena_kind(&self) -> ArenaKind {
        if self.tag & Self::ARENA_BIT != 0 {
            ArenaKind::Value
        } else {
            ArenaKind::Key
        }
    }

    /// A ZSET member's score, stored inline as a raw `f64` bit pattern.
    /// Never participates in `compare`/`compare_alphabetic` -- scores sort
    /// via plain `f64` comparison one level up, in `RelocZSet`.
    pub fn new_score(value: f64) -> Self {
        Object {
            tag: Self::pack(ObjectType::ZSet, Encoding::InlineRaw, false, 8),
            payload: value.to_ne_bytes(),
        }
    }

    pub fn as_score(&self) -> Option<f64> {
        if self.kind() == ObjectType::ZSet && self.encoding() == Encoding::InlineRaw && self.len() == 8 {
            Some(f64::from_ne_bytes(self.payload))
        } else {
            None
        }
    }

    // -- Accessors -------------------------------------------------------

    pub fn as_integer(&self) -> Option<i64> {
        match self.encoding() {
            Encoding::Integer => Some(i64::from_ne_bytes(self.payload)),
            _ => None,
        }
    }

    pub fn offset_handle(&self) -> Option<Handle<u8>> {
        match self.encoding() {
            Encoding::OffsetPtr => {
                let low = u32::from_ne_bytes(self.payload[0..4].try_into().unwrap()) as u64;
                let high = u32::from_ne_bytes(self.payload[4..8].try_into().unwrap()) as u64;
                let offset = low | (high << 32);
                Some(Handle {
                    ptr: ArenaPtr::from_raw_offset(offset),
                    arena: self.arena_kind(),
                })
            }
            _ => None,
        }
    }

    /// Materializes this object's logical bytes. Strings in `OFFSET_PTR`
    /// encoding require the caller to pass the right arena (see module
    /// docs); integer and inline encodings never touch it.
    pub fn to_bytes<'a>(&'a self, alloc: &'a Allocator) -> Result<std::borrow::Cow<'a, [u8]>> {
        use std::borrow::Cow;
        match self.encoding() {
            Encoding::Integer => Ok(Cow::Owned(itoa(self.as_integer().unwrap()))),
            Encoding::InlineRaw => Ok(Cow::Borrowed(&self.payload[..self.len() as usize])),
            Encoding::OffsetPtr => {
                let handle = self.offset_handle().unwrap();
                let arena = match handle.arena {
                    ArenaKind::Key => alloc.key_arena(),
                    ArenaKind::Value => alloc.value_arena(),
                };
                // SAFETY: an OFFSET_PTR STRING object owns a live
                // allocation of at least `len()` bytes in the named arena
                // for as long as the Object itself is live.
                let ptr = unsafe { arena.resolve::<u8>(handle.ptr) }
                    .ok_or_else(|| Error::Corrupt("dangling string pointer".into()))?;
                let slice = unsafe { core::slice::from_raw_parts(ptr.as_ptr(), self.len() as usize) };
                Ok(Cow::Borrowed(slice))
            }
            Encoding::RawPtr => Err(Error::Corrupt("RawPtr object cannot be materialized".into())),
        }
    }

    /// Frees this object's owned payload, if it has one. Must be called
    /// exactly once before the `Object` itself is dropped/overwritten, or
    /// the arena leaks the block (or, for collection roots, a whole
    /// subgraph).
    ///
    /// # Safety
    /// `destroy_collection` must correctly tear down whatever collection
    /// type `self.kind()` implies when `self.kind() != ObjectType::String`;
    /// the caller supplies this because `Object` alone does not know which
    /// collection flavor backs a given root (that is attached type
    /// information the database layer tracks, per spec.md section 4.7).
    pub unsafe fn destroy(&self, alloc: &Allocator) {
        if let Encoding::OffsetPtr = self.encoding() {
            let handle = self.offset_handle().unwrap();
            alloc.deallocate(handle);
        }
    }

    // -- Comparison --------------------------------------------------------

    /// Default comparator: numeric when both sides are integer-encoded;
    /// integers sort before any text per spec.md section 3.
    pub fn compare(&self, other: &Self, alloc: &Allocator) -> Result<CmpOrdering> {
        self.compare_with(other, alloc, false)
    }

    /// Alphabetic comparator: integers are stringified before comparing,
    /// so `"9" < "10"` is false (string order), matching ZSET member
    /// ordering semantics (spec.md section 3 "Score").
    pub fn compare_alphabetic(&self, other: &Self, alloc: &Allocator) -> Result<CmpOrdering> {
        self.compare_with(other, alloc, true)
    }

    fn compare_with(&self, other: &Self, alloc: &Allocator, alphabetic: bool) -> Result<CmpOrdering> {
        if !alphabetic {
            if let (Some(a), Some(b)) = (self.as_integer(), other.as_integer()) {
                return Ok(a.cmp(&b));
            }
            if self.as_integer().is_some() && other.as_integer().is_none() {
                return Ok(CmpOrdering::Less);
            }
            if self.as_integer().is_none() && other.as_integer().is_some() {
                return Ok(CmpOrdering::Greater);
            }
        }
        let a = self.to_bytes(alloc)?;
        let b = other.to_bytes(alloc)?;
        Ok(a.as_ref().cmp(b.as_ref()))
    }

    pub fn equals(&self, other: &Self, alloc: &Allocator) -> Result<bool> {
        Ok(self.compare(other, alloc)? == CmpOrdering::Equal)
    }
}

/// Parses `bytes` as a canonical (no leading zeros, no `+`, optional single
/// leading `-`) decimal `i64`, the representation the integer encoding
/// requires to round-trip byte-for-byte through `itoa`.
fn try_parse_canonical_i64(bytes: &[u8]) -> Option<i64> {
    let s = core::str::from_utf8(bytes).ok()?;
    if s.is_empty() {
        return None;
    }
    let (neg, digits) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s),
    };
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if digits.len() > 1 && digits.starts_with('0') {
        return None;
    }
    if neg && digits == "0" {
        return None;
    }
    let value: i64 = s.parse().ok()?;
    if itoa(value) != bytes {
        return None;
    }
    Some(value)
}

fn itoa(value: i64) -> Vec<u8> {
    value.to_string().into_bytes()
}
