//! Heap addresses, object references and work-queue entries.
//!
//! The marking engine never dereferences heap memory itself; every object
//! inspection goes through the [`ObjectModel`] trait so that the engine can
//! run against the real memory-server heap or the in-process test heap.

use std::fmt;

/// Bytes per heap word on the targets we support.
pub const WORD_BYTES: usize = 8;

/// A byte address inside (or just past) the reserved heap range.
///
/// `HeapAddr` is a plain value type; `0` is the canonical null address.
///
/// # Examples
///
/// ```
/// use conmark::object::{HeapAddr, WORD_BYTES};
///
/// let a = HeapAddr::new(0x1_0000);
/// assert!(!a.is_null());
/// assert_eq!(a.add_words(2).as_usize(), 0x1_0000 + 2 * WORD_BYTES);
/// assert_eq!(HeapAddr::NULL.as_usize(), 0);
/// ```
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HeapAddr(usize);

impl HeapAddr {
    pub const NULL: HeapAddr = HeapAddr(0);

    #[inline]
    pub const fn new(raw: usize) -> Self {
        HeapAddr(raw)
    }

    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0
    }

    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub const fn is_word_aligned(self) -> bool {
        self.0 % WORD_BYTES == 0
    }

    #[inline]
    pub const fn add_bytes(self, bytes: usize) -> Self {
        HeapAddr(self.0 + bytes)
    }

    #[inline]
    pub const fn add_words(self, words: usize) -> Self {
        HeapAddr(self.0 + words * WORD_BYTES)
    }

    /// Distance in whole words from `other` (which must not be above `self`).
    #[inline]
    pub fn words_since(self, other: HeapAddr) -> usize {
        debug_assert!(other.0 <= self.0);
        (self.0 - other.0) / WORD_BYTES
    }
}

impl fmt::Debug for HeapAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HeapAddr({:#x})", self.0)
    }
}

/// A non-null, word-aligned reference to an object start.
///
/// # Examples
///
/// ```
/// use conmark::object::{HeapAddr, ObjectRef};
///
/// let obj = ObjectRef::from_addr(HeapAddr::new(0x2_0000)).unwrap();
/// assert_eq!(obj.addr().as_usize(), 0x2_0000);
/// assert!(ObjectRef::from_addr(HeapAddr::NULL).is_none());
/// ```
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectRef(HeapAddr);

impl ObjectRef {
    /// Wrap an address; `None` for null or misaligned values.
    #[inline]
    pub fn from_addr(addr: HeapAddr) -> Option<Self> {
        if addr.is_null() || !addr.is_word_aligned() {
            None
        } else {
            Some(ObjectRef(addr))
        }
    }

    /// Wrap an address known to be a valid object start.
    #[inline]
    pub fn from_addr_unchecked(addr: HeapAddr) -> Self {
        debug_assert!(!addr.is_null() && addr.is_word_aligned());
        ObjectRef(addr)
    }

    #[inline]
    pub const fn addr(self) -> HeapAddr {
        self.0
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectRef({:#x})", self.0.as_usize())
    }
}

/// A half-open address range `[start, end)`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct MemRegion {
    pub start: HeapAddr,
    pub end: HeapAddr,
}

impl MemRegion {
    #[inline]
    pub const fn new(start: HeapAddr, end: HeapAddr) -> Self {
        MemRegion { start, end }
    }

    #[inline]
    pub fn byte_size(&self) -> usize {
        self.end.as_usize() - self.start.as_usize()
    }

    #[inline]
    pub fn word_size(&self) -> usize {
        self.byte_size() / WORD_BYTES
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    #[inline]
    pub fn contains(&self, addr: HeapAddr) -> bool {
        addr >= self.start && addr < self.end
    }
}

/// One-word tagged work-queue entry: either an object to scan or a slice
/// cursor into a large reference array.
///
/// A slice entry carries the address of the first unscanned element; the
/// owning array is recovered through [`ObjectModel::array_containing_slice`].
/// The raw encoding reserves the low address bit as the slice tag, which is
/// always clear for word-aligned object starts.
///
/// # Examples
///
/// ```
/// use conmark::object::{HeapAddr, ObjectRef, TaskEntry};
///
/// let obj = ObjectRef::from_addr(HeapAddr::new(0x4_0000)).unwrap();
/// let entry = TaskEntry::from_obj(obj);
/// assert_eq!(entry.as_obj(), Some(obj));
/// assert!(entry.as_slice().is_none());
///
/// let slice = TaskEntry::from_slice(HeapAddr::new(0x4_0040));
/// assert_eq!(slice.as_slice(), Some(HeapAddr::new(0x4_0040)));
/// assert!(!slice.is_null());
/// assert!(TaskEntry::NULL.is_null());
/// ```
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct TaskEntry(usize);

const SLICE_TAG: usize = 0x1;

impl TaskEntry {
    /// Chunk terminator in partially filled mark-stack chunks.
    pub const NULL: TaskEntry = TaskEntry(0);

    #[inline]
    pub fn from_obj(obj: ObjectRef) -> Self {
        TaskEntry(obj.addr().as_usize())
    }

    #[inline]
    pub fn from_slice(first_unscanned: HeapAddr) -> Self {
        debug_assert!(first_unscanned.is_word_aligned());
        TaskEntry(first_unscanned.as_usize() | SLICE_TAG)
    }

    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub fn is_slice(self) -> bool {
        self.0 & SLICE_TAG != 0
    }

    #[inline]
    pub fn as_obj(self) -> Option<ObjectRef> {
        if self.is_null() || self.is_slice() {
            None
        } else {
            Some(ObjectRef::from_addr_unchecked(HeapAddr::new(self.0)))
        }
    }

    #[inline]
    pub fn as_slice(self) -> Option<HeapAddr> {
        if self.is_slice() {
            Some(HeapAddr::new(self.0 & !SLICE_TAG))
        } else {
            None
        }
    }
}

impl fmt::Debug for TaskEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "TaskEntry::NULL")
        } else if let Some(s) = self.as_slice() {
            write!(f, "TaskEntry::Slice({:#x})", s.as_usize())
        } else {
            write!(f, "TaskEntry::Obj({:#x})", self.0)
        }
    }
}

/// Object layout and field access as seen by the marking engine.
///
/// Field iteration reports the *raw slot value* of every reference slot so
/// the tracer keeps control of null filtering and the transport read check.
pub trait ObjectModel: Send + Sync {
    /// Object size in heap words, header included.
    fn size_in_words(&self, obj: ObjectRef) -> usize;

    /// True for arrays of primitives: no reference slots, never scanned.
    fn is_type_array(&self, obj: ObjectRef) -> bool;

    /// True for arrays of references, candidates for slice-based scanning.
    fn is_obj_array(&self, obj: ObjectRef) -> bool;

    /// Number of reference slots in an object array.
    fn obj_array_len(&self, obj: ObjectRef) -> usize;

    /// Address of reference slot `index` of an object array.
    fn obj_array_slot_addr(&self, obj: ObjectRef, index: usize) -> HeapAddr;

    /// Recover the array whose element storage contains `slice`.
    fn array_containing_slice(&self, slice: HeapAddr) -> ObjectRef;

    /// Invoke `f` with the raw value of every reference slot of `obj`.
    /// For object arrays this visits all elements; large arrays are instead
    /// sliced by the caller and visited via [`Self::for_each_array_slot`].
    fn for_each_field(&self, obj: ObjectRef, f: &mut dyn FnMut(usize));

    /// Invoke `f` with the raw value of array slots `[from, to)`.
    fn for_each_array_slot(&self, obj: ObjectRef, from: usize, to: usize, f: &mut dyn FnMut(usize));

    /// Transport read check: false when the reference's source region has
    /// been decommitted on the CPU server and its contents must be skipped.
    fn source_region_committed(&self, addr: HeapAddr) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_entry_round_trips_objects_and_slices() {
        let obj = ObjectRef::from_addr(HeapAddr::new(0x8000)).unwrap();
        let e = TaskEntry::from_obj(obj);
        assert!(!e.is_slice());
        assert_eq!(e.as_obj(), Some(obj));

        let s = TaskEntry::from_slice(HeapAddr::new(0x8040));
        assert!(s.is_slice());
        assert_eq!(s.as_slice(), Some(HeapAddr::new(0x8040)));
        assert_eq!(s.as_obj(), None);
    }

    #[test]
    fn null_entry_is_distinct() {
        assert!(TaskEntry::NULL.is_null());
        assert_eq!(TaskEntry::NULL.as_obj(), None);
        assert_eq!(TaskEntry::NULL.as_slice(), None);
    }

    #[test]
    fn object_ref_rejects_null_and_misaligned() {
        assert!(ObjectRef::from_addr(HeapAddr::NULL).is_none());
        assert!(ObjectRef::from_addr(HeapAddr::new(0x1001)).is_none());
        assert!(ObjectRef::from_addr(HeapAddr::new(0x1000)).is_some());
    }
}
