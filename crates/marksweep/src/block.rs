//! Major heap blocks.
//!
//! A block is a `MS_BLOCK_SIZE`-aligned chunk of OS memory. Its first
//! `MS_BLOCK_SKIP` bytes hold a [`BlockInfo`] header; the rest is carved into
//! equally sized object slots. Because blocks are aligned to their size, the
//! header of the block containing any interior pointer is found with a mask,
//! the same trick the page headers of a `BiBOP` heap use.
//!
//! Free slots are linked through their own first word. Everything that
//! reinterprets slot memory lives in this module behind `unsafe fn`s; the
//! rest of the crate only sees addresses and [`BlockRef`] handles.

use std::fmt;
use std::mem::size_of;
use std::ops::Deref;
use std::ptr::{self, NonNull};
use std::sync::atomic::{fence, AtomicPtr, AtomicU64, AtomicU8, AtomicUsize, Ordering};

use bitflags::bitflags;

use crate::client::ObjPtr;

// ============================================================================
// Layout constants
// ============================================================================

/// log2 of the block size.
pub const MS_BLOCK_SIZE_SHIFT: usize = 14;
/// Size of a major heap block in bytes.
pub const MS_BLOCK_SIZE: usize = 1 << MS_BLOCK_SIZE_SHIFT;
/// Mask that maps an interior address to its block start.
pub const MS_BLOCK_MASK: usize = !(MS_BLOCK_SIZE - 1);

/// log2 of the object allocation alignment.
pub const ALLOC_ALIGN_BITS: usize = 3;
/// Object allocation alignment.
pub const ALLOC_ALIGN: usize = 1 << ALLOC_ALIGN_BITS;

/// Number of 64-bit mark words needed to give every aligned offset a bit.
pub const MS_NUM_MARK_WORDS: usize = (MS_BLOCK_SIZE >> ALLOC_ALIGN_BITS).div_ceil(64);

/// log2 of the card size.
pub const CARD_BITS: usize = 9;
/// Bytes covered by one card.
pub const CARD_SIZE_IN_BYTES: usize = 1 << CARD_BITS;
/// Cards covering one block.
pub const CARDS_PER_BLOCK: usize = MS_BLOCK_SIZE / CARD_SIZE_IN_BYTES;
/// Cards are bytes packed eight to a word so clean runs can be skipped a word at a time.
pub const CARD_WORDS_PER_BLOCK: usize = CARDS_PER_BLOCK / 8;

/// Header bytes at the start of every block, rounded up to 16.
pub const MS_BLOCK_SKIP: usize = (size_of::<BlockInfo>() + 15) & !15;
/// Bytes available for object slots in every block.
pub const MS_BLOCK_FREE: usize = MS_BLOCK_SIZE - MS_BLOCK_SKIP;

/// Smallest object the runtime ever allocates (vtable word + one field).
pub const MIN_OBJECT_SIZE: usize = 16;
/// Largest object served from blocks; larger ones go to the large object space.
pub const MAX_SMALL_OBJ_SIZE: usize = 8000;

/// Blocks reserved from the OS per batch when the empty pool runs dry.
pub const MS_BLOCK_ALLOC_NUM: usize = 32;

const _: () = assert!(MAX_SMALL_OBJ_SIZE <= MS_BLOCK_FREE / 2);
const _: () = assert!(CARDS_PER_BLOCK % 8 == 0);

// ============================================================================
// Block state
// ============================================================================

/// Per-block lifecycle state.
///
/// ```text
/// SWEPT -> MARKING -> CHECKING -> NEED_SWEEPING -> SWEEPING -> SWEPT
///                         \-> (freed, no live slots)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum BlockState {
    /// Free list is valid, mark bits are clear.
    Swept = 0,
    /// A collection is marking; the free list is still valid.
    Marking = 1,
    /// Exclusively claimed by one thread that counts its live slots.
    Checking = 2,
    /// Has live slots; free list and mark bits are stale.
    NeedSweeping = 3,
    /// Some thread is rebuilding the free list.
    Sweeping = 4,
}

impl BlockState {
    /// Decodes a raw state byte.
    #[must_use]
    pub const fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Swept),
            1 => Some(Self::Marking),
            2 => Some(Self::Checking),
            3 => Some(Self::NeedSweeping),
            4 => Some(Self::Sweeping),
            _ => None,
        }
    }

    /// Whether the state machine permits moving from `self` to `to`.
    #[must_use]
    pub const fn is_valid_transition(self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::Swept, Self::Marking)
                | (Self::Marking, Self::Checking)
                | (Self::Checking, Self::NeedSweeping)
                | (Self::NeedSweeping, Self::Sweeping)
                | (Self::Sweeping, Self::Swept)
        )
    }

    /// The block's free list may be read without sweeping it first.
    #[must_use]
    pub const fn is_swept_or_marking(self) -> bool {
        matches!(self, Self::Swept | Self::Marking)
    }
}

bitflags! {
    /// Per-block flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BlockFlags: u8 {
        /// Block serves pinned allocations.
        const PINNED = 1 << 0;
        /// Objects in this block may hold references.
        const HAS_REFERENCES = 1 << 1;
        /// Some object was pinned during the current collection.
        const HAS_PINNED = 1 << 2;
        /// Allocated while a major collection was running.
        const IS_TO_SPACE = 1 << 3;
    }
}

// ============================================================================
// Cards
// ============================================================================

/// One byte per card, packed into words.
///
/// The write barrier dirties a card by setting its byte; scanners test whole
/// words to skip clean runs.
#[derive(Debug)]
#[repr(C)]
pub struct Cards {
    words: [AtomicU64; CARD_WORDS_PER_BLOCK],
}

impl Cards {
    /// All cards clean.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            words: [const { AtomicU64::new(0) }; CARD_WORDS_PER_BLOCK],
        }
    }

    #[inline]
    const fn lane(card: usize) -> (usize, u64) {
        (card / 8, 0xff << ((card % 8) * 8))
    }

    /// Marks `card` dirty.
    #[inline]
    pub fn dirty(&self, card: usize) {
        let (word, lane) = Self::lane(card);
        self.words[word].fetch_or(lane, Ordering::Relaxed);
    }

    /// Whether `card` is dirty.
    #[inline]
    #[must_use]
    pub fn is_dirty(&self, card: usize) -> bool {
        let (word, lane) = Self::lane(card);
        self.words[word].load(Ordering::Relaxed) & lane != 0
    }

    /// Cleans `card`.
    #[inline]
    pub fn clear(&self, card: usize) {
        let (word, lane) = Self::lane(card);
        self.words[word].fetch_and(!lane, Ordering::Relaxed);
    }

    /// Index of the first dirty card at or after `from`, or `CARDS_PER_BLOCK`.
    ///
    /// Clean words are skipped eight cards at a time.
    #[must_use]
    pub fn next_dirty(&self, from: usize) -> usize {
        let mut card = from;
        while card < CARDS_PER_BLOCK {
            let word_index = card / 8;
            let shift = (card % 8) * 8;
            let word = self.words[word_index].load(Ordering::Relaxed) >> shift;
            if word != 0 {
                return card + word.trailing_zeros() as usize / 8;
            }
            card = (word_index + 1) * 8;
        }
        CARDS_PER_BLOCK
    }

    /// Number of dirty cards.
    #[must_use]
    pub fn count_dirty(&self) -> usize {
        (0..CARDS_PER_BLOCK).filter(|&card| self.is_dirty(card)).count()
    }

    /// ORs every dirty card of `self` into `target`.
    pub fn merge_into(&self, target: &Self) {
        for (src, dst) in self.words.iter().zip(&target.words) {
            let bits = src.load(Ordering::Relaxed);
            if bits != 0 {
                dst.fetch_or(bits, Ordering::Relaxed);
            }
        }
    }
}

impl Default for Cards {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// BlockInfo - header at the start of every block
// ============================================================================

/// Metadata stored at the start of each block.
#[repr(C)]
pub struct BlockInfo {
    obj_size: u16,
    obj_size_index: u16,
    state: AtomicU8,
    flags: AtomicU8,
    /// Address of the first free slot, or 0.
    free_list: AtomicUsize,
    /// Next block in the same free-block list.
    next_free: AtomicPtr<BlockInfo>,
    /// Lazily allocated shadow card table, see [`BlockInfo::mod_union`].
    mod_union: AtomicPtr<Cards>,
    cards: Cards,
    mark_words: [AtomicU64; MS_NUM_MARK_WORDS],
}

/// A handle to the header of a live block.
///
/// Handles are plain pointers. They stay valid while the block is in the
/// heap's allocated set or the empty-block pool, which for every handle the
/// crate creates is as long as the owning heap is alive.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockRef(NonNull<BlockInfo>);

unsafe impl Send for BlockRef {}
unsafe impl Sync for BlockRef {}

impl Deref for BlockRef {
    type Target = BlockInfo;

    #[inline]
    fn deref(&self) -> &BlockInfo {
        // SAFETY: handles only exist for initialized blocks of a live heap.
        unsafe { self.0.as_ref() }
    }
}

impl fmt::Debug for BlockRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Block")
            .field("start", &format_args!("{:#x}", self.start()))
            .field("obj_size", &self.obj_size())
            .field("state", &self.state())
            .field("flags", &self.flags())
            .finish()
    }
}

impl BlockRef {
    /// Initializes a block header in fresh (zeroed) block memory and threads
    /// every slot onto its free list in address order.
    ///
    /// # Safety
    ///
    /// `start` must be `MS_BLOCK_SIZE` bytes of writable, block-aligned
    /// memory that no other thread can observe.
    pub unsafe fn init(
        start: NonNull<u8>,
        obj_size: usize,
        obj_size_index: usize,
        flags: BlockFlags,
        state: BlockState,
    ) -> Self {
        debug_assert_eq!(start.as_ptr() as usize & !MS_BLOCK_MASK, 0);
        debug_assert!(obj_size <= MAX_SMALL_OBJ_SIZE && obj_size % ALLOC_ALIGN == 0);

        let info = start.cast::<BlockInfo>();
        #[allow(clippy::cast_possible_truncation)]
        // SAFETY: the caller hands us exclusive, aligned block memory.
        unsafe {
            ptr::write(
                info.as_ptr(),
                BlockInfo {
                    obj_size: obj_size as u16,
                    obj_size_index: obj_size_index as u16,
                    state: AtomicU8::new(state as u8),
                    flags: AtomicU8::new(flags.bits()),
                    free_list: AtomicUsize::new(0),
                    next_free: AtomicPtr::new(ptr::null_mut()),
                    mod_union: AtomicPtr::new(ptr::null_mut()),
                    cards: Cards::new(),
                    mark_words: [const { AtomicU64::new(0) }; MS_NUM_MARK_WORDS],
                },
            );
        }
        let block = Self(info);

        let count = block.obj_count();
        let mut next = 0;
        for index in (0..count).rev() {
            let slot = block.slot_addr(index);
            // SAFETY: `slot` is inside the block we exclusively own.
            unsafe { slot_word(slot, 0).store(next, Ordering::Relaxed) };
            next = slot;
        }
        block.free_list.store(next, Ordering::Release);
        block
    }

    /// Header of the block containing `addr`.
    ///
    /// # Safety
    ///
    /// `addr` must point into an initialized block of a live heap.
    #[inline]
    #[must_use]
    pub unsafe fn containing(addr: usize) -> Self {
        // SAFETY: block starts are never null for addresses inside a block.
        Self(unsafe { NonNull::new_unchecked((addr & MS_BLOCK_MASK) as *mut BlockInfo) })
    }

    /// Header of the block containing `obj`.
    ///
    /// # Safety
    ///
    /// `obj` must live in an initialized block of a live heap.
    #[inline]
    #[must_use]
    pub unsafe fn for_object(obj: ObjPtr) -> Self {
        unsafe { Self::containing(obj.addr()) }
    }

    /// Raw header pointer, for intrusive block lists.
    #[inline]
    #[must_use]
    pub const fn as_ptr(self) -> *mut BlockInfo {
        self.0.as_ptr()
    }

    /// Rebuilds a handle from a pointer produced by [`BlockRef::as_ptr`].
    #[inline]
    #[must_use]
    pub fn from_ptr(ptr: *mut BlockInfo) -> Option<Self> {
        NonNull::new(ptr).map(Self)
    }

    /// Address of the first byte of the block (and of its header).
    #[inline]
    #[must_use]
    pub fn start(self) -> usize {
        self.0.as_ptr() as usize
    }

    /// Whether `addr` falls inside this block's slot area.
    #[inline]
    #[must_use]
    pub fn contains(self, addr: usize) -> bool {
        addr >= self.start() + MS_BLOCK_SKIP && addr < self.start() + MS_BLOCK_SIZE
    }

    /// Number of slots in the block.
    #[inline]
    #[must_use]
    pub fn obj_count(self) -> usize {
        MS_BLOCK_FREE / self.obj_size()
    }

    /// Address of slot `index`.
    #[inline]
    #[must_use]
    pub fn slot_addr(self, index: usize) -> usize {
        self.start() + MS_BLOCK_SKIP + index * self.obj_size()
    }

    /// Slot index of an address inside the slot area.
    #[inline]
    #[must_use]
    pub fn slot_index(self, addr: usize) -> usize {
        (addr - (self.start() + MS_BLOCK_SKIP)) / self.obj_size()
    }

    /// Whether the slot at `slot` holds an allocated object.
    ///
    /// Allocated slots start with a vtable word that points outside the
    /// block; free slots start with 0 or a link to another slot of this block.
    #[inline]
    #[must_use]
    pub fn slot_is_allocated(self, slot: usize) -> bool {
        // SAFETY: `slot` is a slot address of this block.
        let word = unsafe { slot_word(slot, 0).load(Ordering::Acquire) };
        word != 0 && (word & MS_BLOCK_MASK) != self.start()
    }
}

impl BlockInfo {
    /// Size of every slot in bytes.
    #[inline]
    #[must_use]
    pub fn obj_size(&self) -> usize {
        usize::from(self.obj_size)
    }

    /// Index of the block's size class.
    #[inline]
    #[must_use]
    pub fn obj_size_index(&self) -> usize {
        usize::from(self.obj_size_index)
    }

    // ------------------------------------------------------------------
    // State
    // ------------------------------------------------------------------

    /// Current lifecycle state.
    ///
    /// # Panics
    ///
    /// Panics if the state byte is corrupted.
    #[inline]
    #[must_use]
    pub fn state(&self) -> BlockState {
        let raw = self.state.load(Ordering::Acquire);
        BlockState::from_u8(raw).unwrap_or_else(|| {
            crate::gc_fatal!("illegal block state {raw} in block {:p}", self)
        })
    }

    /// Moves `from -> to`, asserting that the block was in `from`.
    ///
    /// # Panics
    ///
    /// Panics if the transition is not part of the state graph or the block
    /// was not in `from`.
    pub fn set_state(&self, from: BlockState, to: BlockState) {
        crate::gc_assert!(
            from.is_valid_transition(to),
            "illegal block transition {from:?} -> {to:?}"
        );
        let current = self.state();
        crate::gc_assert!(
            current == from,
            "block {:p} expected in {from:?} but is {current:?}",
            self
        );
        self.state.store(to as u8, Ordering::Release);
    }

    /// Atomically moves `from -> to`; returns whether this thread won.
    pub fn cas_state(&self, from: BlockState, to: BlockState) -> bool {
        debug_assert!(from.is_valid_transition(to));
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    // ------------------------------------------------------------------
    // Flags
    // ------------------------------------------------------------------

    /// Current flag set.
    #[inline]
    #[must_use]
    pub fn flags(&self) -> BlockFlags {
        BlockFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    #[inline]
    fn set_flag(&self, flag: BlockFlags, on: bool) {
        if on {
            self.flags.fetch_or(flag.bits(), Ordering::AcqRel);
        } else {
            self.flags.fetch_and(!flag.bits(), Ordering::AcqRel);
        }
    }

    /// Block serves pinned allocations.
    #[inline]
    #[must_use]
    pub fn pinned(&self) -> bool {
        self.flags().contains(BlockFlags::PINNED)
    }

    /// Objects in this block may hold references.
    #[inline]
    #[must_use]
    pub fn has_references(&self) -> bool {
        self.flags().contains(BlockFlags::HAS_REFERENCES)
    }

    /// Some object in the block is pinned for the current collection.
    #[inline]
    #[must_use]
    pub fn has_pinned(&self) -> bool {
        self.flags().contains(BlockFlags::HAS_PINNED)
    }

    /// Sets or clears `has_pinned`.
    pub fn set_has_pinned(&self, on: bool) {
        self.set_flag(BlockFlags::HAS_PINNED, on);
    }

    /// Block was allocated during the running major collection.
    #[inline]
    #[must_use]
    pub fn is_to_space(&self) -> bool {
        self.flags().contains(BlockFlags::IS_TO_SPACE)
    }

    /// Sets or clears `is_to_space`.
    pub fn set_to_space(&self, on: bool) {
        self.set_flag(BlockFlags::IS_TO_SPACE, on);
    }

    // ------------------------------------------------------------------
    // Mark bits
    // ------------------------------------------------------------------

    #[inline]
    fn mark_bit(&self, addr: usize) -> (usize, u64) {
        let index = (addr - ptr::from_ref(self) as usize) >> ALLOC_ALIGN_BITS;
        (index >> 6, 1 << (index & 63))
    }

    /// Whether the object starting at `addr` is marked.
    #[inline]
    #[must_use]
    pub fn is_marked(&self, addr: usize) -> bool {
        let (word, bit) = self.mark_bit(addr);
        self.mark_words[word].load(Ordering::Relaxed) & bit != 0
    }

    /// Marks the object starting at `addr`; returns `true` if it was unmarked.
    #[inline]
    pub fn set_mark(&self, addr: usize) -> bool {
        let (word, bit) = self.mark_bit(addr);
        self.mark_words[word].fetch_or(bit, Ordering::Relaxed) & bit == 0
    }

    /// Clears the mark of the object starting at `addr`.
    #[inline]
    pub fn clear_mark(&self, addr: usize) {
        let (word, bit) = self.mark_bit(addr);
        self.mark_words[word].fetch_and(!bit, Ordering::Relaxed);
    }

    /// Number of marked objects. Each object owns exactly one bit.
    #[must_use]
    pub fn count_marked(&self) -> usize {
        self.mark_words
            .iter()
            .map(|w| w.load(Ordering::Relaxed).count_ones() as usize)
            .sum()
    }

    /// Whether no mark bit is set.
    #[must_use]
    pub fn marks_are_clear(&self) -> bool {
        self.mark_words
            .iter()
            .all(|w| w.load(Ordering::Relaxed) == 0)
    }

    /// Clears every mark bit.
    pub fn clear_marks(&self) {
        for word in &self.mark_words {
            word.store(0, Ordering::Relaxed);
        }
    }

    // ------------------------------------------------------------------
    // Free lists
    // ------------------------------------------------------------------

    /// Address of the first free slot, or 0.
    #[inline]
    #[must_use]
    pub fn free_list_head(&self) -> usize {
        self.free_list.load(Ordering::Acquire)
    }

    /// Pops one slot from the block's free list.
    ///
    /// Returns `None` when the list is empty; otherwise the slot and whether
    /// it was the last one. Concurrent poppers race through a CAS on the head.
    /// Slots only return to the list while the block is being swept or during
    /// single-threaded teardown, so a popped slot cannot reappear under a
    /// racing pop.
    pub fn pop_free_slot(&self) -> Option<(usize, bool)> {
        let mut head = self.free_list.load(Ordering::Acquire);
        loop {
            if head == 0 {
                return None;
            }
            // SAFETY: `head` is a free slot of this block.
            let next = unsafe { slot_word(head, 0).load(Ordering::Acquire) };
            match self
                .free_list
                .compare_exchange_weak(head, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Some((head, next == 0)),
                Err(actual) => head = actual,
            }
        }
    }

    /// Pushes `slot` onto the free list; returns `true` if the list was empty.
    ///
    /// # Safety
    ///
    /// `slot` must be a slot of this block that nothing references anymore.
    pub unsafe fn push_free_slot(&self, slot: usize) -> bool {
        let mut head = self.free_list.load(Ordering::Acquire);
        loop {
            // SAFETY: the caller gives up the slot.
            unsafe { slot_word(slot, 0).store(head, Ordering::Relaxed) };
            match self
                .free_list
                .compare_exchange_weak(head, slot, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return head == 0,
                Err(actual) => head = actual,
            }
        }
    }

    /// Swings the free list head from `current` to `new`.
    #[inline]
    pub(crate) fn cas_free_list(&self, current: usize, new: usize) -> bool {
        self.free_list
            .compare_exchange(current, new, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Replaces the free list with `head`, a chain already linked through
    /// the slots.
    pub(crate) fn set_free_list(&self, head: usize) {
        self.free_list.store(head, Ordering::Release);
    }

    /// Iterates the addresses on the free list.
    ///
    /// Only meaningful while no other thread mutates the list.
    pub fn free_slots(&self) -> impl Iterator<Item = usize> + '_ {
        let mut cursor = self.free_list_head();
        std::iter::from_fn(move || {
            if cursor == 0 {
                return None;
            }
            let slot = cursor;
            // SAFETY: every link on the list is a slot of this block.
            cursor = unsafe { slot_word(slot, 0).load(Ordering::Acquire) };
            Some(slot)
        })
    }

    /// Next block in the free-block list.
    #[inline]
    #[must_use]
    pub fn next_free(&self) -> *mut Self {
        self.next_free.load(Ordering::Acquire)
    }

    /// Sets the next block in the free-block list.
    #[inline]
    pub fn set_next_free(&self, next: *mut Self) {
        self.next_free.store(next, Ordering::Release);
    }

    // ------------------------------------------------------------------
    // Cards
    // ------------------------------------------------------------------

    /// The live card table of this block, written by the mutator barrier.
    #[inline]
    #[must_use]
    pub const fn cards(&self) -> &Cards {
        &self.cards
    }

    /// Card index for an address inside this block.
    #[inline]
    #[must_use]
    pub fn card_index(&self, addr: usize) -> usize {
        (addr - ptr::from_ref(self) as usize) >> CARD_BITS
    }

    /// The mod-union table, allocating it on first use when `allocate` is set.
    ///
    /// Allocation races are resolved with a CAS; the loser frees its table.
    pub fn mod_union(&self, allocate: bool) -> Option<&Cards> {
        let mut table = self.mod_union.load(Ordering::Acquire);
        if table.is_null() && allocate {
            let fresh = Box::into_raw(Box::new(Cards::new()));
            match self.mod_union.compare_exchange(
                ptr::null_mut(),
                fresh,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => table = fresh,
                Err(winner) => {
                    // SAFETY: `fresh` was never published.
                    drop(unsafe { Box::from_raw(fresh) });
                    table = winner;
                }
            }
        }
        // SAFETY: published tables live until `free_mod_union`, which only
        // runs while no scanner holds a reference.
        unsafe { table.as_ref() }
    }

    /// Frees the mod-union table.
    pub fn free_mod_union(&self) {
        let table = self.mod_union.swap(ptr::null_mut(), Ordering::AcqRel);
        if !table.is_null() {
            // SAFETY: the table was created by `Box::into_raw` in `mod_union`.
            drop(unsafe { Box::from_raw(table) });
        }
    }
}

// ============================================================================
// Slot memory access
// ============================================================================

/// Atomic view of word `index` of the object or slot at `addr`.
///
/// Slot words are read by markers and card scanners while the mutator may
/// be writing them, so every access goes through an atomic.
///
/// # Safety
///
/// `addr + index * 8` must be an aligned word inside memory that stays
/// mapped for the returned lifetime.
#[inline]
#[must_use]
pub unsafe fn slot_word<'a>(addr: usize, index: usize) -> &'a AtomicUsize {
    unsafe { &*((addr + index * size_of::<usize>()) as *const AtomicUsize) }
}

/// Zeroes `len` bytes of a dead slot.
///
/// # Safety
///
/// The slot must be unreachable and not concurrently accessed.
pub unsafe fn zero_slot(addr: usize, len: usize) {
    unsafe { ptr::write_bytes(addr as *mut u8, 0, len) };
}

/// Copies an object body (everything after the vtable word).
///
/// # Safety
///
/// Both ranges must be valid for `size` bytes, must not overlap, and the
/// source must not be mutated concurrently.
pub unsafe fn copy_object_body(from: usize, to: usize, size: usize) {
    let header = size_of::<usize>();
    if size > header {
        unsafe {
            ptr::copy_nonoverlapping(
                (from + header) as *const u8,
                (to + header) as *mut u8,
                size - header,
            );
        }
    }
}

/// Publishes all plain and relaxed writes made so far (mark bits, rebuilt
/// free lists) before a following state store.
#[inline]
pub fn write_fence() {
    fence(Ordering::Release);
}
