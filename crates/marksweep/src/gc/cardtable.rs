//! Card marking and card scanning.
//!
//! Every block carries a card per 512 bytes. The mutator's write barrier
//! dirties the card of each reference store into a major object. During
//! concurrent marking the dirty cards are folded into a per-block mod-union
//! table, which the finishing pause rescans.

use std::sync::atomic::Ordering;

use crate::block::{
    BlockRef, Cards, CARDS_PER_BLOCK, CARD_BITS, CARD_SIZE_IN_BYTES, MAX_SMALL_OBJ_SIZE,
    MS_BLOCK_SKIP,
};
use crate::client::ObjPtr;
use crate::gc::gray::GrayQueue;
use crate::gc::trace::MarkMode;
use crate::heap::MajorHeap;
use crate::metrics::HeapCounters;

/// Which cards a scan reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardSource {
    /// The live cards written by the barrier. Scanned cards are cleaned.
    Live,
    /// The mod-union tables. Only marked objects are scanned.
    ModUnion,
}

impl MajorHeap {
    /// Write barrier for a reference store into a major object.
    ///
    /// # Safety
    ///
    /// `field_addr` must lie inside a block of this heap.
    #[inline]
    pub unsafe fn dirty_card(&self, field_addr: usize) {
        // SAFETY: forwarded from the caller.
        let block = unsafe { BlockRef::containing(field_addr) };
        block.cards().dirty(block.card_index(field_addr));
    }

    /// Stores `value` into word `index` of `obj` and runs the write barrier.
    ///
    /// # Safety
    ///
    /// `obj` must be a live object with at least `index + 1` words.
    pub unsafe fn write_reference(&self, obj: ObjPtr, index: usize, value: Option<ObjPtr>) {
        // SAFETY: forwarded from the caller.
        let field = unsafe { obj.word(index) };
        field.store(value.map_or(0, ObjPtr::addr), Ordering::Release);

        let model = &*self.collab.object_model;
        if !model.in_nursery(obj) && model.size(obj) <= MAX_SMALL_OBJ_SIZE {
            // SAFETY: small major objects live in our blocks.
            unsafe { self.dirty_card(std::ptr::from_ref(field) as usize) };
        }
    }

    /// Marks the mod-union card covering `field_addr`.
    ///
    /// # Safety
    ///
    /// `field_addr` must lie inside a block of this heap.
    pub unsafe fn mark_mod_union_card(&self, field_addr: usize) {
        // SAFETY: forwarded from the caller.
        let block = unsafe { BlockRef::containing(field_addr) };
        if let Some(table) = block.mod_union(true) {
            table.dirty(block.card_index(field_addr));
        }
    }

    /// ORs every block's live cards into its mod-union table.
    pub fn update_cardtable_mod_union(&self) {
        for block in self.block_snapshot() {
            if let Some(table) = block.mod_union(true) {
                block.cards().merge_into(table);
            }
        }
    }

    /// Counts dirty cards as `(live, mod_union)`, or `None` while a sweep is
    /// in progress.
    #[must_use]
    pub fn count_cards(&self) -> Option<(usize, usize)> {
        if self.sweep_in_progress() {
            return None;
        }
        let mut live = 0;
        let mut mod_union = 0;
        for block in self.block_snapshot() {
            if !block.has_references() {
                continue;
            }
            live += block.cards().count_dirty();
            mod_union += block.mod_union(false).map_or(0, Cards::count_dirty);
        }
        Some((live, mod_union))
    }

    /// Scans the objects under every dirty card. Returns the number of
    /// cards scanned.
    ///
    /// Live scans clean the cards they read, so repeating scan-then-drain
    /// until this returns 0 reaches a fixed point.
    ///
    /// # Panics
    ///
    /// Panics outside a major collection.
    pub fn scan_card_table(&self, source: CardSource, mode: MarkMode, queue: &mut GrayQueue) -> usize {
        #[cfg(feature = "tracing")]
        let _span = crate::tracing::internal::trace_phase(crate::tracing::internal::GcPhase::CardScan);

        crate::gc_assert!(
            self.collection_in_progress(),
            "cards are scanned between start_major_collection and sweep"
        );
        let scanned: usize = self
            .block_snapshot()
            .into_iter()
            .filter(|block| block.has_references())
            .map(|block| self.scan_block_cards(block, source, mode, queue))
            .sum();
        HeapCounters::add(&self.counters.cards_scanned, scanned);

        #[cfg(feature = "tracing")]
        tracing::debug!(?source, ?mode, scanned, "card scan finished");

        scanned
    }

    fn scan_block_cards(
        &self,
        block: BlockRef,
        source: CardSource,
        mode: MarkMode,
        queue: &mut GrayQueue,
    ) -> usize {
        let cards = match source {
            CardSource::Live => block.cards(),
            CardSource::ModUnion => match block.mod_union(false) {
                Some(table) => table,
                None => return 0,
            },
        };

        let tracer = self.tracer(mode);
        let obj_size = block.obj_size();
        let count = block.obj_count();
        let small = obj_size < CARD_SIZE_IN_BYTES;
        let header_cards = MS_BLOCK_SKIP >> CARD_BITS;

        let mut scanned = 0;
        let mut scan_front = 0;
        let mut card = cards.next_dirty(0);
        while card < CARDS_PER_BLOCK {
            scanned += 1;
            if !block.state().is_swept_or_marking() {
                self.sweep_block(block);
            }
            if source == CardSource::Live {
                cards.clear(card);
            }

            let card_start = block.start() + (card << CARD_BITS);
            let card_end = card_start + CARD_SIZE_IN_BYTES;
            let mut index = if card <= header_cards {
                0
            } else {
                block.slot_index(card_start)
            };
            let mut next_card = card + 1;

            while index < count {
                let obj = block.slot_addr(index);
                if obj >= card_end {
                    break;
                }
                index += 1;
                if obj < scan_front {
                    continue;
                }
                scan_front = obj + obj_size;
                if !block.slot_is_allocated(obj)
                    || (source == CardSource::ModUnion && !block.is_marked(obj))
                {
                    continue;
                }
                let Some(obj) = ObjPtr::from_addr(obj) else {
                    continue;
                };
                if !small {
                    // Cards wholly inside this object are covered by this
                    // scan; the card holding the next slot's start is not.
                    let next_slot_card = block.card_index(scan_front).min(CARDS_PER_BLOCK);
                    if source == CardSource::Live {
                        for covered in card + 1..next_slot_card {
                            cards.clear(covered);
                        }
                    }
                    next_card = next_slot_card.max(next_card);
                }
                tracer.scan_object(obj, queue);
            }
            card = cards.next_dirty(next_card);
        }
        scanned
    }
}
