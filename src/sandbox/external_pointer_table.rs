//! The table of external pointers.
//!
//! Managed objects never store raw pointers to memory outside the heap. They store a 32-bit
//! [`ExternalPointerHandle`] instead, which indexes this table. Each entry carries the pointer
//! together with a type tag, and a pointer can only be read back with the tag it was stored
//! with. Reading with any other tag leaves tag bits set and yields a non-canonical address.
//!
//! The garbage collector marks the entries referenced from live objects and then sweeps each
//! space, rebuilding its freelist. A space can also be compacted: entries in its topmost
//! segments are evacuated into free entries further down during marking, so that the top
//! segments become empty and can be freed.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use static_assertions::{const_assert, const_assert_eq};

use crate::sandbox::entity_table::{ExternalEntityTable, Space, TableEntry};
use crate::sandbox::freelist::FreelistHead;
use crate::sandbox::segment::Segment;
use crate::sandbox::vas::{FatalOutOfMemoryHandler, PlatformAddressSpace};
use crate::util::constants::*;
use crate::util::options::Options;
use crate::util::Address;

/// A 32-bit reference into an [`ExternalPointerTable`]. Zero is the null handle.
pub type ExternalPointerHandle = u32;

/// The null handle. It refers to the read-only null entry.
pub const NULL_EXTERNAL_POINTER_HANDLE: ExternalPointerHandle = 0;

const TAG_SHIFT: u32 = 48;
const TAG_MASK: u64 = 0xffff << TAG_SHIFT;
const POINTER_MASK: u64 = !TAG_MASK;
const MARK_BIT: u64 = 1 << 62;
const SHARED_BIT: u64 = 1 << 63;

/// The type tag of an external pointer, stored in the top 16 bits of an entry.
///
/// Every tag that can be attached to a pointer has the mark bit set. Storing a pointer
/// therefore also marks its entry, which keeps entries written during marking alive.
/// Tags with the shared bit refer to entries of the shared table.
#[repr(transparent)]
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct ExternalPointerTag(u64);

impl ExternalPointerTag {
    pub const NULL: Self = Self(0);

    pub const FOREIGN: Self = Self::pointer(0x01);
    pub const EMBEDDER_DATA_SLOT: Self = Self::pointer(0x02);
    pub const ARRAY_BUFFER_EXTENSION: Self = Self::pointer(0x03);
    pub const EXTERNAL_STRING_RESOURCE: Self = Self::pointer(0x04);
    pub const WASM_INSTANCE: Self = Self::pointer(0x05);

    pub const SHARED_STRING_RESOURCE: Self = Self::shared(0x01);
    pub const SHARED_WAITER_QUEUE: Self = Self::shared(0x02);

    /// Tags a free entry. The mark bit is clear, so free entries are never live.
    pub const FREE_ENTRY: Self = Self(0x3f7f << TAG_SHIFT);
    /// Tags an evacuation entry. The mark bit is clear.
    pub const EVACUATION_ENTRY: Self = Self(0x3f7e << TAG_SHIFT);

    const fn pointer(id: u64) -> Self {
        Self(MARK_BIT | (id << TAG_SHIFT))
    }

    const fn shared(id: u64) -> Self {
        Self(SHARED_BIT | MARK_BIT | (id << TAG_SHIFT))
    }

    pub const fn is_shared(self) -> bool {
        self.0 & SHARED_BIT != 0
    }

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    const fn can_tag_pointers(self) -> bool {
        self.0 & MARK_BIT != 0
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl std::fmt::Debug for ExternalPointerTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ExternalPointerTag({:#06x})", self.0 >> TAG_SHIFT)
    }
}

/// The 64-bit content of an entry.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
struct Payload(u64);

impl Payload {
    fn new(value: u64, tag: ExternalPointerTag) -> Self {
        Self(value | tag.0)
    }

    fn untag(self, tag: ExternalPointerTag) -> Address {
        let raw = self.0 & !(tag.0 | MARK_BIT);
        unsafe { Address::from_usize(raw as usize) }
    }

    fn is_tagged_with(self, tag: ExternalPointerTag) -> bool {
        self.0 & TAG_MASK == tag.0
    }

    fn has_mark_bit_set(self) -> bool {
        self.0 & MARK_BIT != 0
    }

    fn set_mark_bit(&mut self) {
        self.0 |= MARK_BIT;
    }

    fn clear_mark_bit(&mut self) {
        self.0 &= !MARK_BIT;
    }

    fn contains_freelist_link(self) -> bool {
        self.is_tagged_with(ExternalPointerTag::FREE_ENTRY)
    }

    fn contains_evacuation_entry(self) -> bool {
        self.is_tagged_with(ExternalPointerTag::EVACUATION_ENTRY)
    }

    fn contains_external_pointer(self) -> bool {
        !self.contains_freelist_link() && !self.contains_evacuation_entry()
    }

    fn extract_freelist_link(self) -> u32 {
        self.0 as u32
    }

    fn extract_evacuation_entry_handle_location(self) -> Address {
        unsafe { Address::from_usize((self.0 & POINTER_MASK) as usize) }
    }
}

/// An entry of the external pointer table: a pointer and its tag, a freelist link, or an
/// evacuation entry that records where the handle of an entry being moved lives.
#[repr(transparent)]
pub struct ExternalPointerTableEntry {
    payload: AtomicU64,
}

const_assert_eq!(std::mem::size_of::<ExternalPointerTableEntry>(), 8);

// All-zero is the null entry: a null pointer with the null tag.
unsafe impl bytemuck::Zeroable for ExternalPointerTableEntry {}

impl ExternalPointerTableEntry {
    fn load(&self) -> Payload {
        Payload(self.payload.load(Ordering::Relaxed))
    }

    fn store(&self, payload: Payload) {
        self.payload.store(payload.0, Ordering::Relaxed)
    }

    fn check_pointer(value: Address, tag: ExternalPointerTag) {
        debug_assert_eq!(
            value.as_usize() as u64 & TAG_MASK,
            0,
            "{} has tag bits set",
            value
        );
        debug_assert!(tag.can_tag_pointers(), "{:?} cannot tag a pointer", tag);
    }

    pub fn make_external_pointer_entry(&self, value: Address, tag: ExternalPointerTag) {
        Self::check_pointer(value, tag);
        self.store(Payload::new(value.as_usize() as u64, tag));
    }

    pub fn get_external_pointer(&self, tag: ExternalPointerTag) -> Address {
        let payload = self.load();
        debug_assert!(payload.contains_external_pointer());
        payload.untag(tag)
    }

    pub fn set_external_pointer(&self, value: Address, tag: ExternalPointerTag) {
        Self::check_pointer(value, tag);
        debug_assert!(self.load().contains_external_pointer());
        self.store(Payload::new(value.as_usize() as u64, tag));
    }

    /// Store a new pointer and return the old one, untagged with the same tag.
    pub fn exchange_external_pointer(&self, value: Address, tag: ExternalPointerTag) -> Address {
        Self::check_pointer(value, tag);
        let new_payload = Payload::new(value.as_usize() as u64, tag);
        let old_payload = Payload(self.payload.swap(new_payload.0, Ordering::Relaxed));
        debug_assert!(old_payload.contains_external_pointer());
        old_payload.untag(tag)
    }

    /// Does this entry hold a pointer with `tag`, regardless of its mark bit?
    pub fn has_external_pointer(&self, tag: ExternalPointerTag) -> bool {
        let payload = self.load();
        payload.contains_external_pointer() && (payload.0 & TAG_MASK) | MARK_BIT == tag.0
    }

    pub fn make_evacuation_entry(&self, handle_location: Address) {
        self.store(Payload::new(
            handle_location.as_usize() as u64,
            ExternalPointerTag::EVACUATION_ENTRY,
        ));
    }

    /// Set the mark bit.
    pub fn mark(&self) {
        let old_payload = self.load();
        debug_assert!(old_payload.contains_external_pointer());
        let mut new_payload = old_payload;
        new_payload.set_mark_bit();

        // No loop: if the CAS fails, a mutator stored a new pointer in the meantime, and
        // every pointer tag carries the mark bit.
        let result = self.payload.compare_exchange(
            old_payload.0,
            new_payload.0,
            Ordering::Relaxed,
            Ordering::Relaxed,
        );
        if let Err(current) = result {
            debug_assert!(Payload(current).has_mark_bit_set());
        }
    }

    fn is_marked(&self) -> bool {
        self.load().has_mark_bit_set()
    }

    /// Copy the pointer into `other` with the mark bit cleared.
    fn unmark_and_migrate_into(&self, other: &ExternalPointerTableEntry) {
        let mut payload = self.load();
        debug_assert!(payload.contains_external_pointer());
        payload.clear_mark_bit();
        other.store(payload);

        // Clobber the old entry so that any remaining user of it stands out.
        #[cfg(debug_assertions)]
        self.store(Payload::new(POINTER_MASK, ExternalPointerTag::NULL));
    }
}

impl TableEntry for ExternalPointerTableEntry {
    fn make_freelist_entry(&self, next_entry_index: u32) {
        let payload = Payload::new(next_entry_index as u64, ExternalPointerTag::FREE_ENTRY);
        self.store(payload);
    }

    fn next_freelist_entry_index(&self) -> u32 {
        self.load().extract_freelist_link()
    }
}

/// The start of the evacuation area when a space is not being compacted.
const NOT_COMPACTING_MARKER: u32 = u32::MAX;
/// Or-ed into the start of the evacuation area when compaction is aborted. Indices never
/// reach this bit, so the original start can still be recovered.
const COMPACTION_ABORTED_MARKER: u32 = 0xf000_0000;

const_assert!(MAX_EXTERNAL_POINTERS <= COMPACTION_ABORTED_MARKER as usize);

/// The freelist head while a space is being swept. Any allocation trips over it.
const ENTRY_ALLOCATION_IS_FORBIDDEN_MARKER: FreelistHead = FreelistHead::new(u32::MAX, u32::MAX);

/// A space of the external pointer table, with compaction state.
pub struct ExternalPointerSpace {
    space: Space,
    /// The index of the first entry to evacuate, [`NOT_COMPACTING_MARKER`] when not
    /// compacting, possibly with [`COMPACTION_ABORTED_MARKER`] set.
    start_of_evacuation_area: AtomicU32,
}

impl ExternalPointerSpace {
    pub fn new() -> Self {
        Self {
            space: Space::new(),
            start_of_evacuation_area: AtomicU32::new(NOT_COMPACTING_MARKER),
        }
    }

    delegate::delegate! {
        to self.space {
            pub fn freelist_length(&self) -> u32;
            pub fn num_segments(&self) -> usize;
            pub fn capacity(&self) -> usize;
            pub fn contains(&self, index: u32) -> bool;
        }
    }

    pub fn is_compacting(&self) -> bool {
        self.start_of_evacuation_area.load(Ordering::Relaxed) != NOT_COMPACTING_MARKER
    }

    pub fn compacting_was_aborted(&self) -> bool {
        let value = self.start_of_evacuation_area.load(Ordering::Relaxed);
        value != NOT_COMPACTING_MARKER
            && value & COMPACTION_ABORTED_MARKER == COMPACTION_ABORTED_MARKER
    }

    /// The first entry index of the evacuation area, if compacting.
    pub fn start_of_evacuation_area(&self) -> Option<u32> {
        match self.start_of_evacuation_area.load(Ordering::Relaxed) {
            NOT_COMPACTING_MARKER => None,
            value => Some(value & !COMPACTION_ABORTED_MARKER),
        }
    }

    fn start_compacting(&self, start_of_evacuation_area: u32) {
        self.start_of_evacuation_area
            .store(start_of_evacuation_area, Ordering::Relaxed);
    }

    fn stop_compacting(&self) {
        self.start_of_evacuation_area
            .store(NOT_COMPACTING_MARKER, Ordering::Relaxed);
    }

    fn abort_compacting(&self, start_of_evacuation_area: u32) {
        let aborted = start_of_evacuation_area | COMPACTION_ABORTED_MARKER;
        debug_assert_ne!(aborted, NOT_COMPACTING_MARKER);
        if !self.compacting_was_aborted() {
            debug!(
                "Aborted compaction of external pointer space at entry {}",
                start_of_evacuation_area
            );
        }
        self.start_of_evacuation_area
            .store(aborted, Ordering::Relaxed);
    }
}

impl Default for ExternalPointerSpace {
    fn default() -> Self {
        Self::new()
    }
}

/// The external pointer table. Most operations take the space to allocate from or to mark in.
pub struct ExternalPointerTable {
    table: ExternalEntityTable<ExternalPointerTableEntry>,
    compaction_enabled: bool,
}

impl ExternalPointerTable {
    pub fn new(options: &Options) -> Self {
        Self {
            table: ExternalEntityTable::new(
                "external_pointer",
                ENTITY_TABLE_SEGMENT_SIZE,
                EXTERNAL_POINTER_TABLE_RESERVATION_SIZE,
            )
            .use_emulated_subspace(options.entity_table_use_emulated_subspace),
            compaction_enabled: options.external_pointer_table_compaction,
        }
    }

    pub fn oom_handler(self, oom_handler: FatalOutOfMemoryHandler) -> Self {
        Self {
            table: self.table.oom_handler(oom_handler),
            ..self
        }
    }

    delegate::delegate! {
        to self.table {
            pub fn initialize(&mut self);
            pub fn initialize_with(&mut self, root: &dyn PlatformAddressSpace);
            pub fn tear_down(&mut self);
            pub fn is_initialized(&self) -> bool;
            pub fn is_emulated(&self) -> bool;
            pub fn base(&self) -> Address;
        }
    }

    pub fn initialize_space(&self, space: &ExternalPointerSpace) {
        self.table.initialize_space(&space.space);
    }

    pub fn tear_down_space(&self, space: &ExternalPointerSpace) {
        self.table.tear_down_space(&space.space);
        space.stop_compacting();
    }

    pub fn entries_per_segment(&self) -> u32 {
        self.table.layout().entries_per_segment()
    }

    /// Allocate an entry in `space` holding `initial_value` and return its handle.
    pub fn allocate_and_initialize_entry(
        &self,
        space: &ExternalPointerSpace,
        initial_value: Address,
        tag: ExternalPointerTag,
    ) -> ExternalPointerHandle {
        let index = self.table.allocate_entry(&space.space);
        self.table
            .at(index)
            .make_external_pointer_entry(initial_value, tag);

        // An entry allocated inside the evacuation area would be freed with its segment at the
        // end of compaction. This also catches allocations from a segment added by `extend`.
        let start_of_evacuation_area = space.start_of_evacuation_area.load(Ordering::Relaxed);
        if index >= start_of_evacuation_area {
            space.abort_compacting(start_of_evacuation_area & !COMPACTION_ABORTED_MARKER);
        }

        index_to_handle(index)
    }

    pub fn get(&self, handle: ExternalPointerHandle, tag: ExternalPointerTag) -> Address {
        self.table
            .at(handle_to_index(handle))
            .get_external_pointer(tag)
    }

    pub fn set(&self, handle: ExternalPointerHandle, value: Address, tag: ExternalPointerTag) {
        debug_assert_ne!(handle, NULL_EXTERNAL_POINTER_HANDLE);
        self.table
            .at(handle_to_index(handle))
            .set_external_pointer(value, tag)
    }

    pub fn exchange(
        &self,
        handle: ExternalPointerHandle,
        value: Address,
        tag: ExternalPointerTag,
    ) -> Address {
        debug_assert_ne!(handle, NULL_EXTERNAL_POINTER_HANDLE);
        self.table
            .at(handle_to_index(handle))
            .exchange_external_pointer(value, tag)
    }

    pub fn has_external_pointer(
        &self,
        handle: ExternalPointerHandle,
        tag: ExternalPointerTag,
    ) -> bool {
        self.table
            .at(handle_to_index(handle))
            .has_external_pointer(tag)
    }

    /// Mark the entry referenced by `handle`, which was loaded from `handle_location`.
    ///
    /// If the space is being compacted and the entry lies in the evacuation area, a free
    /// entry below the area is claimed and turned into an evacuation entry that remembers
    /// `handle_location`. The next sweep moves the pointer there and rewrites the handle.
    /// `handle_location` must therefore stay valid until the space has been swept.
    pub fn mark(
        &self,
        space: &ExternalPointerSpace,
        handle: ExternalPointerHandle,
        handle_location: &AtomicU32,
    ) {
        debug_assert!(space.space.belongs_to(self.table.id()));
        // The null entry is immortal.
        if handle == NULL_EXTERNAL_POINTER_HANDLE {
            return;
        }

        assert_eq!(
            handle,
            handle_location.load(Ordering::Acquire),
            "handle does not match its location"
        );

        let index = handle_to_index(handle);
        assert!(
            space.contains(index),
            "entry {} is not in the marked space",
            index
        );

        self.maybe_create_evacuation_entry(space, index, Address::from_ref(handle_location));

        // An entry marked for evacuation is still marked, as sweeping may visit it before
        // the evacuation entry.
        self.table.at(index).mark();
    }

    fn maybe_create_evacuation_entry(
        &self,
        space: &ExternalPointerSpace,
        index: u32,
        handle_location: Address,
    ) {
        // Read once: other markers may abort compaction while this runs.
        let start_of_evacuation_area = space.start_of_evacuation_area.load(Ordering::Relaxed);
        if index < start_of_evacuation_area {
            return;
        }
        debug_assert!(space.is_compacting());

        let new_index = self
            .table
            .allocate_entry_below(&space.space, start_of_evacuation_area);
        if new_index != 0 {
            debug_assert!(new_index < start_of_evacuation_area);
            assert!(
                space.contains(new_index),
                "evacuation entry {} is not in the space",
                new_index
            );
            self.table
                .at(new_index)
                .make_evacuation_entry(handle_location);
        } else {
            // The freelist below the evacuation area ran dry. Entries that already have an
            // evacuation entry are still moved, but the area will not be freed.
            space.abort_compacting(start_of_evacuation_area);
        }
    }

    /// Decide whether to compact `space` during the coming marking cycle.
    ///
    /// Compaction starts if the space is at least 1 MB, at least 10% free, and half of its
    /// free entries fill at least one segment. The evacuation area is then the topmost
    /// `free / 2` entries rounded down to whole segments.
    pub fn start_compacting_if_needed(&self, space: &ExternalPointerSpace) {
        if !self.compaction_enabled {
            return;
        }
        let segments = space.space.lock_segments();

        // Other threads may allocate concurrently. Stale numbers only cause an early abort.
        let num_free_entries = space.space.freelist_length() as usize;
        let entries_per_segment = self.entries_per_segment() as usize;
        let num_total_entries = segments.len() * entries_per_segment;
        if num_total_entries == 0 {
            return;
        }

        let space_size = num_total_entries * self.table.layout().entry_size();
        let free_percent = num_free_entries * 100 / num_total_entries;
        let num_segments_to_evacuate = (num_free_entries / 2) / entries_per_segment;

        let should_compact = space_size >= EXTERNAL_POINTER_COMPACTION_MIN_SPACE_SIZE
            && free_percent >= EXTERNAL_POINTER_COMPACTION_MIN_FREE_PERCENT
            && num_segments_to_evacuate >= 1;
        if !should_compact {
            return;
        }

        if let Some(first_segment_to_evacuate) =
            segments.iter().rev().nth(num_segments_to_evacuate - 1)
        {
            let start = first_segment_to_evacuate.first_entry(self.table.layout());
            debug!(
                "Compacting external pointer space: evacuating {} of {} segments from entry {}",
                num_segments_to_evacuate,
                segments.len(),
                start
            );
            space.start_compacting(start);
        }
    }

    /// Free every unmarked entry of `space`, clear the mark bits of the others, and finish
    /// compaction. Returns the number of live entries.
    ///
    /// The freelist is rebuilt sorted by index, and segments that end up entirely free are
    /// released. Nothing may allocate from `space` meanwhile.
    ///
    /// # Safety
    /// Every handle location passed to [`ExternalPointerTable::mark`] for an entry inside the
    /// evacuation area must still be valid, since evacuated handles are rewritten in place.
    pub unsafe fn sweep_and_compact(&self, space: &ExternalPointerSpace) -> u32 {
        debug_assert!(space.space.belongs_to(self.table.id()));
        let layout = *self.table.layout();
        let entries_per_segment = layout.entries_per_segment();

        let mut segments = space.space.lock_segments();
        space
            .space
            .freelist_head()
            .store(ENTRY_ALLOCATION_IS_FORBIDDEN_MARKER, Ordering::Relaxed);

        let raw_start = space.start_of_evacuation_area.load(Ordering::Relaxed);
        let was_compacting = space.is_compacting();
        let mut start_of_evacuation_area = raw_start;
        let mut evacuation_was_successful = false;
        if was_compacting {
            if space.compacting_was_aborted() {
                start_of_evacuation_area &= !COMPACTION_ABORTED_MARKER;
                debug!("Sweeping after aborted compaction");
            } else {
                evacuation_was_successful = true;
            }
            debug_assert_eq!(start_of_evacuation_area % entries_per_segment, 0);
            space.stop_compacting();
        }

        // Top down, so that the freelist comes out sorted by index.
        let mut current_freelist_head = 0;
        let mut current_freelist_length = 0;
        let mut segments_to_deallocate: Vec<Segment> = vec![];
        for segment in segments.iter().rev() {
            if evacuation_was_successful
                && segment.first_entry(&layout) >= start_of_evacuation_area
            {
                segments_to_deallocate.push(*segment);
                continue;
            }

            let previous_freelist_head = current_freelist_head;
            let previous_freelist_length = current_freelist_length;

            for i in (segment.first_entry(&layout)..=segment.last_entry(&layout)).rev() {
                let entry = self.table.at(i);
                let payload = entry.load();
                if payload.contains_evacuation_entry() {
                    assert!(was_compacting, "evacuation entry outside of compaction");
                    // The entry being evacuated is not put on the freelist: its segment is
                    // normally freed below.
                    let handle_location = payload.extract_evacuation_entry_handle_location();
                    self.resolve_evacuation_entry_during_sweeping(
                        i,
                        handle_location,
                        start_of_evacuation_area,
                    );
                } else if !payload.has_mark_bit_set() {
                    entry.make_freelist_entry(current_freelist_head);
                    current_freelist_head = i;
                    current_freelist_length += 1;
                } else {
                    let mut new_payload = payload;
                    new_payload.clear_mark_bit();
                    entry.store(new_payload);
                }
            }

            if current_freelist_length - previous_freelist_length == entries_per_segment {
                segments_to_deallocate.push(*segment);
                current_freelist_head = previous_freelist_head;
                current_freelist_length = previous_freelist_length;
            }
        }

        for segment in &segments_to_deallocate {
            self.table.free_table_segment(*segment);
            segments.remove(segment);
        }

        space.space.freelist_head().store(
            FreelistHead::new(current_freelist_head, current_freelist_length),
            Ordering::Release,
        );

        let capacity = segments.len() as u32 * entries_per_segment;
        let num_live_entries = capacity - current_freelist_length;
        debug!(
            "Swept external pointer space: {} live, {} free, {} segments released",
            num_live_entries,
            current_freelist_length,
            segments_to_deallocate.len()
        );
        num_live_entries
    }

    /// Move the entry whose handle lives at `handle_location` into `new_index`.
    unsafe fn resolve_evacuation_entry_during_sweeping(
        &self,
        new_index: u32,
        handle_location: Address,
        start_of_evacuation_area: u32,
    ) {
        let handle_location = &*handle_location.to_ptr::<AtomicU32>();
        let old_handle = handle_location.load(Ordering::Relaxed);
        let old_index = handle_to_index(old_handle);
        let new_handle = index_to_handle(new_index);

        // Entries only move from the evacuation area to below it. A handle field that was
        // initialized twice during marking breaks this.
        debug_assert!(old_index >= start_of_evacuation_area);
        debug_assert!(new_index < start_of_evacuation_area);

        self.table
            .at(old_index)
            .unmark_and_migrate_into(self.table.at(new_index));
        handle_location.store(new_handle, Ordering::Relaxed);
    }

    /// Is the entry marked? Only meaningful between marking and sweeping.
    pub fn is_marked(&self, handle: ExternalPointerHandle) -> bool {
        self.table.at(handle_to_index(handle)).is_marked()
    }
}

pub fn handle_to_index(handle: ExternalPointerHandle) -> u32 {
    let index = handle >> EXTERNAL_POINTER_INDEX_SHIFT;
    debug_assert_eq!(
        handle,
        index << EXTERNAL_POINTER_INDEX_SHIFT,
        "invalid handle {:#x}",
        handle
    );
    debug_assert!(index as usize <= MAX_EXTERNAL_POINTERS);
    index
}

pub fn index_to_handle(index: u32) -> ExternalPointerHandle {
    debug_assert!(index as usize <= MAX_EXTERNAL_POINTERS);
    index << EXTERNAL_POINTER_INDEX_SHIFT
}

/// A table and one of its spaces.
#[derive(Copy, Clone)]
pub struct ExternalPointerSpaceRef<'a> {
    pub table: &'a ExternalPointerTable,
    pub space: &'a ExternalPointerSpace,
}

/// The tables a marking visitor marks external pointers in: the isolate's own table, and the
/// table shared between isolates. Tags decide which one a handle belongs to. A missing table
/// means handles of that kind are not marked.
#[derive(Copy, Clone, Default)]
pub struct ExternalPointerSpaces<'a> {
    pub local: Option<ExternalPointerSpaceRef<'a>>,
    pub shared: Option<ExternalPointerSpaceRef<'a>>,
}

impl<'a> ExternalPointerSpaces<'a> {
    pub fn new(local: ExternalPointerSpaceRef<'a>) -> Self {
        Self {
            local: Some(local),
            shared: None,
        }
    }

    pub fn with_shared(self, shared: ExternalPointerSpaceRef<'a>) -> Self {
        Self {
            shared: Some(shared),
            ..self
        }
    }

    /// Mark the entry whose handle is stored in `slot`.
    pub fn mark(&self, slot: &AtomicU32, tag: ExternalPointerTag) {
        debug_assert!(!tag.is_null());
        let target = if tag.is_shared() {
            self.shared
        } else {
            self.local
        };
        if let Some(ExternalPointerSpaceRef { table, space }) = target {
            let handle = slot.load(Ordering::Relaxed);
            table.mark(space, handle, slot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FOREIGN: ExternalPointerTag = ExternalPointerTag::FOREIGN;

    fn addr(raw: usize) -> Address {
        unsafe { Address::from_usize(raw) }
    }

    fn table() -> ExternalPointerTable {
        let mut table = ExternalPointerTable::new(&Options::default());
        table.initialize();
        table
    }

    fn allocate(
        table: &ExternalPointerTable,
        space: &ExternalPointerSpace,
        raw: usize,
    ) -> ExternalPointerHandle {
        table.allocate_and_initialize_entry(space, addr(raw), FOREIGN)
    }

    #[test]
    fn tags() {
        assert!(ExternalPointerTag::FOREIGN.can_tag_pointers());
        assert!(!ExternalPointerTag::FOREIGN.is_shared());
        assert!(ExternalPointerTag::SHARED_STRING_RESOURCE.is_shared());
        assert!(!ExternalPointerTag::FREE_ENTRY.can_tag_pointers());
        assert!(!ExternalPointerTag::EVACUATION_ENTRY.can_tag_pointers());
        assert!(!ExternalPointerTag::FREE_ENTRY.is_shared());
    }

    #[test]
    fn handles() {
        assert_eq!(handle_to_index(index_to_handle(17)), 17);
        assert_eq!(index_to_handle(0), NULL_EXTERNAL_POINTER_HANDLE);
        assert_eq!(index_to_handle(1), 1 << EXTERNAL_POINTER_INDEX_SHIFT);
    }

    #[test]
    fn store_and_load() {
        let mut table = table();
        let space = ExternalPointerSpace::new();
        table.initialize_space(&space);

        let handle = allocate(&table, &space, 0x1000);
        let other_tag = ExternalPointerTag::EMBEDDER_DATA_SLOT;
        assert_ne!(handle, NULL_EXTERNAL_POINTER_HANDLE);
        assert_eq!(table.get(handle, FOREIGN), addr(0x1000));
        assert!(table.has_external_pointer(handle, FOREIGN));
        assert!(!table.has_external_pointer(handle, other_tag));

        table.set(handle, addr(0x2000), FOREIGN);
        let old = table.exchange(handle, addr(0x3000), FOREIGN);
        assert_eq!(old, addr(0x2000));
        assert_eq!(table.get(handle, FOREIGN), addr(0x3000));

        // The null handle reads as a null pointer with any tag.
        assert!(table.get(NULL_EXTERNAL_POINTER_HANDLE, FOREIGN).is_zero());

        table.tear_down_space(&space);
        table.tear_down();
    }

    #[test]
    fn wrong_tag_yields_noncanonical_pointer() {
        let mut table = table();
        let space = ExternalPointerSpace::new();
        table.initialize_space(&space);

        let handle = allocate(&table, &space, 0x1000);
        let value = table.get(handle, ExternalPointerTag::EMBEDDER_DATA_SLOT);
        assert_ne!(value, addr(0x1000));
        assert_ne!(value.as_usize() as u64 & TAG_MASK, 0);

        table.tear_down_space(&space);
        table.tear_down();
    }

    #[test]
    fn sweep_frees_unmarked_entries() {
        let mut table = table();
        let space = ExternalPointerSpace::new();
        table.initialize_space(&space);

        let slots: Vec<AtomicU32> = (0..10)
            .map(|i| allocate(&table, &space, 0x1000 + i * 8))
            .map(AtomicU32::new)
            .collect();

        // Freshly stored pointers are marked, so one sweep keeps everything.
        let live = unsafe { table.sweep_and_compact(&space) };
        assert_eq!(live, 10);
        assert!(!table.is_marked(slots[0].load(Ordering::Relaxed)));

        // Only the even entries are reachable in the next cycle.
        for slot in slots.iter().step_by(2) {
            table.mark(&space, slot.load(Ordering::Relaxed), slot);
        }
        let live = unsafe { table.sweep_and_compact(&space) };
        assert_eq!(live, 5);
        assert_eq!(space.freelist_length() as usize, space.capacity() - 5);
        for (i, slot) in slots.iter().enumerate().step_by(2) {
            let handle = slot.load(Ordering::Relaxed);
            assert_eq!(table.get(handle, FOREIGN), addr(0x1000 + i * 8));
        }

        // Nothing marked: the only segment becomes empty and is released.
        let live = unsafe { table.sweep_and_compact(&space) };
        assert_eq!(live, 0);
        assert_eq!(space.num_segments(), 0);

        table.tear_down_space(&space);
        table.tear_down();
    }

    #[test]
    fn swept_freelist_is_sorted() {
        let mut table = table();
        let space = ExternalPointerSpace::new();
        table.initialize_space(&space);

        let handles: Vec<u32> = (0..8).map(|_| allocate(&table, &space, 0x10)).collect();
        unsafe { table.sweep_and_compact(&space) };
        // Keep the first entry only, so the segment is not empty.
        let slot = AtomicU32::new(handles[0]);
        table.mark(&space, handles[0], &slot);
        unsafe { table.sweep_and_compact(&space) };

        let next = allocate(&table, &space, 0x20);
        assert_eq!(handle_to_index(next), handle_to_index(handles[0]) + 1);

        table.tear_down_space(&space);
        table.tear_down();
    }

    #[test]
    #[should_panic(expected = "handle does not match its location")]
    fn mark_checks_handle_location() {
        let mut table = table();
        let space = ExternalPointerSpace::new();
        table.initialize_space(&space);
        let handle = allocate(&table, &space, 0x10);
        let slot = AtomicU32::new(0);
        table.mark(&space, handle, &slot);
    }

    #[test]
    #[should_panic(expected = "is not in the marked space")]
    fn mark_checks_space_membership() {
        let mut table = table();
        let space = ExternalPointerSpace::new();
        let other = ExternalPointerSpace::new();
        table.initialize_space(&space);
        table.initialize_space(&other);
        let handle = allocate(&table, &other, 0x10);
        let slot = AtomicU32::new(handle);
        table.mark(&space, handle, &slot);
    }

    /// A space a little over the minimum compactable size, in which every other entry is
    /// live. Returns the handle slots of the live entries.
    fn half_empty_space(
        table: &ExternalPointerTable,
        space: &ExternalPointerSpace,
    ) -> Vec<(usize, AtomicU32)> {
        let eps = table.entries_per_segment() as usize;
        let segments = EXTERNAL_POINTER_COMPACTION_MIN_SPACE_SIZE / ENTITY_TABLE_SEGMENT_SIZE + 2;
        let slots: Vec<AtomicU32> = (0..segments * eps)
            .map(|i| allocate(table, space, 0x1000 + i * 8))
            .map(AtomicU32::new)
            .collect();
        // Everything is freshly marked. This sweep only clears the mark bits.
        unsafe { table.sweep_and_compact(space) };
        let live: Vec<(usize, AtomicU32)> = slots.into_iter().enumerate().step_by(2).collect();
        for (_, slot) in &live {
            table.mark(space, slot.load(Ordering::Relaxed), slot);
        }
        unsafe { table.sweep_and_compact(space) };
        assert_eq!(space.num_segments(), segments);
        assert_eq!(space.freelist_length() as usize, segments * eps / 2);
        live
    }

    #[test]
    fn compaction_evacuates_top_segments() {
        let mut table = table();
        let space = ExternalPointerSpace::new();
        table.initialize_space(&space);
        let live = half_empty_space(&table, &space);
        let segments_before = space.num_segments();

        table.start_compacting_if_needed(&space);
        assert!(space.is_compacting());
        let start = space.start_of_evacuation_area().unwrap();
        for (_, slot) in &live {
            table.mark(&space, slot.load(Ordering::Relaxed), slot);
        }
        assert!(!space.compacting_was_aborted());

        let live_count = unsafe { table.sweep_and_compact(&space) };
        assert_eq!(live_count as usize, live.len());
        assert!(!space.is_compacting());
        // Half of the free entries were used to evacuate whole segments.
        assert_eq!(space.num_segments(), segments_before - segments_before / 4);

        for (i, slot) in &live {
            let handle = slot.load(Ordering::Relaxed);
            assert!(handle_to_index(handle) < start);
            assert!(space.contains(handle_to_index(handle)));
            assert_eq!(table.get(handle, FOREIGN), addr(0x1000 + i * 8));
        }

        table.tear_down_space(&space);
        table.tear_down();
    }

    #[test]
    fn allocation_in_evacuation_area_aborts_compaction() {
        let mut table = table();
        let space = ExternalPointerSpace::new();
        table.initialize_space(&space);
        let _live = half_empty_space(&table, &space);

        table.start_compacting_if_needed(&space);
        assert!(space.is_compacting());

        // The freelist is sorted, so allocation reaches the evacuation area only after every
        // free entry below it is used up.
        let mut allocated = 0;
        while !space.compacting_was_aborted() {
            assert!(space.freelist_length() > 0);
            allocate(&table, &space, 0x10);
            allocated += 1;
        }
        assert!(space.is_compacting());

        // Only the new entries are marked. Nothing is evacuated after an abort.
        let live = unsafe { table.sweep_and_compact(&space) };
        assert_eq!(live, allocated);
        assert!(!space.is_compacting());

        table.tear_down_space(&space);
        table.tear_down();
    }

    #[test]
    fn small_spaces_are_not_compacted() {
        let mut table = table();
        let space = ExternalPointerSpace::new();
        table.initialize_space(&space);
        allocate(&table, &space, 0x10);
        table.start_compacting_if_needed(&space);
        assert!(!space.is_compacting());
        table.tear_down_space(&space);
        table.tear_down();
    }

    #[test]
    fn shared_tags_go_to_the_shared_table() {
        let mut local_table = table();
        let mut shared_table = table();
        let local = ExternalPointerSpace::new();
        let shared = ExternalPointerSpace::new();
        local_table.initialize_space(&local);
        shared_table.initialize_space(&shared);

        let shared_tag = ExternalPointerTag::SHARED_STRING_RESOURCE;
        let local_slot = AtomicU32::new(allocate(&local_table, &local, 0x10));
        let handle = shared_table.allocate_and_initialize_entry(&shared, addr(0x20), shared_tag);
        let shared_slot = AtomicU32::new(handle);
        unsafe {
            local_table.sweep_and_compact(&local);
            shared_table.sweep_and_compact(&shared);
        }

        let spaces = ExternalPointerSpaces::new(ExternalPointerSpaceRef {
            table: &local_table,
            space: &local,
        })
        .with_shared(ExternalPointerSpaceRef {
            table: &shared_table,
            space: &shared,
        });
        spaces.mark(&local_slot, FOREIGN);
        spaces.mark(&shared_slot, shared_tag);
        assert!(local_table.is_marked(local_slot.load(Ordering::Relaxed)));
        assert!(shared_table.is_marked(shared_slot.load(Ordering::Relaxed)));

        local_table.tear_down_space(&local);
        shared_table.tear_down_space(&shared);
        local_table.tear_down();
        shared_table.tear_down();
    }
}
