//! A segmented table of fixed-size entries living in a dedicated reservation.
//!
//! Entries are addressed by 32-bit indices, never by pointers. The table is split into
//! [`Space`]s, each of which owns a set of segments and threads a lock-free freelist through
//! their unused entries. Allocation is a single compare-and-swap on the freelist head. Only
//! growth takes the space's mutex.

use std::collections::BTreeSet;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use atomic::Atomic;

use crate::sandbox::freelist::FreelistHead;
use crate::sandbox::segment::{Segment, TableLayout};
use crate::sandbox::vas::{
    fatal_process_out_of_memory, FatalOutOfMemoryHandler, OsAddressSpace, PlatformAddressSpace,
    VirtualAddressSpace,
};
use crate::util::conversions::is_page_multiple;
use crate::util::os::memory::{MmapAnnotation, MmapProtection};
use crate::util::Address;

/// An entry of an [`ExternalEntityTable`].
///
/// An entry is either in use, holding a payload, or free, holding the index of the next
/// free entry. All-zero memory must be a valid entry, since that is what fresh segments
/// contain. All mutation goes through `&self`, so entries are made of atomics.
pub trait TableEntry: bytemuck::Zeroable + Send + Sync + 'static {
    /// Turn this entry into a free entry that links to `next_entry_index`.
    /// Zero terminates the freelist.
    fn make_freelist_entry(&self, next_entry_index: u32);

    /// The link stored in a free entry. The result is meaningless for an entry in use,
    /// which a racing allocator may observe. Its CAS on the freelist head then fails.
    fn next_freelist_entry_index(&self) -> u32;
}

static NEXT_TABLE_ID: AtomicUsize = AtomicUsize::new(1);

/// A partition of a table with its own segments and freelist.
///
/// A space is registered with exactly one table by [`ExternalEntityTable::initialize_space`]
/// and must be torn down with [`ExternalEntityTable::tear_down_space`] before the table is.
/// Segments of different spaces are disjoint.
pub struct Space {
    freelist_head: Atomic<FreelistHead>,
    /// The segments of this space, ordered by number. The mutex also serializes growth.
    segments: Mutex<BTreeSet<Segment>>,
    entries_per_segment: AtomicU32,
    #[cfg(debug_assertions)]
    owning_table: AtomicUsize,
}

impl Space {
    pub fn new() -> Self {
        Self {
            freelist_head: Atomic::new(FreelistHead::EMPTY),
            segments: Mutex::new(BTreeSet::new()),
            entries_per_segment: AtomicU32::new(0),
            #[cfg(debug_assertions)]
            owning_table: AtomicUsize::new(0),
        }
    }

    /// The number of free entries. Racy while other threads allocate.
    pub fn freelist_length(&self) -> u32 {
        self.freelist_head.load(Ordering::Relaxed).length()
    }

    pub fn num_segments(&self) -> usize {
        self.segments.lock().unwrap().len()
    }

    /// The number of entries in all segments of this space.
    pub fn capacity(&self) -> usize {
        self.num_segments() * self.entries_per_segment() as usize
    }

    /// Does the entry at `index` belong to one of this space's segments?
    /// This takes the space's lock, so it is meant for assertions rather than hot paths.
    pub fn contains(&self, index: u32) -> bool {
        let entries_per_segment = self.entries_per_segment();
        if entries_per_segment == 0 {
            return false;
        }
        let segment = Segment::new(index / entries_per_segment);
        self.segments.lock().unwrap().contains(&segment)
    }

    fn entries_per_segment(&self) -> u32 {
        self.entries_per_segment.load(Ordering::Relaxed)
    }

    pub(crate) fn freelist_head(&self) -> &Atomic<FreelistHead> {
        &self.freelist_head
    }

    pub(crate) fn lock_segments(&self) -> MutexGuard<'_, BTreeSet<Segment>> {
        self.segments.lock().unwrap()
    }

    #[cfg(debug_assertions)]
    pub(crate) fn belongs_to(&self, table_id: usize) -> bool {
        self.owning_table.load(Ordering::Relaxed) == table_id
    }

    #[cfg(not(debug_assertions))]
    pub(crate) fn belongs_to(&self, _table_id: usize) -> bool {
        true
    }
}

impl Default for Space {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Space {
    fn drop(&mut self) {
        if std::thread::panicking() {
            return;
        }
        let empty = self.segments.get_mut().map_or(true, |s| s.is_empty());
        debug_assert!(empty, "A space must be torn down before it is dropped");
    }
}

/// A table of `E` entries inside a dedicated virtual address reservation.
///
/// The table is created uninitialized. [`ExternalEntityTable::initialize`] reserves the
/// address range and commits segment 0, which holds the read-only null entry. Any failure
/// to obtain address space is fatal and goes through the table's
/// [`FatalOutOfMemoryHandler`].
pub struct ExternalEntityTable<E: TableEntry> {
    id: usize,
    name: &'static str,
    layout: TableLayout,
    vas: Option<Box<dyn VirtualAddressSpace>>,
    base: Address,
    use_emulated_subspace: bool,
    oom_handler: FatalOutOfMemoryHandler,
    /// Segments currently owned by spaces. Must be zero when the table is torn down.
    live_segments: AtomicUsize,
    _entry: PhantomData<E>,
}

impl<E: TableEntry> ExternalEntityTable<E> {
    pub fn new(name: &'static str, segment_size: usize, reservation_size: usize) -> Self {
        Self {
            id: NEXT_TABLE_ID.fetch_add(1, Ordering::Relaxed),
            name,
            layout: TableLayout::new(std::mem::size_of::<E>(), segment_size, reservation_size),
            vas: None,
            base: Address::ZERO,
            use_emulated_subspace: false,
            oom_handler: fatal_process_out_of_memory,
            live_segments: AtomicUsize::new(0),
            _entry: PhantomData,
        }
    }

    /// Never try to reserve an OS subspace.
    pub fn use_emulated_subspace(self, use_emulated_subspace: bool) -> Self {
        Self {
            use_emulated_subspace,
            ..self
        }
    }

    /// Replace the handler for fatal out-of-memory conditions.
    pub fn oom_handler(self, oom_handler: FatalOutOfMemoryHandler) -> Self {
        Self {
            oom_handler,
            ..self
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn layout(&self) -> &TableLayout {
        &self.layout
    }

    pub fn is_initialized(&self) -> bool {
        debug_assert_eq!(self.base.is_zero(), self.vas.is_none());
        !self.base.is_zero()
    }

    /// Is the table's storage an emulated, fully backed region?
    pub fn is_emulated(&self) -> bool {
        self.vas.as_ref().is_some_and(|vas| vas.is_emulated())
    }

    /// The start of the reservation.
    pub fn base(&self) -> Address {
        self.base
    }

    /// Reserve the table's address range from the operating system.
    pub fn initialize(&mut self) {
        self.initialize_with(&OsAddressSpace)
    }

    /// Reserve the table's address range from `root`.
    ///
    /// An OS subspace is tried first. If the platform cannot provide one, or the table's
    /// segments are not whole pages, a fully backed emulated subspace is used instead.
    pub fn initialize_with(&mut self, root: &dyn PlatformAddressSpace) {
        debug_assert!(!self.is_initialized());
        debug_assert!(self.vas.is_none());

        let reservation_size = self.layout.reservation_size();
        let segment_size = self.layout.segment_size();
        let try_subspace = !self.use_emulated_subspace
            && root.can_allocate_subspaces()
            && is_page_multiple(segment_size);

        let mut vas = None;
        if try_subspace {
            let annotation = MmapAnnotation::EntityTable { name: self.name };
            vas = root.allocate_subspace(reservation_size, segment_size, &annotation);
        }
        if vas.is_none() {
            info!(
                "Table {} uses an emulated subspace of {} bytes",
                self.name, reservation_size
            );
            vas = root.allocate_emulated_subspace(reservation_size, segment_size, segment_size);
        }
        let Some(vas) = vas else {
            (self.oom_handler)("ExternalEntityTable::InitializeTable (subspace allocation)");
        };

        // The first segment holds the null entry, which must stay zero forever.
        let base = vas.base();
        let first_segment =
            vas.allocate_pages(Some(base), segment_size, segment_size, MmapProtection::Read);
        if first_segment != Some(base) {
            (self.oom_handler)("ExternalEntityTable::InitializeTable (first segment allocation)");
        }

        info!(
            "Table {} reserved {}..{} ({} entries of {} bytes)",
            self.name,
            base,
            base + reservation_size,
            self.layout.max_entries(),
            self.layout.entry_size()
        );
        self.base = base;
        self.vas = Some(vas);
    }

    /// Release segment 0 and the reservation. All spaces must have been torn down.
    pub fn tear_down(&mut self) {
        debug_assert!(self.is_initialized());
        debug_assert_eq!(
            self.live_segments.load(Ordering::Relaxed),
            0,
            "All spaces must be torn down before their table"
        );
        if let Some(vas) = self.vas.take() {
            vas.free_pages(self.base, self.layout.segment_size());
        }
        self.base = Address::ZERO;
        debug!("Table {} torn down", self.name);
    }

    /// Register `space` with this table.
    pub fn initialize_space(&self, space: &Space) {
        #[cfg(debug_assertions)]
        {
            let previous = space.owning_table.swap(self.id, Ordering::Relaxed);
            debug_assert_eq!(previous, 0, "A space can only belong to one table");
        }
        space
            .entries_per_segment
            .store(self.layout.entries_per_segment(), Ordering::Relaxed);
    }

    /// Free every segment owned by `space`. Its entries become invalid, and the space may be
    /// registered again.
    pub fn tear_down_space(&self, space: &Space) {
        debug_assert!(self.is_initialized());
        debug_assert!(space.belongs_to(self.id));
        let mut segments = space.lock_segments();
        for segment in segments.iter() {
            self.free_table_segment(*segment);
        }
        debug!(
            "Tore down a space of table {} with {} segments",
            self.name,
            segments.len()
        );
        segments.clear();
        space
            .freelist_head
            .store(FreelistHead::EMPTY, Ordering::Relaxed);
        #[cfg(debug_assertions)]
        space.owning_table.store(0, Ordering::Relaxed);
    }

    /// The entry at `index`. Indices are checked against the reservation, so a corrupted
    /// index cannot reach memory outside the table.
    pub fn at(&self, index: u32) -> &E {
        assert!(
            index < self.layout.max_entries(),
            "Entry index {} out of range",
            index
        );
        debug_assert!(self.is_initialized());
        unsafe { &*self.base.to_ptr::<E>().add(index as usize) }
    }

    /// Allocate an entry from `space`, growing the space by a segment if its freelist is
    /// empty. The result is never zero.
    pub fn allocate_entry(&self, space: &Space) -> u32 {
        debug_assert!(self.is_initialized());
        debug_assert!(space.belongs_to(self.id));

        loop {
            // Double-checked locking: this acquire load pairs with the release store in
            // `extend`, so the links of a fresh segment are visible before its head is.
            let mut freelist = space.freelist_head.load(Ordering::Acquire);
            if freelist.is_empty() {
                let mut segments = space.lock_segments();
                // Another thread may have grown the space while we waited for the lock.
                freelist = space.freelist_head.load(Ordering::Relaxed);
                if freelist.is_empty() {
                    freelist = self.extend(space, &mut segments);
                    debug_assert_eq!(freelist.length(), self.layout.entries_per_segment());
                }
            }

            if self.try_allocate_entry_from_freelist(space, freelist) {
                let allocated_entry = freelist.next();
                #[cfg(feature = "extreme_assertions")]
                assert!(space.contains(allocated_entry));
                debug_assert_ne!(allocated_entry, 0);
                return allocated_entry;
            }
        }
    }

    /// Allocate an entry with an index below `threshold_index`, or return 0.
    ///
    /// Only the head of the freelist is considered. If the head is at or above the threshold
    /// this fails, even if free entries below the threshold sit further down the list.
    /// The space is never grown.
    pub fn allocate_entry_below(&self, space: &Space, threshold_index: u32) -> u32 {
        debug_assert!(self.is_initialized());

        loop {
            let freelist = space.freelist_head.load(Ordering::Acquire);
            if freelist.is_empty() || freelist.next() >= threshold_index {
                return 0;
            }
            if self.try_allocate_entry_from_freelist(space, freelist) {
                let allocated_entry = freelist.next();
                debug_assert_ne!(allocated_entry, 0);
                debug_assert!(allocated_entry < threshold_index);
                return allocated_entry;
            }
        }
    }

    /// Try to pop the head entry of `freelist`. Fails if another thread changed the head
    /// since `freelist` was loaded.
    fn try_allocate_entry_from_freelist(&self, space: &Space, freelist: FreelistHead) -> bool {
        debug_assert!(!freelist.is_empty());

        let entry = self.at(freelist.next());
        let new_freelist =
            FreelistHead::new(entry.next_freelist_entry_index(), freelist.length() - 1);
        let success = space
            .freelist_head
            .compare_exchange(freelist, new_freelist, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok();

        // Only after a successful CAS do we know the entry was still free when we read its link.
        if success {
            debug_assert!(freelist.length() == 1 || !new_freelist.is_empty());
            debug_assert!(freelist.length() != 1 || new_freelist.is_empty());
        }
        success
    }

    /// Grow `space` by one segment and make its entries the new freelist.
    ///
    /// The caller holds the space's lock, which is where `segments` comes from, and the
    /// freelist must be empty.
    pub(crate) fn extend(&self, space: &Space, segments: &mut BTreeSet<Segment>) -> FreelistHead {
        debug_assert_eq!(space.freelist_length(), 0);

        let segment = self.allocate_table_segment();
        segments.insert(segment);
        debug_assert_ne!(segment.number(), 0);

        let first = segment.first_entry(&self.layout);
        let last = segment.last_entry(&self.layout);
        for i in first..last {
            self.at(i).make_freelist_entry(i + 1);
        }
        self.at(last).make_freelist_entry(0);

        // Release: the links above must not be reordered past the publication of the head.
        let new_freelist_head = FreelistHead::new(first, last - first + 1);
        space
            .freelist_head
            .store(new_freelist_head, Ordering::Release);

        #[cfg(feature = "extreme_assertions")]
        self.verify_freelist(new_freelist_head);

        debug!(
            "Extended a space of table {} with segment {} (entries {}..={})",
            self.name,
            segment.number(),
            first,
            last
        );
        new_freelist_head
    }

    #[cfg(feature = "extreme_assertions")]
    fn verify_freelist(&self, head: FreelistHead) {
        let mut index = head.next();
        for _ in 0..head.length() {
            assert_ne!(index, 0, "freelist shorter than its recorded length");
            index = self.at(index).next_freelist_entry_index();
        }
        assert_eq!(index, 0, "freelist longer than its recorded length");
    }

    pub(crate) fn allocate_table_segment(&self) -> Segment {
        let segment_size = self.layout.segment_size();
        let start = self.vas.as_ref().and_then(|vas| {
            vas.allocate_pages(None, segment_size, segment_size, MmapProtection::ReadWrite)
        });
        let Some(start) = start else {
            (self.oom_handler)("ExternalEntityTable::AllocateSegment");
        };
        self.live_segments.fetch_add(1, Ordering::Relaxed);
        Segment::at(start - self.base, &self.layout)
    }

    pub(crate) fn free_table_segment(&self, segment: Segment) {
        // Segment zero is reserved.
        debug_assert_ne!(segment.number(), 0);
        let segment_size = self.layout.segment_size();
        if let Some(vas) = self.vas.as_ref() {
            vas.free_pages(self.base + segment.offset(&self.layout), segment_size);
        }
        self.live_segments.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn id(&self) -> usize {
        self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::vas::EmulatedAddressSpace;
    use crate::util::test_util::panic_after;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicU64;

    #[repr(transparent)]
    struct TestEntry(AtomicU64);

    unsafe impl bytemuck::Zeroable for TestEntry {}

    impl TableEntry for TestEntry {
        fn make_freelist_entry(&self, next_entry_index: u32) {
            self.0.store(next_entry_index as u64, Ordering::Relaxed);
        }

        fn next_freelist_entry_index(&self) -> u32 {
            self.0.load(Ordering::Relaxed) as u32
        }
    }

    /// Four entries per segment, 64 segments.
    fn tiny_table() -> ExternalEntityTable<TestEntry> {
        let mut table = ExternalEntityTable::<TestEntry>::new("tiny", 32, 2048);
        table.initialize();
        table
    }

    fn panicking_oom(location: &str) -> ! {
        panic!("out of memory: {}", location)
    }

    #[test]
    fn tiny_segments_use_emulated_subspace() {
        let mut table = tiny_table();
        assert!(table.is_initialized());
        assert!(table.is_emulated());
        // The null entry reads zero.
        assert_eq!(table.at(0).next_freelist_entry_index(), 0);
        table.tear_down();
        assert!(!table.is_initialized());
    }

    #[test]
    fn one_segment_then_extend() {
        let mut table = tiny_table();
        let space = Space::new();
        table.initialize_space(&space);

        let mut seen = HashSet::new();
        for _ in 0..4 {
            let index = table.allocate_entry(&space);
            assert_ne!(index, 0);
            assert!(space.contains(index));
            assert!(seen.insert(index));
        }
        assert_eq!(space.num_segments(), 1);
        assert_eq!(space.freelist_length(), 0);

        // The next allocation grows the space by exactly one segment.
        let fifth = table.allocate_entry(&space);
        assert!(!seen.contains(&fifth));
        assert_eq!(space.num_segments(), 2);
        assert_eq!(space.freelist_length(), 3);

        table.tear_down_space(&space);
        assert_eq!(space.num_segments(), 0);
        table.tear_down();
    }

    #[test]
    fn extend_builds_sorted_freelist() {
        let mut table = tiny_table();
        let space = Space::new();
        table.initialize_space(&space);

        let first = table.allocate_entry(&space);
        let segment = Segment::containing(first, table.layout());
        assert_eq!(first, segment.first_entry(table.layout()));
        assert_eq!(table.allocate_entry(&space), first + 1);
        assert_eq!(table.allocate_entry(&space), first + 2);
        assert_eq!(table.allocate_entry(&space), first + 3);

        table.tear_down_space(&space);
        table.tear_down();
    }

    #[test]
    fn allocate_entry_below_threshold() {
        let mut table = tiny_table();
        let space = Space::new();
        table.initialize_space(&space);

        // Nothing is free yet and the space is not grown.
        assert_eq!(table.allocate_entry_below(&space, u32::MAX), 0);
        assert_eq!(space.num_segments(), 0);

        let first = table.allocate_entry(&space);
        let head = first + 1;
        assert_eq!(table.allocate_entry_below(&space, head), 0);
        assert_eq!(table.allocate_entry_below(&space, head + 1), head);
        assert_eq!(space.freelist_length(), 2);

        table.tear_down_space(&space);
        table.tear_down();
    }

    #[test]
    fn allocate_entry_below_only_checks_the_head() {
        let mut table = tiny_table();
        let space = Space::new();
        table.initialize_space(&space);

        // Grow to one segment, then rebuild the freelist by hand so that a high index sits
        // at the head with a low index behind it.
        let low = table.allocate_entry(&space);
        let high = low + 3;
        {
            let _segments = space.lock_segments();
            table.at(high).make_freelist_entry(low);
            table.at(low).make_freelist_entry(0);
            space
                .freelist_head()
                .store(FreelistHead::new(high, 2), Ordering::Release);
        }

        // `low` is free and below the threshold, but it is not the head.
        assert_eq!(table.allocate_entry_below(&space, high), 0);
        assert_eq!(space.freelist_length(), 2);
        assert_eq!(table.allocate_entry(&space), high);
        assert_eq!(table.allocate_entry_below(&space, high), low);

        table.tear_down_space(&space);
        table.tear_down();
    }

    #[test]
    fn torn_down_space_can_be_registered_again() {
        let mut table = tiny_table();
        let space = Space::new();
        table.initialize_space(&space);
        table.allocate_entry(&space);
        table.tear_down_space(&space);
        assert_eq!(space.freelist_length(), 0);

        table.initialize_space(&space);
        let index = table.allocate_entry(&space);
        assert!(space.contains(index));
        assert_eq!(space.num_segments(), 1);
        table.tear_down_space(&space);

        // A space that was torn down may also join another table.
        let mut other = tiny_table();
        other.initialize_space(&space);
        assert!(space.contains(other.allocate_entry(&space)));
        other.tear_down_space(&space);
        other.tear_down();
        table.tear_down();
    }

    #[test]
    fn spaces_own_disjoint_segments() {
        let mut table = tiny_table();
        let a = Space::new();
        let b = Space::new();
        table.initialize_space(&a);
        table.initialize_space(&b);

        let from_a: Vec<u32> = (0..6).map(|_| table.allocate_entry(&a)).collect();
        let from_b: Vec<u32> = (0..6).map(|_| table.allocate_entry(&b)).collect();
        for index in &from_a {
            assert!(a.contains(*index));
            assert!(!b.contains(*index));
        }
        for index in &from_b {
            assert!(b.contains(*index));
            assert!(!a.contains(*index));
        }

        table.tear_down_space(&a);
        table.tear_down_space(&b);
        table.tear_down();
    }

    #[test]
    fn concurrent_allocation_is_unique_and_conserving() {
        const THREADS: usize = 8;
        const PER_THREAD: usize = 500;

        panic_after(10_000, || {
            let mut table = ExternalEntityTable::<TestEntry>::new("concurrent", 256, 1 << 20);
            table.initialize();
            let space = Space::new();
            table.initialize_space(&space);

            let results: Vec<Vec<u32>> = std::thread::scope(|s| {
                let handles: Vec<_> = (0..THREADS)
                    .map(|_| {
                        s.spawn(|| {
                            (0..PER_THREAD)
                                .map(|_| table.allocate_entry(&space))
                                .collect::<Vec<u32>>()
                        })
                    })
                    .collect();
                handles.into_iter().map(|h| h.join().unwrap()).collect()
            });

            let mut all = HashSet::new();
            for index in results.into_iter().flatten() {
                assert_ne!(index, 0);
                assert!(all.insert(index), "entry {} allocated twice", index);
            }
            assert_eq!(all.len(), THREADS * PER_THREAD);
            assert_eq!(
                all.len() + space.freelist_length() as usize,
                space.capacity()
            );

            table.tear_down_space(&space);
            table.tear_down();
        });
    }

    #[test]
    fn emulated_platform_is_used_when_subspaces_are_unavailable() {
        let mut table = ExternalEntityTable::<TestEntry>::new("emulated", 4096, 1 << 20);
        table.initialize_with(&EmulatedAddressSpace);
        assert!(table.is_emulated());
        table.tear_down();
    }

    #[cfg(unix)]
    #[test]
    fn page_sized_segments_use_os_subspace() {
        let segment_size = crate::util::os::memory::page_size();
        let mut table = ExternalEntityTable::<TestEntry>::new("os", segment_size, 1 << 24);
        table.initialize();
        assert!(!table.is_emulated());
        let space = Space::new();
        table.initialize_space(&space);
        let index = table.allocate_entry(&space);
        assert!(space.contains(index));
        table.tear_down_space(&space);
        table.tear_down();
    }

    #[test]
    #[should_panic(expected = "ExternalEntityTable::AllocateSegment")]
    fn exhausting_the_reservation_is_fatal() {
        // Two segments: segment 0 is the null segment, so only one can be handed out.
        let mut table =
            ExternalEntityTable::<TestEntry>::new("exhausted", 32, 64).oom_handler(panicking_oom);
        table.initialize();
        let space = Space::new();
        table.initialize_space(&space);
        for _ in 0..5 {
            table.allocate_entry(&space);
        }
    }
}
