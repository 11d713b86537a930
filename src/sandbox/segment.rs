use crate::util::conversions::raw_is_aligned;

/// The geometry of an entity table: how big its entries and segments are, and how much
/// address space it reserves.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TableLayout {
    entry_size: usize,
    segment_size: usize,
    reservation_size: usize,
}

impl TableLayout {
    /// Segment and reservation sizes must be powers of two, and a segment must hold
    /// at least two entries.
    pub const fn new(entry_size: usize, segment_size: usize, reservation_size: usize) -> Self {
        assert!(entry_size.is_power_of_two());
        assert!(segment_size.is_power_of_two());
        assert!(reservation_size.is_power_of_two());
        assert!(segment_size >= 2 * entry_size);
        assert!(reservation_size >= 2 * segment_size);
        assert!(reservation_size / entry_size <= u32::MAX as usize);
        Self {
            entry_size,
            segment_size,
            reservation_size,
        }
    }

    pub const fn entry_size(&self) -> usize {
        self.entry_size
    }

    pub const fn segment_size(&self) -> usize {
        self.segment_size
    }

    pub const fn reservation_size(&self) -> usize {
        self.reservation_size
    }

    pub const fn entries_per_segment(&self) -> u32 {
        (self.segment_size / self.entry_size) as u32
    }

    pub const fn max_entries(&self) -> u32 {
        (self.reservation_size / self.entry_size) as u32
    }

    pub const fn max_segments(&self) -> u32 {
        (self.reservation_size / self.segment_size) as u32
    }
}

/// A segment of a table: a `segment_size` aligned range of the reservation, identified by
/// its number. Segment 0 holds the null entry and never belongs to a space.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Segment {
    number: u32,
}

impl Segment {
    /// The segment that starts at `offset` bytes into the reservation.
    pub fn at(offset: usize, layout: &TableLayout) -> Self {
        debug_assert!(raw_is_aligned(offset, layout.segment_size()));
        debug_assert!(offset < layout.reservation_size());
        Segment {
            number: (offset / layout.segment_size()) as u32,
        }
    }

    pub(crate) const fn new(number: u32) -> Self {
        Segment { number }
    }

    /// The segment that holds the entry at `entry_index`.
    pub fn containing(entry_index: u32, layout: &TableLayout) -> Self {
        Segment {
            number: entry_index / layout.entries_per_segment(),
        }
    }

    pub fn number(self) -> u32 {
        self.number
    }

    pub fn offset(self, layout: &TableLayout) -> usize {
        self.number as usize * layout.segment_size()
    }

    pub fn first_entry(self, layout: &TableLayout) -> u32 {
        self.number * layout.entries_per_segment()
    }

    pub fn last_entry(self, layout: &TableLayout) -> u32 {
        self.first_entry(layout) + layout.entries_per_segment() - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LAYOUT: TableLayout = TableLayout::new(8, 32, 1024);

    #[test]
    fn geometry() {
        assert_eq!(LAYOUT.entries_per_segment(), 4);
        assert_eq!(LAYOUT.max_entries(), 128);
        assert_eq!(LAYOUT.max_segments(), 32);
    }

    #[test]
    fn segment_entries() {
        let segment = Segment::at(64, &LAYOUT);
        assert_eq!(segment.number(), 2);
        assert_eq!(segment.offset(&LAYOUT), 64);
        assert_eq!(segment.first_entry(&LAYOUT), 8);
        assert_eq!(segment.last_entry(&LAYOUT), 11);
        for index in 8..=11 {
            assert_eq!(Segment::containing(index, &LAYOUT), segment);
        }
        assert_ne!(Segment::containing(12, &LAYOUT), segment);
    }

    #[test]
    fn segments_are_ordered_by_number() {
        let a = Segment::at(32, &LAYOUT);
        let b = Segment::at(96, &LAYOUT);
        assert!(a < b);
    }
}
