use bytemuck::NoUninit;

/// The head of a space's freelist: the index of the first free entry and the number of
/// free entries. Both halves are updated together by one atomic operation. The length
/// also acts as an ABA counter for the compare-and-swap in the allocator.
#[repr(transparent)]
#[derive(Copy, Clone, PartialEq, Eq, NoUninit)]
pub struct FreelistHead(u64);

impl FreelistHead {
    /// An empty freelist.
    pub const EMPTY: Self = Self::new(0, 0);

    pub const fn new(next: u32, length: u32) -> Self {
        // A freelist with no entries must have a null head.
        debug_assert!(length != 0 || next == 0);
        FreelistHead(((length as u64) << 32) | next as u64)
    }

    /// The index of the first free entry.
    pub const fn next(self) -> u32 {
        self.0 as u32
    }

    pub const fn length(self) -> u32 {
        (self.0 >> 32) as u32
    }

    pub const fn is_empty(self) -> bool {
        self.length() == 0
    }
}

impl std::fmt::Debug for FreelistHead {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FreelistHead")
            .field("next", &self.next())
            .field("length", &self.length())
            .finish()
    }
}
