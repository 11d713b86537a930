//! Virtual address space providers for entity tables.
//!
//! A table never allocates its storage from the Rust heap. It asks a [`PlatformAddressSpace`]
//! for a dedicated subspace, and then carves segments out of that subspace through the
//! [`VirtualAddressSpace`] interface.

use std::alloc::Layout;
use std::sync::Mutex;

use crate::util::conversions::raw_is_aligned;
use crate::util::os::memory::{self, MmapAnnotation, MmapProtection};
use crate::util::Address;

/// Called when address space cannot be reserved or a segment cannot be committed.
/// There is no way to continue with a partially initialized table, so the handler never returns.
pub type FatalOutOfMemoryHandler = fn(location: &str) -> !;

/// The default [`FatalOutOfMemoryHandler`]: log and abort the process.
pub fn fatal_process_out_of_memory(location: &str) -> ! {
    error!("Fatal process out of memory: {}", location);
    std::process::abort()
}

/// A contiguous region of reserved address space in which pages can be allocated
/// and freed with a given protection.
pub trait VirtualAddressSpace: Send + Sync {
    /// The start of the region.
    fn base(&self) -> Address;

    /// The size of the region in bytes.
    fn size(&self) -> usize;

    /// Sizes and alignments passed to [`VirtualAddressSpace::allocate_pages`] must be multiples of this.
    fn allocation_granularity(&self) -> usize;

    /// Allocate `size` bytes aligned to `alignment`. If `hint` is free it is used, otherwise
    /// the lowest free range is used. Returns `None` if the region is exhausted or the OS
    /// refuses to commit the pages. Fresh pages read as zero.
    fn allocate_pages(
        &self,
        hint: Option<Address>,
        size: usize,
        alignment: usize,
        permissions: MmapProtection,
    ) -> Option<Address>;

    /// Free pages previously returned by [`VirtualAddressSpace::allocate_pages`].
    fn free_pages(&self, address: Address, size: usize);

    /// Is this region fully backed rather than a real subspace? Emulated regions cannot
    /// enforce page permissions.
    fn is_emulated(&self) -> bool {
        false
    }
}

/// The root provider of address space.
pub trait PlatformAddressSpace: Sync {
    /// Can this platform reserve subspaces with independent page permissions?
    fn can_allocate_subspaces(&self) -> bool;

    /// Reserve a subspace of `size` bytes aligned to `alignment`.
    fn allocate_subspace(
        &self,
        size: usize,
        alignment: usize,
        annotation: &MmapAnnotation,
    ) -> Option<Box<dyn VirtualAddressSpace>>;

    /// Allocate a fully backed region of `size` bytes aligned to `alignment` and wrap it
    /// in an emulated subspace that hands out `granularity` sized pages.
    fn allocate_emulated_subspace(
        &self,
        size: usize,
        alignment: usize,
        granularity: usize,
    ) -> Option<Box<dyn VirtualAddressSpace>> {
        EmulatedSubspace::new(size, alignment, granularity)
            .map(|vas| Box::new(vas) as Box<dyn VirtualAddressSpace>)
    }
}

/// The operating system's address space.
pub struct OsAddressSpace;

impl PlatformAddressSpace for OsAddressSpace {
    fn can_allocate_subspaces(&self) -> bool {
        cfg!(unix)
    }

    fn allocate_subspace(
        &self,
        size: usize,
        alignment: usize,
        annotation: &MmapAnnotation,
    ) -> Option<Box<dyn VirtualAddressSpace>> {
        match OsSubspace::reserve(size, alignment, annotation) {
            Ok(vas) => Some(Box::new(vas)),
            Err(e) => {
                let oom = e.raw_os_error().is_some_and(memory::is_mmap_oom);
                warn!(
                    "Failed to reserve a subspace of {} bytes (out of memory: {}): {}",
                    size, oom, e
                );
                None
            }
        }
    }
}

/// A platform that cannot reserve subspaces. Tables built on it always use an emulated subspace.
pub struct EmulatedAddressSpace;

impl PlatformAddressSpace for EmulatedAddressSpace {
    fn can_allocate_subspaces(&self) -> bool {
        false
    }

    fn allocate_subspace(
        &self,
        _size: usize,
        _alignment: usize,
        _annotation: &MmapAnnotation,
    ) -> Option<Box<dyn VirtualAddressSpace>> {
        None
    }
}

/// First-fit bookkeeping for a region carved into pages of equal size.
struct PageAllocator {
    granularity: usize,
    used: Vec<bool>,
}

impl PageAllocator {
    fn new(size: usize, granularity: usize) -> Self {
        debug_assert!(raw_is_aligned(size, granularity));
        Self {
            granularity,
            used: vec![false; size / granularity],
        }
    }

    fn is_free(&self, first: usize, pages: usize) -> bool {
        first + pages <= self.used.len() && self.used[first..first + pages].iter().all(|u| !u)
    }

    fn set(&mut self, first: usize, pages: usize, used: bool) {
        self.used[first..first + pages].fill(used);
    }

    /// Returns the index of the first allocated page.
    fn allocate(&mut self, hint: Option<usize>, pages: usize, align_pages: usize) -> Option<usize> {
        if let Some(hint) = hint {
            if hint % align_pages == 0 && self.is_free(hint, pages) {
                self.set(hint, pages, true);
                return Some(hint);
            }
        }
        let mut first = 0;
        while first + pages <= self.used.len() {
            if self.is_free(first, pages) {
                self.set(first, pages, true);
                return Some(first);
            }
            first += align_pages;
        }
        None
    }

    fn free(&mut self, first: usize, pages: usize) {
        debug_assert!(
            self.used[first..first + pages].iter().all(|u| *u),
            "freeing pages that are not allocated"
        );
        self.set(first, pages, false);
    }

    /// Convert an allocation request in bytes into page units.
    fn pages_for(
        &self,
        base: Address,
        hint: Option<Address>,
        size: usize,
        alignment: usize,
    ) -> (Option<usize>, usize, usize) {
        debug_assert!(raw_is_aligned(size, self.granularity));
        debug_assert!(raw_is_aligned(alignment, self.granularity));
        let hint = hint
            .filter(|h| *h >= base)
            .map(|h| (h - base) / self.granularity);
        let align = (alignment / self.granularity).max(1);
        (hint, size / self.granularity, align)
    }
}

/// A subspace backed by an inaccessible OS reservation. Pages are committed with
/// `mprotect` when allocated and handed back to the OS when freed.
pub struct OsSubspace {
    base: Address,
    size: usize,
    pages: Mutex<PageAllocator>,
}

impl OsSubspace {
    pub fn reserve(
        size: usize,
        alignment: usize,
        annotation: &MmapAnnotation,
    ) -> std::io::Result<Self> {
        let base = memory::reserve(size, alignment, annotation)?;
        let end = base + size;
        debug!("Reserved subspace {}..{} ({} bytes)", base, end, size);
        Ok(Self {
            base,
            size,
            pages: Mutex::new(PageAllocator::new(size, memory::page_size())),
        })
    }
}

impl VirtualAddressSpace for OsSubspace {
    fn base(&self) -> Address {
        self.base
    }

    fn size(&self) -> usize {
        self.size
    }

    fn allocation_granularity(&self) -> usize {
        memory::page_size()
    }

    fn allocate_pages(
        &self,
        hint: Option<Address>,
        size: usize,
        alignment: usize,
        permissions: MmapProtection,
    ) -> Option<Address> {
        let mut pages = self.pages.lock().unwrap();
        let (hint, count, align) = pages.pages_for(self.base, hint, size, alignment);
        let first = pages.allocate(hint, count, align)?;
        let start = self.base + first * pages.granularity;
        if let Err(e) = memory::commit(start, size, permissions) {
            warn!("Failed to commit {} bytes at {}: {}", size, start, e);
            pages.free(first, count);
            return None;
        }
        Some(start)
    }

    fn free_pages(&self, address: Address, size: usize) {
        debug_assert!(address.range_within(size, self.base, self.size));
        if let Err(e) = memory::decommit(address, size) {
            warn!("Failed to decommit {} bytes at {}: {}", size, address, e);
        }
        let mut pages = self.pages.lock().unwrap();
        let first = (address - self.base) / pages.granularity;
        let count = size / pages.granularity;
        pages.free(first, count);
    }
}

impl Drop for OsSubspace {
    fn drop(&mut self) {
        if let Err(e) = memory::release(self.base, self.size) {
            warn!("Failed to release subspace at {}: {}", self.base, e);
        }
    }
}

enum Backing {
    Mapped,
    Allocated(Layout),
}

/// A fully backed region that only keeps page bookkeeping. Used where subspaces are
/// unavailable, or where the table's segments are smaller than an OS page.
/// Page permissions are not enforced.
pub struct EmulatedSubspace {
    base: Address,
    size: usize,
    backing: Backing,
    pages: Mutex<PageAllocator>,
}

impl EmulatedSubspace {
    pub fn new(size: usize, alignment: usize, granularity: usize) -> Option<Self> {
        if size == 0 || !alignment.is_power_of_two() || !raw_is_aligned(size, granularity) {
            return None;
        }
        let (base, backing) = match Self::map(size, alignment) {
            Some(base) => (base, Backing::Mapped),
            None => {
                let layout = Layout::from_size_align(size, alignment).ok()?;
                let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
                if ptr.is_null() {
                    return None;
                }
                (Address::from_mut_ptr(ptr), Backing::Allocated(layout))
            }
        };
        let end = base + size;
        debug!("Emulated subspace {}..{} ({} bytes)", base, end, size);
        Some(Self {
            base,
            size,
            backing,
            pages: Mutex::new(PageAllocator::new(size, granularity)),
        })
    }

    fn map(size: usize, alignment: usize) -> Option<Address> {
        if !raw_is_aligned(size, memory::page_size()) {
            return None;
        }
        let annotation = MmapAnnotation::EntityTable { name: "emulated" };
        let base = memory::reserve(size, alignment, &annotation).ok()?;
        if memory::commit(base, size, MmapProtection::ReadWrite).is_err() {
            let _ = memory::release(base, size);
            return None;
        }
        Some(base)
    }
}

impl VirtualAddressSpace for EmulatedSubspace {
    fn base(&self) -> Address {
        self.base
    }

    fn size(&self) -> usize {
        self.size
    }

    fn allocation_granularity(&self) -> usize {
        self.pages.lock().unwrap().granularity
    }

    fn allocate_pages(
        &self,
        hint: Option<Address>,
        size: usize,
        alignment: usize,
        _permissions: MmapProtection,
    ) -> Option<Address> {
        let mut pages = self.pages.lock().unwrap();
        let (hint, count, align) = pages.pages_for(self.base, hint, size, alignment);
        let first = pages.allocate(hint, count, align)?;
        Some(self.base + first * pages.granularity)
    }

    fn free_pages(&self, address: Address, size: usize) {
        debug_assert!(address.range_within(size, self.base, self.size));
        // The memory stays backed, so clear it to keep the zero-on-allocate contract.
        unsafe {
            std::ptr::write_bytes(address.to_mut_ptr::<u8>(), 0, size);
        }
        let mut pages = self.pages.lock().unwrap();
        let first = (address - self.base) / pages.granularity;
        let count = size / pages.granularity;
        pages.free(first, count);
    }

    fn is_emulated(&self) -> bool {
        true
    }
}

impl Drop for EmulatedSubspace {
    fn drop(&mut self) {
        match self.backing {
            Backing::Mapped => {
                if let Err(e) = memory::release(self.base, self.size) {
                    warn!("Failed to release emulated subspace {}: {}", self.base, e);
                }
            }
            Backing::Allocated(layout) => unsafe {
                std::alloc::dealloc(self.base.to_mut_ptr(), layout);
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_allocator_first_fit_and_hint() {
        let mut pages = PageAllocator::new(8 * 16, 16);
        assert_eq!(pages.allocate(Some(0), 2, 2), Some(0));
        assert_eq!(pages.allocate(None, 2, 2), Some(2));
        // The hint is taken when free.
        assert_eq!(pages.allocate(Some(6), 2, 2), Some(6));
        // Otherwise the lowest free aligned range is used.
        assert_eq!(pages.allocate(Some(6), 2, 2), Some(4));
        assert_eq!(pages.allocate(None, 2, 2), None);
        pages.free(2, 2);
        assert_eq!(pages.allocate(None, 2, 2), Some(2));
    }

    #[test]
    fn emulated_subspace_hands_out_zeroed_pages() {
        let vas = EmulatedSubspace::new(4 * 32, 32, 32).unwrap();
        assert!(vas.is_emulated());
        assert!(vas.base().is_aligned_to(32));
        let first = vas
            .allocate_pages(Some(vas.base()), 32, 32, MmapProtection::Read)
            .unwrap();
        assert_eq!(first, vas.base());
        let second = vas
            .allocate_pages(None, 32, 32, MmapProtection::ReadWrite)
            .unwrap();
        assert_eq!(second, vas.base() + 32);
        unsafe {
            *second.to_mut_ptr::<u64>() = 7;
        }
        vas.free_pages(second, 32);
        let again = vas
            .allocate_pages(None, 32, 32, MmapProtection::ReadWrite)
            .unwrap();
        assert_eq!(again, second);
        unsafe {
            assert_eq!(*again.to_ptr::<u64>(), 0);
        }
    }

    #[test]
    fn emulated_subspace_exhaustion() {
        let vas = EmulatedSubspace::new(2 * 64, 64, 64).unwrap();
        let rw = MmapProtection::ReadWrite;
        assert!(vas.allocate_pages(None, 64, 64, rw).is_some());
        assert!(vas.allocate_pages(None, 64, 64, rw).is_some());
        assert!(vas.allocate_pages(None, 64, 64, rw).is_none());
    }

    #[cfg(unix)]
    #[test]
    fn os_subspace_commits_on_allocation() {
        let page = memory::page_size();
        let vas = OsAddressSpace
            .allocate_subspace(16 * page, 4 * page, crate::mmap_anno_test!())
            .unwrap();
        assert!(!vas.is_emulated());
        let start = vas
            .allocate_pages(None, 4 * page, 4 * page, MmapProtection::ReadWrite)
            .unwrap();
        assert!(start.is_aligned_to(4 * page));
        unsafe {
            *start.to_mut_ptr::<u64>() = 1;
            assert_eq!(*start.to_ptr::<u64>(), 1);
        }
        vas.free_pages(start, 4 * page);
    }
}
