use crate::util::address::Address;
use std::io::Result;

lazy_static! {
    static ref PAGE_SIZE: usize = query_page_size();
}

/// The OS page size. This is the granularity of [`commit`] and [`decommit`].
pub fn page_size() -> usize {
    *PAGE_SIZE
}

/// The protection flags for a committed range.
#[repr(i32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MmapProtection {
    /// Do not allow any access
    NoAccess,
    /// Allow read only
    Read,
    /// Allow read + write
    ReadWrite,
}

/// Annotation for a reserved range.
///
/// This is for debugging. On Linux, the annotation becomes the human-readable name of the
/// mapping (visible in `/proc/self/maps`). The annotation is ignored on other platforms.
pub enum MmapAnnotation<'a> {
    /// The reservation backs an external entity table.
    EntityTable {
        /// The name of the table.
        name: &'a str,
    },
    /// The reservation is for a test case.  Usually constructed using the [`mmap_anno_test!`] macro.
    Test {
        /// The source file.
        file: &'a str,
        /// The line number.
        line: u32,
    },
}

/// Construct an `MmapAnnotation::Test` with the current file name and line number.
#[macro_export]
macro_rules! mmap_anno_test {
    () => {
        &$crate::util::os::MmapAnnotation::Test {
            file: file!(),
            line: line!(),
        }
    };
}

impl std::fmt::Display for MmapAnnotation<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MmapAnnotation::EntityTable { name } => write!(f, "sandmark:table:{name}"),
            MmapAnnotation::Test { file, line } => write!(f, "sandmark:test:{file}:{line}"),
        }
    }
}

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        impl MmapProtection {
            fn into_native_flags(self) -> i32 {
                match self {
                    Self::NoAccess => libc::PROT_NONE,
                    Self::Read => libc::PROT_READ,
                    Self::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
                }
            }
        }

        fn query_page_size() -> usize {
            let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
            if size <= 0 {
                4096
            } else {
                size as usize
            }
        }

        /// Reserve `size` bytes of inaccessible address space aligned to `alignment`.
        /// No physical memory is committed until [`commit`] is called on a sub-range.
        pub fn reserve(
            size: usize,
            alignment: usize,
            annotation: &MmapAnnotation,
        ) -> Result<Address> {
            debug_assert!(alignment.is_power_of_two());
            let alignment = alignment.max(page_size());
            // Over-reserve so an aligned start exists, then give back the slack on both sides.
            let padded = size + alignment;
            let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE;
            let ptr = unsafe {
                libc::mmap(std::ptr::null_mut(), padded, libc::PROT_NONE, flags, -1, 0)
            };
            if ptr == libc::MAP_FAILED {
                return Err(std::io::Error::last_os_error());
            }
            let raw = Address::from_mut_ptr(ptr);
            let start = raw.align_up(alignment);
            let head = start - raw;
            let tail = padded - head - size;
            if head > 0 {
                release(raw, head)?;
            }
            if tail > 0 {
                release(start + size, tail)?;
            }
            set_vma_name(start, size, annotation);
            Ok(start)
        }

        /// Make a page-aligned sub-range of a reservation accessible.
        pub fn commit(start: Address, size: usize, prot: MmapProtection) -> Result<()> {
            wrap_libc_call(
                &|| unsafe { libc::mprotect(start.to_mut_ptr(), size, prot.into_native_flags()) },
                0,
            )
        }

        /// Return the physical pages of a range to the OS and make it inaccessible again.
        /// The range stays reserved, and reads zero once it is committed again.
        pub fn decommit(start: Address, size: usize) -> Result<()> {
            wrap_libc_call(
                &|| unsafe { libc::madvise(start.to_mut_ptr(), size, libc::MADV_DONTNEED) },
                0,
            )?;
            commit(start, size, MmapProtection::NoAccess)
        }

        /// Unmap a range.
        pub fn release(start: Address, size: usize) -> Result<()> {
            wrap_libc_call(&|| unsafe { libc::munmap(start.to_mut_ptr(), size) }, 0)
        }

        /// Check whether the given OS error number indicates an out-of-memory condition.
        pub fn is_mmap_oom(os_errno: i32) -> bool {
            os_errno == libc::ENOMEM
        }

        fn wrap_libc_call<T: PartialEq>(f: &dyn Fn() -> T, expect: T) -> Result<()> {
            let ret = f();
            if ret == expect {
                Ok(())
            } else {
                Err(std::io::Error::last_os_error())
            }
        }
    } else {
        fn query_page_size() -> usize {
            4096
        }

        fn unsupported() -> std::io::Error {
            std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "address space reservation is not supported on this platform",
            )
        }

        pub fn reserve(
            _size: usize,
            _alignment: usize,
            _annotation: &MmapAnnotation,
        ) -> Result<Address> {
            Err(unsupported())
        }

        pub fn commit(_start: Address, _size: usize, _prot: MmapProtection) -> Result<()> {
            Err(unsupported())
        }

        pub fn decommit(_start: Address, _size: usize) -> Result<()> {
            Err(unsupported())
        }

        pub fn release(_start: Address, _size: usize) -> Result<()> {
            Err(unsupported())
        }

        pub fn is_mmap_oom(_os_errno: i32) -> bool {
            false
        }
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn set_vma_name(start: Address, size: usize, annotation: &MmapAnnotation) {
    // `PR_SET_VMA` is new in Linux 5.17. Older kernels return `EINVAL`, and the name is
    // only for debugging, so failures are logged and ignored.
    let Ok(anno_cstr) = std::ffi::CString::new(annotation.to_string()) else {
        return;
    };
    let result = wrap_libc_call(
        &|| unsafe {
            libc::prctl(
                libc::PR_SET_VMA,
                libc::PR_SET_VMA_ANON_NAME,
                start.to_ptr::<libc::c_void>(),
                size,
                anno_cstr.as_ptr(),
            )
        },
        0,
    );
    if let Err(e) = result {
        debug!("Error while calling prctl: {e}");
    }
}

#[cfg(all(unix, not(any(target_os = "linux", target_os = "android"))))]
fn set_vma_name(_start: Address, _size: usize, _annotation: &MmapAnnotation) {}
