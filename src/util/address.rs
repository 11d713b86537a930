use bytemuck::NoUninit;

use std::fmt;
use std::ops::*;

/// size in bytes
pub type ByteSize = usize;

/// Address represents a raw address inside a reservation owned by this crate, such as
/// the base of an external entity table or the start of one of its segments.
/// It is zero overhead and only used for address arithmetic. Handles into tables
/// are never addresses, they are plain integer indices.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, Hash, PartialOrd, Ord, PartialEq, NoUninit)]
pub struct Address(usize);

/// Address + ByteSize (positive)
impl Add<ByteSize> for Address {
    type Output = Address;
    fn add(self, offset: ByteSize) -> Address {
        Address(self.0 + offset)
    }
}

/// Address += ByteSize (positive)
impl AddAssign<ByteSize> for Address {
    fn add_assign(&mut self, offset: ByteSize) {
        self.0 += offset;
    }
}

/// Address - ByteSize (positive)
impl Sub<ByteSize> for Address {
    type Output = Address;
    fn sub(self, offset: ByteSize) -> Address {
        Address(self.0 - offset)
    }
}

/// Address - Address (the first address must be higher)
impl Sub<Address> for Address {
    type Output = ByteSize;
    fn sub(self, other: Address) -> ByteSize {
        debug_assert!(
            self.0 >= other.0,
            "for (addr_a - addr_b), a({}) needs to be larger than b({})",
            self,
            other
        );
        self.0 - other.0
    }
}

impl Address {
    /// The lowest possible address.
    pub const ZERO: Self = Address(0);

    /// creates Address from a Rust reference
    pub fn from_ref<T>(r: &T) -> Address {
        Address(r as *const T as usize)
    }

    /// creates Address from a mutable pointer
    pub fn from_mut_ptr<T>(ptr: *mut T) -> Address {
        Address(ptr as usize)
    }

    /// creates an arbitrary Address
    /// # Safety
    /// It is unsafe and the user needs to be aware that they may create an invalid address.
    pub const unsafe fn from_usize(raw: usize) -> Address {
        Address(raw)
    }

    /// is this address zero?
    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// aligns up the address to the given alignment
    pub const fn align_up(self, align: ByteSize) -> Address {
        Address(crate::util::conversions::raw_align_up(self.0, align))
    }

    /// is this address aligned to the given alignment
    pub const fn is_aligned_to(self, align: usize) -> bool {
        self.0 % align == 0
    }

    /// converts the Address to a pointer
    pub fn to_ptr<T>(self) -> *const T {
        self.0 as *const T
    }

    /// converts the Address to a mutable pointer
    pub fn to_mut_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }

    /// converts the Address to a pointer-sized integer
    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// Does the range `[self, self + size)` lie entirely in `[start, start + extent)`?
    pub fn range_within(self, size: ByteSize, start: Address, extent: ByteSize) -> bool {
        self >= start && self.0 + size <= start.0 + extent
    }
}

impl fmt::LowerHex for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use crate::util::Address;

    #[test]
    fn align_up() {
        unsafe {
            assert_eq!(Address::from_usize(0).align_up(8), Address::from_usize(0));
            assert_eq!(Address::from_usize(1).align_up(8), Address::from_usize(8));
            assert_eq!(
                Address::from_usize(0x1001).align_up(0x1000),
                Address::from_usize(0x2000)
            );
        }
    }

    #[test]
    fn range_within() {
        unsafe {
            let start = Address::from_usize(0x1000);
            let last = Address::from_usize(0x1f00);
            let past = Address::from_usize(0x1f01);
            let before = Address::from_usize(0x0fff);
            assert!(start.range_within(0x100, start, 0x1000));
            assert!(last.range_within(0x100, start, 0x1000));
            assert!(!past.range_within(0x100, start, 0x1000));
            assert!(!before.range_within(1, start, 0x1000));
        }
    }

    #[test]
    fn subtract() {
        unsafe {
            let a = Address::from_usize(0x3000);
            let b = Address::from_usize(0x1000);
            assert_eq!(a - b, 0x2000);
            assert_eq!(a - 0x1000usize, Address::from_usize(0x2000));
        }
    }
}
