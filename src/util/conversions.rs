use crate::util::os::memory::page_size;

/* Alignment */

pub const fn raw_align_up(val: usize, align: usize) -> usize {
    // See https://github.com/rust-lang/rust/blob/e620d0f337d0643c757bab791fc7d88d63217704/src/libcore/alloc.rs#L192
    val.wrapping_add(align).wrapping_sub(1) & !align.wrapping_sub(1)
}

pub const fn raw_is_aligned(val: usize, align: usize) -> bool {
    val & align.wrapping_sub(1) == 0
}

/// Is `bytes` a whole number of OS pages?
pub fn is_page_multiple(bytes: usize) -> bool {
    bytes != 0 && raw_is_aligned(bytes, page_size())
}
