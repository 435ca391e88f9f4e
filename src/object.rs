//! Object lifecycle policy: build items in place, destroy them, relocate them.
//!
//! Every Rust move is a bitwise copy that cannot fail, so every item type is
//! trivially relocatable and `relocate` is a plain `memcpy`. What can fail is
//! the item constructor: callers hand in a creator closure that runs exactly
//! once, and `relocate_create` runs it *before* touching any existing item so
//! a panicking creator leaves the source range untouched.

use core::mem;
use core::ptr;

/// Write `creator()` into `dst`. If the creator panics `dst` stays
/// uninitialized and the panic propagates.
///
/// # Safety
/// `dst` must be valid for writes and properly aligned.
#[inline]
pub(crate) unsafe fn construct<T, F>(dst: *mut T, creator: F)
where
    F: FnOnce() -> T,
{
    ptr::write(dst, creator());
}

/// Drop `count` consecutive items starting at `items`.
///
/// # Safety
/// The range must hold initialized items that are not used afterwards.
#[inline]
pub(crate) unsafe fn destroy<T>(items: *mut T, count: usize) {
    if mem::needs_drop::<T>() && count > 0 {
        ptr::drop_in_place(ptr::slice_from_raw_parts_mut(items, count));
    }
}

/// Move `count` items from `src` to `dst`; `src` is logically empty
/// afterwards.
///
/// # Safety
/// Both ranges must be valid, aligned and non-overlapping; `src` must be
/// initialized and `dst` uninitialized.
#[inline]
pub(crate) unsafe fn relocate<T>(src: *const T, dst: *mut T, count: usize) {
    ptr::copy_nonoverlapping(src, dst, count);
}

/// Relocate `count` items from `src` into `dst` and build one new item at
/// `new_item` in the same pass. The creator runs first; once it returns
/// nothing else can fail, so the sequence has a single rollback point.
///
/// # Safety
/// Same requirements as [`relocate`] for the two ranges; `new_item` must be
/// valid for writes and must not alias either range.
pub(crate) unsafe fn relocate_create<T, F>(
    src: *const T,
    dst: *mut T,
    count: usize,
    creator: F,
    new_item: *mut T,
) where
    F: FnOnce() -> T,
{
    construct(new_item, creator);
    relocate(src, dst, count);
}
