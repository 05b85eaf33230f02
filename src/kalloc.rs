//! Physical frame allocation.
//!
//! Frames come in two granularities: 4096-byte base frames and 2 MiB
//! super-frames (512 contiguous base frames treated as one unit). Both are
//! zeroed on allocation and always handed back whole.
//!
//! On RISC-V the frames are carved out of the RAM between the end of the
//! kernel image and `PHYSTOP` by a buddy allocator. Everywhere else (host
//! tests) the system allocator stands in, and a "physical" address is simply
//! the pointer address inside the test process.

use core::ptr::NonNull;
use core::sync::atomic::{AtomicUsize, Ordering};

use alloc::alloc::{Layout, alloc_zeroed, dealloc};

use static_assertions::const_assert_eq;

use crate::riscv::{PGSIZE, SUPERPGSIZE};

/// One base frame.
#[repr(C, align(4096))]
pub struct Page([u8; PGSIZE]);

/// One super-frame, naturally aligned.
#[repr(C, align(2097152))]
pub struct SuperPage([u8; SUPERPGSIZE]);

const_assert_eq!(core::mem::size_of::<Page>(), PGSIZE);
const_assert_eq!(core::mem::size_of::<SuperPage>(), 512 * PGSIZE);

static ALLOCATED_PAGES: AtomicUsize = AtomicUsize::new(0);
static ALLOCATED_SUPER_PAGES: AtomicUsize = AtomicUsize::new(0);

/// Allocate a zeroed base frame, or `None` when memory is exhausted.
pub fn alloc_page() -> Option<NonNull<Page>> {
    #[cfg(test)]
    test_hooks::charge()?;

    let page = NonNull::new(unsafe { alloc_zeroed(Layout::new::<Page>()) })?;
    ALLOCATED_PAGES.fetch_add(1, Ordering::Relaxed);
    Some(page.cast())
}

/// Return a base frame to the allocator.
///
/// # Safety
/// `page` must have come from [`alloc_page`] and must not be used afterwards.
pub unsafe fn free_page(page: NonNull<Page>) {
    ALLOCATED_PAGES.fetch_sub(1, Ordering::Relaxed);
    unsafe { dealloc(page.as_ptr().cast(), Layout::new::<Page>()) };
}

/// Allocate a zeroed super-frame, or `None` when memory is exhausted.
pub fn alloc_super_page() -> Option<NonNull<SuperPage>> {
    #[cfg(test)]
    test_hooks::charge()?;

    let page = NonNull::new(unsafe { alloc_zeroed(Layout::new::<SuperPage>()) })?;
    ALLOCATED_SUPER_PAGES.fetch_add(1, Ordering::Relaxed);
    Some(page.cast())
}

/// Return a super-frame to the allocator.
///
/// # Safety
/// `page` must have come from [`alloc_super_page`] and must not be used
/// afterwards.
pub unsafe fn free_super_page(page: NonNull<SuperPage>) {
    ALLOCATED_SUPER_PAGES.fetch_sub(1, Ordering::Relaxed);
    unsafe { dealloc(page.as_ptr().cast(), Layout::new::<SuperPage>()) };
}

/// Number of live base frames.
pub fn allocated_pages() -> usize {
    ALLOCATED_PAGES.load(Ordering::Relaxed)
}

/// Number of live super-frames.
pub fn allocated_super_pages() -> usize {
    ALLOCATED_SUPER_PAGES.load(Ordering::Relaxed)
}

#[cfg(target_arch = "riscv64")]
mod backend {
    use core::alloc::{GlobalAlloc, Layout};

    use buddy_alloc::{BuddyAllocParam, buddy_alloc::BuddyAlloc};

    use crate::memlayout::PHYSTOP;
    use crate::riscv::{PGSIZE, super_round_up};
    use crate::sync::SpinLock;

    // first address after kernel, defined by kernel.ld
    unsafe extern "C" {
        static end: [u8; 0];
    }

    #[global_allocator]
    static KMEM: Kmem = Kmem(SpinLock::new(None));

    struct Kmem(SpinLock<Option<BuddyAlloc>>);
    unsafe impl Sync for Kmem {}

    unsafe impl GlobalAlloc for Kmem {
        unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
            self.0
                .lock()
                .as_mut()
                .expect("kmem to be init")
                .malloc(layout.size())
        }

        unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
            self.0.lock().as_mut().expect("kmem to be init").free(ptr)
        }
    }

    pub fn init() {
        unsafe {
            let mut guard = KMEM.0.lock();

            // aligning the pool base keeps every power-of-two buddy block,
            // super-frames included, naturally aligned
            let base = super_round_up(end.as_ptr() as usize);
            let param = BuddyAllocParam::new(base as *const u8, PHYSTOP - base, PGSIZE);
            let alloc = BuddyAlloc::new(param);

            log::debug!(
                "frame pool {:#x}..{:#x} ({:#x} bytes free)",
                base,
                PHYSTOP,
                alloc.available_bytes()
            );

            *guard = Some(alloc);
        }
    }
}

#[cfg(target_arch = "riscv64")]
pub use backend::init;
