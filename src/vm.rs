use core::cmp::min;
use core::fmt;
use core::ops::{Deref, DerefMut};
use core::ptr::{self, NonNull};

use log::trace;
use static_assertions::const_assert_eq;

use crate::kalloc::{self, Page, SuperPage};
use crate::memlayout::kstack;
#[cfg(target_arch = "riscv64")]
use crate::memlayout::{KERNBASE, PHYSTOP, PLIC, PLIC_SIZE, TRAMPOLINE, UART0, VIRTIO0};
#[cfg(all(target_arch = "riscv64", feature = "net"))]
use crate::memlayout::{E1000, E1000_SIZE, ECAM, ECAM_SIZE};
use crate::param::{NKSTACK_PAGES, NPROC};
#[cfg(target_arch = "riscv64")]
use crate::riscv::registers::{satp, vma};
use crate::riscv::{
    MAXVA, PGSIZE, PteFlags, SUPERPGSIZE, pa_to_pte, pg_round_down, pg_round_up, pte_to_pa, px,
    super_round_down, super_round_up,
};
use crate::sync::OnceLock;

// kernel.ld sets these to the end of kernel code and the trampoline section
#[cfg(target_arch = "riscv64")]
unsafe extern "C" {
    fn etext();
    fn trampoline();
}

/// The kernel's page table, shared by every hart.
pub static KVM: OnceLock<Kvm> = OnceLock::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    OutOfMemory,
    InvalidAddress,
    NotMapped,
    AccessDenied,
    UnterminatedString,
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmError::OutOfMemory => write!(f, "out of memory"),
            VmError::InvalidAddress => write!(f, "invalid address"),
            VmError::NotMapped => write!(f, "not mapped"),
            VmError::AccessDenied => write!(f, "access denied"),
            VmError::UnterminatedString => write!(f, "unterminated string"),
        }
    }
}

#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PA(pub usize);

impl From<usize> for PA {
    fn from(value: usize) -> Self {
        Self(value)
    }
}

#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VA(pub usize);

impl From<usize> for VA {
    fn from(value: usize) -> Self {
        Self(value)
    }
}

#[repr(transparent)]
#[derive(Debug, Clone, Copy)]
struct PageTableEntry(usize);

impl PageTableEntry {
    fn make(pa: PA, flags: PteFlags) -> Self {
        Self(pa_to_pte(pa.0) | flags.bits())
    }

    /// Check if the PTE is valid.
    fn is_v(&self) -> bool {
        self.0 & PteFlags::V.bits() != 0
    }

    /// Check if the PTE is accessible by user mode instructions.
    fn is_u(&self) -> bool {
        self.0 & PteFlags::U.bits() != 0
    }

    /// Check if the PTE is writable.
    fn is_w(&self) -> bool {
        self.0 & PteFlags::W.bits() != 0
    }

    /// Return the flags of the PTE.
    fn flags(&self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0)
    }

    /// Check if the PTE is a leaf (pointing to a PA).
    fn is_leaf(&self) -> bool {
        // a leaf has at least one of the permission bits set
        self.flags().intersects(PteFlags::RWX)
    }

    fn clear_u(&mut self) {
        self.0 &= !PteFlags::U.bits();
    }

    fn as_pa(&self) -> PA {
        PA(pte_to_pa(self.0))
    }
}

#[repr(C, align(4096))]
struct RawPageTable([PageTableEntry; 512]);

const_assert_eq!(core::mem::size_of::<RawPageTable>(), PGSIZE);

impl RawPageTable {
    /// Allocate a zeroed page-table node.
    fn try_new() -> Result<NonNull<Self>, VmError> {
        match kalloc::alloc_page() {
            Some(page) => Ok(page.cast()),
            None => Err(VmError::OutOfMemory),
        }
    }
}

/// What a walk found at a virtual address: nothing on the path, a base-page
/// leaf, or a superpage leaf one level up.
#[derive(Debug)]
enum Walked<'a> {
    Absent,
    Leaf(&'a mut PageTableEntry),
    SuperLeaf(&'a mut PageTableEntry),
}

/// An Sv39 translation tree. The root exclusively owns its interior nodes
/// through the physical addresses encoded in their parent entries.
#[derive(Debug)]
pub struct PageTable {
    ptr: *mut RawPageTable,
}

impl PageTable {
    pub fn try_new() -> Result<Self, VmError> {
        Ok(Self {
            ptr: RawPageTable::try_new()?.as_ptr(),
        })
    }

    fn from_pa(pa: PA) -> Self {
        Self {
            ptr: pa.0 as *mut RawPageTable,
        }
    }

    pub fn as_pa(&self) -> PA {
        PA(self.ptr as usize)
    }

    /// Descend from the root towards `va` and report the leaf covering it.
    ///
    /// A valid entry without permission bits at the bottom level, or a leaf at
    /// the root level, means the tree is corrupt and is fatal.
    fn walk(&mut self, va: VA) -> Result<Walked<'_>, VmError> {
        if va.0 >= MAXVA {
            return Err(VmError::InvalidAddress);
        }

        let mut pagetable = self.ptr;

        unsafe {
            for level in (0..=2).rev() {
                let pte = &mut (*pagetable).0[px(level, va.0)];

                if !pte.is_v() {
                    return Ok(Walked::Absent);
                }

                if pte.is_leaf() {
                    return match level {
                        2 => panic!("walk: superpage entry at level 2"),
                        1 => Ok(Walked::SuperLeaf(pte)),
                        _ => Ok(Walked::Leaf(pte)),
                    };
                }

                if level == 0 {
                    panic!("walk: non-leaf entry at level 0");
                }

                pagetable = pte.as_pa().0 as *mut RawPageTable;
            }
        }

        unreachable!()
    }

    /// Descend towards `va`, allocating interior nodes on demand, and return
    /// the slot for a new leaf: level 1 for a superpage, level 0 otherwise.
    ///
    /// Interior nodes allocated before an `OutOfMemory` are not backed out;
    /// they stay with the tree until it is torn down.
    fn walk_alloc(&mut self, va: VA, super_page: bool) -> Result<NonNull<PageTableEntry>, VmError> {
        assert!(va.0 < MAXVA, "walk_alloc");

        let target = if super_page { 1 } else { 0 };
        let mut pagetable = self.ptr;

        unsafe {
            for level in (target..=2).rev() {
                let pte = &mut (*pagetable).0[px(level, va.0)];

                if level == target {
                    assert!(!pte.is_v(), "walk_alloc: remap");
                    return Ok(NonNull::from(pte));
                }

                if pte.is_v() {
                    pagetable = pte.as_pa().0 as *mut RawPageTable;
                } else {
                    pagetable = RawPageTable::try_new()?.as_ptr();
                    *pte = PageTableEntry::make(PA(pagetable as usize), PteFlags::V);
                }
            }
        }

        unreachable!()
    }

    /// Look up a virtual address and return the physical address it maps to.
    /// Can only be used to look up user pages.
    pub fn walk_addr(&mut self, va: VA) -> Result<PA, VmError> {
        match self.walk(va)? {
            Walked::Absent => Err(VmError::NotMapped),
            Walked::Leaf(pte) => {
                if !pte.is_u() {
                    return Err(VmError::AccessDenied);
                }
                Ok(PA(pte.as_pa().0 + (va.0 - pg_round_down(va.0))))
            }
            Walked::SuperLeaf(pte) => {
                if !pte.is_u() {
                    return Err(VmError::AccessDenied);
                }
                Ok(PA(pte.as_pa().0 + (va.0 - super_round_down(va.0))))
            }
        }
    }

    /// Create PTEs for virtual addresses starting at `va` that refer to
    /// physical addresses starting at `pa`. `va` and `size` MUST be
    /// page-aligned. With `allow_super` set and a size of at least one
    /// superpage, both MUST be superpage-aligned and the whole range is
    /// mapped with superpage leaves.
    ///
    /// On failure, every leaf this call had installed is removed again;
    /// interior nodes allocated on the way stay for the eventual teardown.
    pub fn map_pages(
        &mut self,
        allow_super: bool,
        va: VA,
        pa: PA,
        size: usize,
        perm: PteFlags,
    ) -> Result<(), VmError> {
        assert!(va.0.is_multiple_of(PGSIZE), "map_pages: va not aligned");
        assert!(size.is_multiple_of(PGSIZE), "map_pages: size not aligned");
        assert_ne!(size, 0, "map_pages: size");

        let super_pages = allow_super && size >= SUPERPGSIZE;
        if super_pages {
            assert!(
                va.0.is_multiple_of(SUPERPGSIZE),
                "map_pages: va not aligned for superpage"
            );
            assert!(
                size.is_multiple_of(SUPERPGSIZE),
                "map_pages: size not aligned for superpage"
            );
            trace!("mapping {:#x} bytes of superpages at {:#x}", size, va.0);
        }

        let stride = if super_pages { SUPERPGSIZE } else { PGSIZE };
        let last = va.0 + size - stride;
        let mut cur = va.0;
        let mut pa = pa.0;

        loop {
            let pte = match self.walk_alloc(VA(cur), super_pages) {
                Ok(pte) => pte,
                Err(err) => {
                    // take out the leaves installed so far; their backing
                    // frames stay with the caller
                    if cur > va.0 {
                        self.unmap(va, (cur - va.0) / PGSIZE, false);
                    }
                    return Err(err);
                }
            };

            let pte = unsafe { &mut *pte.as_ptr() };
            assert!(!pte.is_v(), "map_pages: remap");
            *pte = PageTableEntry::make(PA(pa), perm | PteFlags::V);

            if cur == last {
                break;
            }

            cur += stride;
            pa += stride;
        }

        Ok(())
    }

    /// Remove `npages` base-page-sized units of mappings starting from `va`,
    /// which must be page-aligned. Optionally free the backing frames.
    ///
    /// The range may mix base pages and superpages. An unmapped stretch is
    /// tolerated up to the next superpage boundary, since superpage alignment
    /// legitimately leaves such gaps; a present non-leaf entry is corruption.
    pub fn unmap(&mut self, va: VA, npages: usize, free: bool) {
        assert!(va.0.is_multiple_of(PGSIZE), "unmap: not aligned");

        let mut cur = va.0;
        let last = va.0 + npages * PGSIZE;

        while cur < last {
            match self.walk(VA(cur)).expect("unmap: walk") {
                Walked::Absent => {
                    // skip the gap; a full stride when already on a boundary
                    cur = super_round_up(cur + 1);
                }
                Walked::Leaf(pte) => {
                    let pa = pte.as_pa();
                    *pte = PageTableEntry(0);
                    if free {
                        unsafe { kalloc::free_page(NonNull::new_unchecked(pa.0 as *mut Page)) };
                    }
                    cur += PGSIZE;
                }
                Walked::SuperLeaf(pte) => {
                    let pa = pte.as_pa();
                    *pte = PageTableEntry(0);
                    if free {
                        unsafe {
                            kalloc::free_super_page(NonNull::new_unchecked(pa.0 as *mut SuperPage))
                        };
                    }
                    cur += SUPERPGSIZE;
                }
            }
        }
    }

    /// Recursively free page-table nodes.
    /// All leaf mappings must already have been removed.
    fn free_walk(self) {
        let pagetable = unsafe { &mut *self.ptr };

        for pte in pagetable.0.iter_mut() {
            if pte.is_v() {
                if pte.is_leaf() {
                    panic!("free_walk: leaf");
                }

                // this PTE points to a lower-level node
                let child = PageTable::from_pa(pte.as_pa());
                child.free_walk();
                *pte = PageTableEntry(0);
            }
        }

        unsafe { kalloc::free_page(NonNull::new_unchecked(self.ptr.cast())) };
    }
}

/// Kernel page table: a direct map of the machine, built once at boot.
#[derive(Debug)]
pub struct Kvm(PageTable);

/// # Safety
/// The kernel page table is built before it is published through [`KVM`] and
/// only read afterwards; harts never mutate it through this handle.
unsafe impl Send for Kvm {}
unsafe impl Sync for Kvm {}

impl Kvm {
    pub fn new() -> Result<Self, VmError> {
        Ok(Self(PageTable::try_new()?))
    }

    pub fn map(&mut self, va: VA, pa: PA, size: usize, perm: PteFlags) {
        if self.0.map_pages(false, va, pa, size, perm).is_err() {
            panic!("kvm: map");
        }
    }

    /// Allocate and map a kernel stack for each process slot, leaving an
    /// unmapped guard page above each stack.
    pub fn map_stacks(&mut self) {
        for i in 0..NPROC {
            let base = kstack(i);
            for page in 0..NKSTACK_PAGES {
                let mem = kalloc::alloc_page().expect("kvm: kernel stack");
                self.map(
                    VA(base + page * PGSIZE),
                    PA(mem.as_ptr() as usize),
                    PGSIZE,
                    PteFlags::RW,
                );
            }
        }
    }

    #[cfg(target_arch = "riscv64")]
    unsafe fn make(&mut self) {
        // uart registers
        self.map(VA(UART0), PA(UART0), PGSIZE, PteFlags::RW);

        // virtio mmio disk interface
        self.map(VA(VIRTIO0), PA(VIRTIO0), PGSIZE, PteFlags::RW);

        // PLIC
        self.map(VA(PLIC), PA(PLIC), PLIC_SIZE, PteFlags::RW);

        #[cfg(feature = "net")]
        {
            // PCI-E ECAM (configuration space)
            self.map(VA(ECAM), PA(ECAM), ECAM_SIZE, PteFlags::RW);

            // the NIC's registers live here
            self.map(VA(E1000), PA(E1000), E1000_SIZE, PteFlags::RW);
        }

        // kernel text executable and read-only
        self.map(
            VA(KERNBASE),
            PA(KERNBASE),
            (etext as *const () as usize) - KERNBASE,
            PteFlags::RX,
        );

        // kernel data and the physical RAM
        self.map(
            VA(etext as *const () as usize),
            PA(etext as *const () as usize),
            PHYSTOP - (etext as *const () as usize),
            PteFlags::RW,
        );

        // trampoline for trap entry/exit mapped to the highest virtual address
        self.map(
            VA(TRAMPOLINE),
            PA(trampoline as *const () as usize),
            PGSIZE,
            PteFlags::RX,
        );

        self.map_stacks();
    }
}

/// User page table.
#[derive(Debug)]
pub struct Uvm(pub PageTable);

impl Uvm {
    /// Create an empty user page table.
    pub fn try_new() -> Result<Self, VmError> {
        Ok(Self(PageTable::try_new()?))
    }

    /// Load the initcode image into address 0, for the very first process.
    /// `src` must fit inside a single page.
    pub fn first(&mut self, src: &[u8]) {
        assert!(src.len() < PGSIZE, "first: more than a page");

        let mem = kalloc::alloc_page().expect("first: out of memory");
        self.map_pages(
            false,
            VA(0),
            PA(mem.as_ptr() as usize),
            PGSIZE,
            PteFlags::RWX | PteFlags::U,
        )
        .expect("first: map");

        unsafe { ptr::copy_nonoverlapping(src.as_ptr(), mem.as_ptr().cast::<u8>(), src.len()) };
    }

    /// Allocate PTEs and physical memory to grow the process from `old_size`
    /// to `new_size`, which need not be page-aligned. Growing by at least one
    /// superpage switches to superpage granularity over a naturally aligned
    /// region. Returns the page-rounded top of the grown region.
    ///
    /// On failure the partially grown region is released again.
    pub fn alloc(
        &mut self,
        old_size: usize,
        new_size: usize,
        xperm: PteFlags,
    ) -> Result<usize, VmError> {
        if new_size < old_size {
            return Ok(old_size);
        }

        let super_pages = new_size - old_size >= SUPERPGSIZE;
        let (stride, base, top) = if super_pages {
            let base = super_round_up(old_size);
            (SUPERPGSIZE, base, base + super_round_up(new_size - old_size))
        } else {
            let base = pg_round_up(old_size);
            (PGSIZE, base, base + pg_round_up(new_size - old_size))
        };

        if super_pages {
            trace!("growing {:#x} -> {:#x} with superpages", old_size, new_size);
        }

        let mut a = base;
        while a < top {
            let mem: Option<NonNull<u8>> = if super_pages {
                kalloc::alloc_super_page().map(|p| p.cast())
            } else {
                kalloc::alloc_page().map(|p| p.cast())
            };

            let Some(mem) = mem else {
                self.dealloc(a, base);
                return Err(VmError::OutOfMemory);
            };

            if let Err(err) = self.map_pages(
                super_pages,
                VA(a),
                PA(mem.as_ptr() as usize),
                stride,
                PteFlags::R | PteFlags::U | xperm,
            ) {
                unsafe {
                    if super_pages {
                        kalloc::free_super_page(mem.cast());
                    } else {
                        kalloc::free_page(mem.cast());
                    }
                }
                self.dealloc(a, base);
                return Err(err);
            }

            a += stride;
        }

        Ok(top)
    }

    /// Deallocate user pages to bring the process size from `old_size` to
    /// `new_size`. Neither needs to be page-aligned, nor does `new_size` need
    /// to be less than `old_size`. `old_size` can be larger than the actual
    /// process size. Returns the new process size.
    pub fn dealloc(&mut self, old_size: usize, new_size: usize) -> usize {
        if new_size >= old_size {
            return old_size;
        }

        if pg_round_up(new_size) < pg_round_up(old_size) {
            let npages = (pg_round_up(old_size) - pg_round_up(new_size)) / PGSIZE;
            self.unmap(VA(pg_round_up(new_size)), npages, true);
        }

        new_size
    }

    /// Free user memory pages, then free page-table nodes.
    pub fn free(mut self, size: usize) {
        if size > 0 {
            self.unmap(VA(0), pg_round_up(size) / PGSIZE, true);
        }
        self.0.free_walk();
    }

    /// Mark the leaf covering `va` invalid for user access.
    /// Used by exec for the user stack guard page.
    pub fn clear_user(&mut self, va: VA) {
        match self.walk(va).expect("clear_user") {
            Walked::Absent => panic!("clear_user: not mapped"),
            Walked::Leaf(pte) | Walked::SuperLeaf(pte) => pte.clear_u(),
        }
    }

    /// Copy this address space into `new`: the tree structure, the contents
    /// and the granularity of every mapping. The copy shares no frames with
    /// the original. On failure `new` is left without any mappings.
    pub fn copy(&mut self, new: &mut Uvm, size: usize) -> Result<(), VmError> {
        let mut va = 0;

        while va < size {
            let (pa, flags, stride) = match self.walk(VA(va)).expect("copy: walk") {
                // a gap left by superpage alignment; nothing to copy
                Walked::Absent => {
                    va = super_round_up(va + 1);
                    continue;
                }
                Walked::Leaf(pte) => (pte.as_pa(), pte.flags(), PGSIZE),
                Walked::SuperLeaf(pte) => (pte.as_pa(), pte.flags(), SUPERPGSIZE),
            };

            let mem: Option<NonNull<u8>> = if stride == SUPERPGSIZE {
                kalloc::alloc_super_page().map(|p| p.cast())
            } else {
                kalloc::alloc_page().map(|p| p.cast())
            };

            let Some(mem) = mem else {
                new.unmap(VA(0), va / PGSIZE, true);
                return Err(VmError::OutOfMemory);
            };

            unsafe { ptr::copy_nonoverlapping(pa.0 as *const u8, mem.as_ptr(), stride) };

            if let Err(err) = new.map_pages(
                stride == SUPERPGSIZE,
                VA(va),
                PA(mem.as_ptr() as usize),
                stride,
                flags,
            ) {
                unsafe {
                    if stride == SUPERPGSIZE {
                        kalloc::free_super_page(mem.cast());
                    } else {
                        kalloc::free_page(mem.cast());
                    }
                }
                new.unmap(VA(0), va / PGSIZE, true);
                return Err(err);
            }

            va += stride;
        }

        Ok(())
    }

    /// Copy from kernel to user.
    /// Copy bytes from `src` to virtual address `dstva` in this page table.
    pub fn copy_out(&mut self, dstva: VA, mut src: &[u8]) -> Result<(), VmError> {
        let mut dstva = dstva.0;

        while !src.is_empty() {
            let va0 = pg_round_down(dstva);

            // writes into read-only user memory are rejected even from here
            match self.walk(VA(va0))? {
                Walked::Absent => return Err(VmError::NotMapped),
                Walked::Leaf(pte) | Walked::SuperLeaf(pte) => {
                    if !pte.is_w() {
                        return Err(VmError::AccessDenied);
                    }
                }
            }

            let pa0 = self.walk_addr(VA(va0))?;
            let n = min(PGSIZE - (dstva - va0), src.len());

            unsafe {
                let dst_ptr = (pa0.0 + (dstva - va0)) as *mut u8;
                ptr::copy_nonoverlapping(src.as_ptr(), dst_ptr, n);
            }

            src = &src[n..];
            dstva = va0 + PGSIZE;
        }

        Ok(())
    }

    /// Copy from user to kernel.
    /// Fill `dst` with bytes from virtual address `srcva` in this page table.
    pub fn copy_in(&mut self, dst: &mut [u8], srcva: VA) -> Result<(), VmError> {
        let mut srcva = srcva.0;
        let mut copied = 0;

        while copied < dst.len() {
            let va0 = pg_round_down(srcva);
            let pa0 = self.walk_addr(VA(va0))?;

            let n = min(PGSIZE - (srcva - va0), dst.len() - copied);

            unsafe {
                let src_ptr = (pa0.0 + (srcva - va0)) as *const u8;
                ptr::copy_nonoverlapping(src_ptr, dst[copied..].as_mut_ptr(), n);
            }

            copied += n;
            srcva = va0 + PGSIZE;
        }

        Ok(())
    }

    /// Copy a null-terminated string from user to kernel.
    /// Copy bytes into `dst` from virtual address `srcva` until a NUL byte or
    /// the end of `dst`. Succeeds exactly when the NUL was found and copied.
    pub fn copy_in_str(&mut self, dst: &mut [u8], srcva: VA) -> Result<(), VmError> {
        let mut srcva = srcva.0;
        let mut copied = 0;

        while copied < dst.len() {
            let va0 = pg_round_down(srcva);
            let pa0 = self.walk_addr(VA(va0))?;

            let n = min(PGSIZE - (srcva - va0), dst.len() - copied);
            let chunk =
                unsafe { core::slice::from_raw_parts((pa0.0 + (srcva - va0)) as *const u8, n) };

            for &byte in chunk {
                dst[copied] = byte;
                copied += 1;
                if byte == 0 {
                    return Ok(());
                }
            }

            srcva = va0 + PGSIZE;
        }

        Err(VmError::UnterminatedString)
    }
}

impl Deref for Uvm {
    type Target = PageTable;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for Uvm {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

/// Initialize the one kernel page table.
#[cfg(target_arch = "riscv64")]
pub fn init() {
    KVM.initialize(|| {
        let mut kvm = Kvm::new()?;
        unsafe { kvm.make() };
        Ok::<_, VmError>(kvm)
    });

    log::debug!("kernel page table ready");
}

/// Switch the hart's page table register to the kernel's page table and
/// enable paging.
#[cfg(target_arch = "riscv64")]
pub fn init_hart() {
    unsafe {
        // wait for any previous writes to the page table memory to finish
        vma::sfence();

        satp::write(satp::make(KVM.get().expect("kvm to be init").0.as_pa().0));

        // flush stale entries from the TLB
        vma::sfence();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::MutexGuard;

    use super::*;
    use crate::kalloc::test_hooks;
    use crate::memlayout::{TRAMPOLINE, UART0, VIRTIO0};

    /// Serializes tests that watch the process-global allocator counters and
    /// clears the failure-injection budget on entry and exit.
    struct TestEnv {
        _guard: MutexGuard<'static, ()>,
    }

    impl TestEnv {
        fn new() -> Self {
            let guard = test_hooks::serialize();
            test_hooks::reset();
            Self { _guard: guard }
        }

        fn frames(&self) -> (usize, usize) {
            (kalloc::allocated_pages(), kalloc::allocated_super_pages())
        }
    }

    impl Drop for TestEnv {
        fn drop(&mut self) {
            test_hooks::reset();
        }
    }

    #[test]
    fn pte_codec_roundtrip() {
        let pa = PA(0x8765_4000);

        let pte = PageTableEntry::make(pa, PteFlags::RW | PteFlags::V);
        assert!(pte.is_v());
        assert!(pte.is_w());
        assert!(!pte.is_u());
        assert!(pte.is_leaf());
        assert_eq!(pte.as_pa(), pa);
        assert_eq!(pte.flags(), PteFlags::RW | PteFlags::V);

        let interior = PageTableEntry::make(pa, PteFlags::V);
        assert!(interior.is_v());
        assert!(!interior.is_leaf());

        let empty = PageTableEntry(0);
        assert!(!empty.is_v());
    }

    #[test]
    fn va_index_extraction() {
        let va = (5usize << 30) | (7 << 21) | (9 << 12) | 0x123;
        assert_eq!(px(2, va), 5);
        assert_eq!(px(1, va), 7);
        assert_eq!(px(0, va), 9);
    }

    #[test]
    fn map_then_translate_base_pages() {
        let env = TestEnv::new();
        let base = env.frames();

        let mut uvm = Uvm::try_new().unwrap();
        let frame = kalloc::alloc_page().unwrap();
        let pa = frame.as_ptr() as usize;
        uvm.map_pages(false, VA(0x4000), PA(pa), PGSIZE, PteFlags::R | PteFlags::U)
            .unwrap();

        assert_eq!(uvm.walk_addr(VA(0x4000)), Ok(PA(pa)));
        assert_eq!(uvm.walk_addr(VA(0x4abc)), Ok(PA(pa + 0xabc)));
        assert_eq!(uvm.walk_addr(VA(0x8000)), Err(VmError::NotMapped));
        assert_eq!(uvm.walk_addr(VA(MAXVA)), Err(VmError::InvalidAddress));

        uvm.unmap(VA(0x4000), 1, true);
        assert_eq!(uvm.walk_addr(VA(0x4000)), Err(VmError::NotMapped));

        uvm.free(0);
        assert_eq!(env.frames(), base);
    }

    #[test]
    fn superpage_walk_levels() {
        let env = TestEnv::new();
        let base = env.frames();

        let mut uvm = Uvm::try_new().unwrap();
        let frame = kalloc::alloc_super_page().unwrap();
        let pa = frame.as_ptr() as usize;
        uvm.map_pages(
            true,
            VA(0),
            PA(pa),
            SUPERPGSIZE,
            PteFlags::RW | PteFlags::U,
        )
        .unwrap();

        // every page-sized step inside the range hits the same level-1 leaf
        let first = match uvm.walk(VA(0x1234)).unwrap() {
            Walked::SuperLeaf(pte) => pte.as_pa(),
            other => panic!("expected a superpage leaf, got {other:?}"),
        };
        let second = match uvm.walk(VA(PGSIZE)).unwrap() {
            Walked::SuperLeaf(pte) => pte.as_pa(),
            other => panic!("expected a superpage leaf, got {other:?}"),
        };
        assert_eq!(first, PA(pa));
        assert_eq!(second, PA(pa));

        uvm.unmap(VA(0), SUPERPGSIZE / PGSIZE, true);
        uvm.free(0);
        assert_eq!(env.frames(), base);
    }

    #[test]
    fn grow_then_copy_roundtrip() {
        let env = TestEnv::new();
        let base = env.frames();

        let mut uvm = Uvm::try_new().unwrap();
        assert_eq!(uvm.alloc(0, PGSIZE, PteFlags::W), Ok(PGSIZE));

        uvm.copy_out(VA(0x100), b"hello").unwrap();
        let mut buf = [0u8; 5];
        uvm.copy_in(&mut buf, VA(0x100)).unwrap();
        assert_eq!(&buf, b"hello");

        uvm.free(PGSIZE);
        assert_eq!(env.frames(), base);
    }

    #[test]
    fn copy_out_rejects_read_only() {
        let env = TestEnv::new();
        let base = env.frames();

        let mut uvm = Uvm::try_new().unwrap();
        let frame = kalloc::alloc_page().unwrap();
        let pa = frame.as_ptr() as usize;
        uvm.map_pages(
            false,
            VA(0),
            PA(pa),
            PGSIZE,
            PteFlags::RX | PteFlags::U,
        )
        .unwrap();

        assert_eq!(uvm.copy_out(VA(0), b"x"), Err(VmError::AccessDenied));

        // the page is untouched
        let bytes = unsafe { core::slice::from_raw_parts(pa as *const u8, PGSIZE) };
        assert!(bytes.iter().all(|&b| b == 0));

        uvm.free(PGSIZE);
        assert_eq!(env.frames(), base);
    }

    #[test]
    fn copy_in_str_stops_at_nul() {
        let env = TestEnv::new();
        let base = env.frames();

        let mut uvm = Uvm::try_new().unwrap();
        uvm.alloc(0, PGSIZE, PteFlags::W).unwrap();
        uvm.copy_out(VA(0), b"abc\0zz").unwrap();

        let mut dst = [0xffu8; 16];
        uvm.copy_in_str(&mut dst, VA(0)).unwrap();
        assert_eq!(&dst[..4], b"abc\0");
        assert_eq!(dst[4], 0xff); // untouched past the terminator

        // no NUL within the destination
        let mut tiny = [0u8; 3];
        assert_eq!(
            uvm.copy_in_str(&mut tiny, VA(0)),
            Err(VmError::UnterminatedString)
        );

        uvm.free(PGSIZE);
        assert_eq!(env.frames(), base);
    }

    #[test]
    fn copy_in_str_crosses_page_boundary() {
        let _env = TestEnv::new();

        let mut uvm = Uvm::try_new().unwrap();
        uvm.alloc(0, 2 * PGSIZE, PteFlags::W).unwrap();
        uvm.copy_out(VA(PGSIZE - 2), b"ab\0").unwrap();

        let mut dst = [0u8; 8];
        uvm.copy_in_str(&mut dst, VA(PGSIZE - 2)).unwrap();
        assert_eq!(&dst[..3], b"ab\0");

        // reaching an unmapped page before the terminator fails
        uvm.copy_out(VA(2 * PGSIZE - 2), b"zz").unwrap();
        let mut dst2 = [0u8; 8];
        assert_eq!(
            uvm.copy_in_str(&mut dst2, VA(2 * PGSIZE - 2)),
            Err(VmError::NotMapped)
        );

        uvm.free(2 * PGSIZE);
    }

    #[test]
    fn superpage_grow_translate_shrink() {
        let env = TestEnv::new();
        let base = env.frames();

        let mut uvm = Uvm::try_new().unwrap();
        assert_eq!(
            uvm.alloc(0, 2 * SUPERPGSIZE, PteFlags::W),
            Ok(2 * SUPERPGSIZE)
        );
        assert_eq!(kalloc::allocated_super_pages(), base.1 + 2);

        assert!(matches!(
            uvm.walk(VA(0)).unwrap(),
            Walked::SuperLeaf(_)
        ));
        assert!(matches!(
            uvm.walk(VA(SUPERPGSIZE)).unwrap(),
            Walked::SuperLeaf(_)
        ));

        let pa = uvm.walk_addr(VA(SUPERPGSIZE + 0x1234)).unwrap();
        assert_ne!(pa.0, 0);
        assert_eq!(pa.0 & (SUPERPGSIZE - 1), 0x1234);

        // data round trip through the superpage region
        uvm.copy_out(VA(SUPERPGSIZE + 0x1234), b"super").unwrap();
        let mut buf = [0u8; 5];
        uvm.copy_in(&mut buf, VA(SUPERPGSIZE + 0x1234)).unwrap();
        assert_eq!(&buf, b"super");

        assert_eq!(uvm.dealloc(2 * SUPERPGSIZE, 0), 0);
        assert_eq!(kalloc::allocated_super_pages(), base.1);

        uvm.free(0);
        assert_eq!(env.frames(), base);
    }

    #[test]
    fn copy_address_space_mixed_granularity() {
        let env = TestEnv::new();
        let base = env.frames();

        // one superpage followed by one base page
        let mut src = Uvm::try_new().unwrap();
        assert_eq!(src.alloc(0, SUPERPGSIZE, PteFlags::W), Ok(SUPERPGSIZE));
        assert_eq!(
            src.alloc(SUPERPGSIZE, SUPERPGSIZE + PGSIZE, PteFlags::W),
            Ok(SUPERPGSIZE + PGSIZE)
        );
        let sz = SUPERPGSIZE + PGSIZE;

        src.copy_out(VA(0x100), b"in the superpage").unwrap();
        src.copy_out(VA(SUPERPGSIZE + 0x10), b"in the base page")
            .unwrap();

        let mut dst = Uvm::try_new().unwrap();
        let with_dst_root = env.frames();
        src.copy(&mut dst, sz).unwrap();

        // granularities preserved
        assert!(matches!(dst.walk(VA(0)).unwrap(), Walked::SuperLeaf(_)));
        assert!(matches!(
            dst.walk(VA(SUPERPGSIZE)).unwrap(),
            Walked::Leaf(_)
        ));

        // contents preserved
        let mut buf = [0u8; 16];
        dst.copy_in(&mut buf, VA(0x100)).unwrap();
        assert_eq!(&buf, b"in the superpage");
        dst.copy_in(&mut buf, VA(SUPERPGSIZE + 0x10)).unwrap();
        assert_eq!(&buf, b"in the base page");

        // the copy owns its frames: mutating it leaves the original alone
        dst.copy_out(VA(0x100), b"overwritten bits").unwrap();
        src.copy_in(&mut buf, VA(0x100)).unwrap();
        assert_eq!(&buf, b"in the superpage");

        // teardown frees exactly what the copy allocated, plus the root
        dst.free(sz);
        assert_eq!(env.frames(), (with_dst_root.0 - 1, with_dst_root.1));

        src.free(sz);
        assert_eq!(env.frames(), base);
    }

    #[test]
    fn grow_failure_rolls_back() {
        let env = TestEnv::new();

        let mut uvm = Uvm::try_new().unwrap();
        // establish the interior path so the failing growth only needs leaves
        uvm.alloc(0, PGSIZE, PteFlags::W).unwrap();
        let base = env.frames();

        test_hooks::fail_after(2);
        assert_eq!(
            uvm.alloc(PGSIZE, 4 * PGSIZE, PteFlags::W),
            Err(VmError::OutOfMemory)
        );
        test_hooks::reset();
        assert_eq!(env.frames(), base);

        // the space is still usable at its old size
        uvm.copy_out(VA(0), b"ok").unwrap();
        uvm.free(PGSIZE);
    }

    #[test]
    fn failed_grow_on_fresh_root_reclaimed_by_free() {
        let env = TestEnv::new();
        let base = env.frames();

        let mut uvm = Uvm::try_new().unwrap();

        // enough budget for the leaf and one interior node; the second
        // interior node allocation fails mid-walk
        test_hooks::fail_after(2);
        assert_eq!(uvm.alloc(0, 2 * PGSIZE, PteFlags::W), Err(VmError::OutOfMemory));
        test_hooks::reset();

        // no leaves survive the failure, but the root and the orphan interior
        // node are still allocated until teardown
        assert_eq!(env.frames(), (base.0 + 2, base.1));

        uvm.free(0);
        assert_eq!(env.frames(), base);
    }

    #[test]
    fn shrink_skips_hole_before_superpage() {
        let env = TestEnv::new();
        let base = env.frames();

        let mut uvm = Uvm::try_new().unwrap();
        assert_eq!(uvm.alloc(0, 2 * PGSIZE, PteFlags::W), Ok(2 * PGSIZE));
        let top = uvm
            .alloc(2 * PGSIZE, 2 * PGSIZE + SUPERPGSIZE, PteFlags::W)
            .unwrap();
        assert_eq!(top, 2 * SUPERPGSIZE);

        // the stretch between the base pages and the superpage is a hole
        assert_eq!(uvm.walk_addr(VA(4 * PGSIZE)), Err(VmError::NotMapped));

        // shrinking over the whole mixed range frees both granularities
        assert_eq!(uvm.dealloc(top, 0), 0);

        uvm.free(0);
        assert_eq!(env.frames(), base);
    }

    #[test]
    #[should_panic(expected = "remap")]
    fn remap_is_fatal() {
        let _env = TestEnv::new();

        let mut uvm = Uvm::try_new().unwrap();
        let f1 = kalloc::alloc_page().unwrap();
        uvm.map_pages(
            false,
            VA(0),
            PA(f1.as_ptr() as usize),
            PGSIZE,
            PteFlags::R | PteFlags::U,
        )
        .unwrap();

        let f2 = kalloc::alloc_page().unwrap();
        let _ = uvm.map_pages(
            false,
            VA(0),
            PA(f2.as_ptr() as usize),
            PGSIZE,
            PteFlags::R | PteFlags::U,
        );
    }

    #[test]
    #[should_panic(expected = "not aligned")]
    fn unaligned_map_is_fatal() {
        let _env = TestEnv::new();

        let mut uvm = Uvm::try_new().unwrap();
        let _ = uvm.map_pages(false, VA(0x10), PA(0), PGSIZE, PteFlags::R);
    }

    #[test]
    #[should_panic(expected = "superpage")]
    fn misaligned_superpage_map_is_fatal() {
        let _env = TestEnv::new();

        let mut uvm = Uvm::try_new().unwrap();
        let _ = uvm.map_pages(true, VA(PGSIZE), PA(0), SUPERPGSIZE, PteFlags::R);
    }

    #[test]
    #[should_panic(expected = "free_walk: leaf")]
    fn leaf_at_teardown_is_fatal() {
        let _env = TestEnv::new();

        let mut uvm = Uvm::try_new().unwrap();
        uvm.alloc(0, PGSIZE, PteFlags::W).unwrap();

        // tearing down without unmapping first violates the protocol
        uvm.0.free_walk();
    }

    #[test]
    fn first_process_image() {
        let env = TestEnv::new();
        let base = env.frames();

        let initcode = [0x17u8, 0x05, 0x00, 0x00, 0x13, 0x05, 0x45, 0x05];

        let mut uvm = Uvm::try_new().unwrap();
        uvm.first(&initcode);

        match uvm.walk(VA(0)).unwrap() {
            Walked::Leaf(pte) => {
                assert!(pte.is_u());
                assert!(pte.flags().contains(PteFlags::RWX));
            }
            other => panic!("expected a base page, got {other:?}"),
        }

        let mut buf = [0u8; 8];
        uvm.copy_in(&mut buf, VA(0)).unwrap();
        assert_eq!(buf, initcode);

        uvm.free(PGSIZE);
        assert_eq!(env.frames(), base);
    }

    #[test]
    fn clear_user_revokes_access() {
        let _env = TestEnv::new();

        let mut uvm = Uvm::try_new().unwrap();
        uvm.alloc(0, PGSIZE, PteFlags::W).unwrap();
        assert!(uvm.walk_addr(VA(0)).is_ok());

        uvm.clear_user(VA(0));
        assert_eq!(uvm.walk_addr(VA(0)), Err(VmError::AccessDenied));

        uvm.free(PGSIZE);
    }

    #[test]
    fn user_addresses_above_ceiling_are_rejected() {
        let _env = TestEnv::new();

        let mut uvm = Uvm::try_new().unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(uvm.copy_in(&mut buf, VA(MAXVA)), Err(VmError::InvalidAddress));
        assert_eq!(
            uvm.copy_out(VA(MAXVA + 0x100), b"x"),
            Err(VmError::InvalidAddress)
        );

        uvm.free(0);
    }

    #[test]
    fn kernel_map_layout() {
        let _env = TestEnv::new();

        let mut kvm = Kvm::new().unwrap();
        kvm.map(VA(UART0), PA(UART0), PGSIZE, PteFlags::RW);
        kvm.map(VA(VIRTIO0), PA(VIRTIO0), PGSIZE, PteFlags::RW);
        kvm.map(VA(TRAMPOLINE), PA(0x8020_0000), PGSIZE, PteFlags::RX);
        kvm.map_stacks();

        match kvm.0.walk(VA(UART0)).unwrap() {
            Walked::Leaf(pte) => {
                assert_eq!(pte.as_pa(), PA(UART0));
                assert!(pte.is_w());
                assert!(!pte.is_u());
            }
            other => panic!("uart mapping missing: {other:?}"),
        }

        match kvm.0.walk(VA(TRAMPOLINE)).unwrap() {
            Walked::Leaf(pte) => {
                assert!(pte.flags().contains(PteFlags::RX));
                assert!(!pte.is_w());
            }
            other => panic!("trampoline mapping missing: {other:?}"),
        }

        // every process slot has a stack, with an unmapped guard page on top
        for i in 0..NPROC {
            assert!(matches!(
                kvm.0.walk(VA(kstack(i))).unwrap(),
                Walked::Leaf(_)
            ));
        }
        let guard = kstack(0) + NKSTACK_PAGES * PGSIZE;
        assert!(matches!(kvm.0.walk(VA(guard)).unwrap(), Walked::Absent));
    }

    #[test]
    fn kernel_root_initializes_once() {
        let _env = TestEnv::new();

        KVM.initialize(Kvm::new);
        let first = KVM.get().expect("initialized").0.as_pa();

        // a second initialization attempt is a no-op
        KVM.initialize(Kvm::new);
        assert_eq!(KVM.get().unwrap().0.as_pa(), first);
    }
}
