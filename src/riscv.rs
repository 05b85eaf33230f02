use bitflags::bitflags;
use static_assertions::const_assert_eq;

#[cfg(target_arch = "riscv64")]
pub mod registers {
    /// Supervisor Address Translation and Protection, satp
    /// Holds the address of the page table.
    pub mod satp {
        use core::arch::asm;

        // use riscv's sv39 page table scheme
        const SV39: usize = 8 << 60;

        pub const fn make(pagetable: usize) -> usize {
            SV39 | (pagetable >> 12)
        }

        #[inline]
        pub unsafe fn write(bits: usize) {
            unsafe {
                asm!("csrw satp, {}", in(reg) bits);
            }
        }
    }

    pub mod vma {
        use core::arch::asm;

        #[inline]
        // Synchronizes updates to the supervisor memory-management data structures.
        // When used with r1=0 and r2=0, the fence also invalidates all
        // address-translation cache entries, for all address spaces.
        pub unsafe fn sfence() {
            unsafe {
                asm!("sfence.vma zero, zero");
            }
        }
    }
}

// number of bits to offset within a page
pub const PGSHIFT: usize = 12;
// number of bytes per page
pub const PGSIZE: usize = 1 << PGSHIFT;

// a superpage is one level-1 entry's worth of address space: 512 base pages
pub const SUPERPGSHIFT: usize = PGSHIFT + 9;
pub const SUPERPGSIZE: usize = 1 << SUPERPGSHIFT;

const_assert_eq!(SUPERPGSIZE, 512 * PGSIZE);

pub const fn pg_round_up(size: usize) -> usize {
    (size + PGSIZE - 1) & !(PGSIZE - 1)
}

pub const fn pg_round_down(addr: usize) -> usize {
    addr & !(PGSIZE - 1)
}

pub const fn super_round_up(size: usize) -> usize {
    (size + SUPERPGSIZE - 1) & !(SUPERPGSIZE - 1)
}

pub const fn super_round_down(addr: usize) -> usize {
    addr & !(SUPERPGSIZE - 1)
}

bitflags! {
    /// Page table entry flags (the low 10 bits of an entry).
    ///
    /// An entry with `V` and any of `R`/`W`/`X` is a leaf; with `V` alone it
    /// points at the next-level page table.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PteFlags: usize {
        /// Valid
        const V = 1 << 0;
        /// Readable
        const R = 1 << 1;
        /// Writable
        const W = 1 << 2;
        /// Executable
        const X = 1 << 3;
        /// User accessible (if not set, supervisor mode only)
        const U = 1 << 4;
        /// Global mapping
        const G = 1 << 5;
        /// Accessed, set by hardware
        const A = 1 << 6;
        /// Dirty, set by hardware
        const D = 1 << 7;

        const RW = Self::R.bits() | Self::W.bits();
        const RX = Self::R.bits() | Self::X.bits();
        const RWX = Self::R.bits() | Self::W.bits() | Self::X.bits();
    }
}

pub const fn pa_to_pte(pa: usize) -> usize {
    (pa >> 12) << 10
}

pub const fn pte_to_pa(pte: usize) -> usize {
    (pte >> 10) << 12
}

// extract the three 9-bit page table indices from a virtual address
pub const PXMASK: usize = 0x1FF; // 9 bits

// returns the amount to shift-right to get to the correct page table index
pub const fn px_shift(level: usize) -> usize {
    // 12-bit page offset + 9-bit per level
    PGSHIFT + (9 * level)
}

// returns the page table index of the va for the corresponding level
pub const fn px(level: usize, va: usize) -> usize {
    (va >> px_shift(level)) & PXMASK
}

// one beyond the highest possible virtual address
// (3 x 9-bit pages) + 12-bit offset
//
// this is 1-bit less than the max allowed by Sv39 to avoid having to sign-extend virtual addresses
// that have the high bit set
pub const MAXVA: usize = 1 << (9 + 9 + 9 + 12 - 1);
