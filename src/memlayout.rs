// Physical memory layout

// qemu -machine virt is set up like this,
// based on qemu's hw/riscv/virt.c:
//
// 00001000 -- boot ROM, provided by qemu
// 0C000000 -- PLIC
// 10000000 -- uart0
// 10001000 -- virtio disk
// 30000000 -- PCI-E ECAM (with the "net" feature)
// 40000000 -- NIC registers (with the "net" feature)
// 80000000 -- boot ROM jumps here in machine mode
//             -kernel loads the kernel here
// unused RAM after 80000000.

// the kernel uses physical memory thus:
// 80000000 -- entry point, then kernel text and data
// end -- start of kernel frame allocation area
// PHYSTOP -- end of RAM used by the kernel

use crate::param::NKSTACK_PAGES;
use crate::riscv::{MAXVA, PGSIZE};

pub const UART0: usize = 0x1000_0000;

pub const VIRTIO0: usize = 0x1000_1000;

// Platform Level Interrupt Controller (PLIC)
pub const PLIC: usize = 0x0c00_0000;
pub const PLIC_SIZE: usize = 0x400_0000;

/// PCI-E configuration space (ECAM)
#[cfg(feature = "net")]
pub const ECAM: usize = 0x3000_0000;
#[cfg(feature = "net")]
pub const ECAM_SIZE: usize = 0x1000_0000;

/// The NIC's registers are mapped here by the PCI driver.
#[cfg(feature = "net")]
pub const E1000: usize = 0x4000_0000;
#[cfg(feature = "net")]
pub const E1000_SIZE: usize = 0x20000;

pub const KERNBASE: usize = 0x8000_0000;
pub const PHYSTOP: usize = KERNBASE + 128 * 1024 * 1024;

// trampoline page for trap entry/exit, at the highest virtual address
pub const TRAMPOLINE: usize = MAXVA - PGSIZE;

/// Virtual address of process `i`'s kernel stack.
///
/// The stacks sit below the trampoline, one slot per process. Each slot holds
/// `NKSTACK_PAGES` mapped pages topped by an unmapped guard page, so a stack
/// overflow faults instead of scribbling over the neighbour's stack.
pub const fn kstack(i: usize) -> usize {
    TRAMPOLINE - (i + 1) * (NKSTACK_PAGES + 1) * PGSIZE
}
