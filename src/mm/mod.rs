//! 内存管理模块

pub use addr::{Addr, PhysAddr, VirtAddr};
pub use kalloc::{FreeList, PageAllocator};
pub use kvm::{ProcKernelPageTable, Kvm, KMEM, KVM};
pub use pagetable::{PageTable, PageTableEntry, PteFlag};
pub use uvm::UserPageTable;

mod addr;
pub mod kalloc;
mod kvm;
mod pagetable;
mod uvm;

use crate::consts::PGSIZE;

/// 虚拟内存操作中可以恢复的失败
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum VmError {
    #[error("out of physical pages")]
    OutOfMemory,
    #[error("virtual address {0:#x} beyond MAXVA")]
    VaTooLarge(usize),
    #[error("virtual address {0:#x} not mapped")]
    NotMapped(usize),
    #[error("virtual address {0:#x} not accessible from user mode")]
    NotUserAccessible(usize),
}

/// 向上取整到页边界
#[inline]
pub fn pg_round_up(address: usize) -> usize {
    (address + (PGSIZE - 1)) & !(PGSIZE - 1)
}

/// 向下取整到页边界
#[inline]
pub fn pg_round_down(address: usize) -> usize {
    address & !(PGSIZE - 1)
}
