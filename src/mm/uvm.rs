//! 进程的用户地址空间
//!
//! [`UserPageTable`] 独占一棵页表树以及树中所有用户页。跳板页与陷阱帧
//! 虽然也映射在这棵树里，但物理页不归它所有：跳板页全局共享，
//! 陷阱帧由进程自己释放。

use core::cmp::min;
use core::convert::TryFrom;
use core::ops::{Deref, DerefMut};
use core::ptr::{self, NonNull};

use crate::arch;
use crate::consts::{PGSIZE, TRAMPOLINE, TRAPFRAME};
use super::{
    pg_round_up, Addr, PageAllocator, PageTable, PhysAddr, PteFlag, VirtAddr, VmError,
};

/// 用户程序从虚拟地址 0 开始
const USERTEXT: usize = 0;

pub struct UserPageTable {
    root: NonNull<PageTable>,
    kmem: &'static dyn PageAllocator,
}

unsafe impl Send for UserPageTable {}

impl UserPageTable {
    /// 创建一个只含跳板页与陷阱帧映射的用户页表。
    ///
    /// # 参数
    /// - `trapframe`: 进程私有陷阱帧页的物理地址，映射为 R|W，不带 U；
    /// - `kmem`: 页表节点与用户页的来源。
    ///
    /// # 返回值
    /// 物理页不足时返回 `VmError::OutOfMemory`，已分配的节点全部归还。
    pub fn new(trapframe: PhysAddr, kmem: &'static dyn PageAllocator) -> Result<Self, VmError> {
        let mut pagetable = Self {
            root: PageTable::alloc(kmem)?,
            kmem,
        };

        let trampoline = unsafe { PhysAddr::from_raw(arch::trampoline_page()) };
        pagetable.map_pages(
            VirtAddr::from(TRAMPOLINE),
            PGSIZE,
            trampoline,
            PteFlag::R | PteFlag::X,
            kmem,
        )?;
        if let Err(err) = pagetable.map_pages(
            VirtAddr::from(TRAPFRAME),
            PGSIZE,
            trapframe,
            PteFlag::R | PteFlag::W,
            kmem,
        ) {
            pagetable.unmap_pages(TRAMPOLINE.into(), 1, kmem, false);
            return Err(err);
        }

        Ok(pagetable)
    }

    pub fn allocator(&self) -> &'static dyn PageAllocator {
        self.kmem
    }

    /// 解除陷阱帧映射，不释放陷阱帧页。已经解除时什么也不做。
    pub fn unmap_trapframe(&mut self) {
        if self.is_mapped(VirtAddr::from(TRAPFRAME)) {
            let kmem = self.kmem;
            self.unmap_pages(TRAPFRAME.into(), 1, kmem, false);
        }
    }

    /// 拆除进程映射：跳板页与陷阱帧只解除映射，`[0, size)` 的用户页一并释放。
    /// 之后只剩中间节点，由 `Drop` 回收。
    pub fn dealloc(&mut self, size: usize) {
        let kmem = self.kmem;
        if self.is_mapped(VirtAddr::from(TRAMPOLINE)) {
            self.unmap_pages(TRAMPOLINE.into(), 1, kmem, false);
        }
        self.unmap_trapframe();
        if size > 0 {
            self.unmap_pages(0, pg_round_up(size) / PGSIZE, kmem, true);
        }
    }

    /// 把第一个用户程序装入地址 0 处的一页
    pub fn uvm_init(&mut self, code: &[u8]) -> Result<(), VmError> {
        if code.len() >= PGSIZE {
            panic!("uvm_init: initcode more than a page");
        }

        let kmem = self.kmem;
        let mem = kmem.alloc_zeroed_page().ok_or(VmError::OutOfMemory)?;
        if let Err(err) = self.map_pages(
            VirtAddr::try_from(USERTEXT)?,
            PGSIZE,
            mem,
            PteFlag::R | PteFlag::W | PteFlag::X | PteFlag::U,
            kmem,
        ) {
            kmem.free_page(mem);
            return Err(err);
        }
        unsafe { ptr::copy_nonoverlapping(code.as_ptr(), mem.as_usize() as *mut u8, code.len()) };
        Ok(())
    }

    /// 把用户内存从 `old_size` 扩展到 `new_size`，新页清零。
    /// 中途失败时回滚到 `old_size`。
    pub fn uvm_alloc(&mut self, old_size: usize, new_size: usize) -> Result<usize, VmError> {
        if new_size <= old_size {
            return Ok(old_size);
        }

        let kmem = self.kmem;
        let old_size = pg_round_up(old_size);
        for cur_size in (old_size..new_size).step_by(PGSIZE) {
            let mem = match kmem.alloc_zeroed_page() {
                Some(mem) => mem,
                None => {
                    self.uvm_dealloc(cur_size, old_size);
                    return Err(VmError::OutOfMemory);
                }
            };
            let mapped = VirtAddr::try_from(cur_size).and_then(|va| {
                self.map_pages(va, PGSIZE, mem, PteFlag::R | PteFlag::W | PteFlag::X | PteFlag::U, kmem)
            });
            if let Err(err) = mapped {
                #[cfg(feature = "kernel_warning")]
                log::warn!("uvm_alloc: {}", err);
                kmem.free_page(mem);
                self.uvm_dealloc(cur_size, old_size);
                return Err(err);
            }
        }

        Ok(new_size)
    }

    /// 把用户内存从 `old_size` 缩小到 `new_size`，返回新的大小。
    /// 调用者负责随后刷新对应地址空间的 TLB。
    pub fn uvm_dealloc(&mut self, old_size: usize, new_size: usize) -> usize {
        if new_size >= old_size {
            return old_size;
        }

        let old_size_aligned = pg_round_up(old_size);
        let new_size_aligned = pg_round_up(new_size);
        if new_size_aligned < old_size_aligned {
            let count = (old_size_aligned - new_size_aligned) / PGSIZE;
            let kmem = self.kmem;
            self.unmap_pages(new_size_aligned, count, kmem, true);
        }

        new_size
    }

    /// fork 用：把 `[0, size)` 的每一页复制到 `child` 的新物理页中，权限不变。
    ///
    /// # 流程解释
    /// 对每一页，从子进程的分配器取一页、复制内容、按原权限映射。
    /// 任何一步失败都会解除并释放已经复制的页，然后返回错误，
    /// 子页表回到调用前的状态（可能多出几个空的中间节点，随子页表一并回收）。
    pub fn uvm_copy(&self, child: &mut UserPageTable, size: usize) -> Result<(), VmError> {
        let kmem = child.kmem;
        for i in (0..size).step_by(PGSIZE) {
            let va = VirtAddr::try_from(i)?;
            let pte = match self.walk(va) {
                Some(pte) if pte.is_valid() => pte,
                _ => panic!("uvm_copy: page {:#x} not present", i),
            };
            let perm = pte.read_perm() & !PteFlag::V;
            let src = pte.as_phys_addr();

            let err = match kmem.alloc_page() {
                Some(mem) => {
                    unsafe {
                        ptr::copy_nonoverlapping(src.as_usize() as *const u8, mem.as_usize() as *mut u8, PGSIZE)
                    };
                    match child.map_pages(va, PGSIZE, mem, perm, kmem) {
                        Ok(()) => continue,
                        Err(err) => {
                            kmem.free_page(mem);
                            err
                        }
                    }
                }
                None => VmError::OutOfMemory,
            };
            child.unmap_pages(0, i / PGSIZE, kmem, true);
            return Err(err);
        }
        Ok(())
    }

    /// 把 `src` 复制到用户地址 `dst` 处，目标页必须带 U 位
    pub fn copy_out(&mut self, mut dst: usize, mut src: &[u8]) -> Result<(), VmError> {
        while !src.is_empty() {
            let mut va = VirtAddr::try_from(dst)?;
            va.pg_round_down();
            let pa = self.walk_addr(va)?;
            let off = dst - va.as_usize();
            let n = min(PGSIZE - off, src.len());
            unsafe { ptr::copy(src.as_ptr(), (pa.as_usize() + off) as *mut u8, n) };
            src = &src[n..];
            dst += n;
        }
        Ok(())
    }

    /// 从用户地址 `src` 复制 `dst.len()` 个字节，源页必须带 U 位
    pub fn copy_in(&self, dst: &mut [u8], mut src: usize) -> Result<(), VmError> {
        let mut done = 0;
        while done < dst.len() {
            let mut va = VirtAddr::try_from(src)?;
            va.pg_round_down();
            let pa = self.walk_addr(va)?;
            let off = src - va.as_usize();
            let n = min(PGSIZE - off, dst.len() - done);
            unsafe { ptr::copy((pa.as_usize() + off) as *const u8, dst[done..].as_mut_ptr(), n) };
            done += n;
            src += n;
        }
        Ok(())
    }
}

impl Deref for UserPageTable {
    type Target = PageTable;

    fn deref(&self) -> &PageTable {
        unsafe { self.root.as_ref() }
    }
}

impl DerefMut for UserPageTable {
    fn deref_mut(&mut self) -> &mut PageTable {
        unsafe { self.root.as_mut() }
    }
}

impl Drop for UserPageTable {
    /// 回收整棵树。仍然映射着的用户页一并释放，跳板页与陷阱帧只解除映射，
    /// 最后释放中间节点和根节点。
    fn drop(&mut self) {
        let kmem = self.kmem;
        self.unmap_leaves(kmem);
        self.free_walk(kmem);
        kmem.free_page(self.phys_addr());
    }
}
