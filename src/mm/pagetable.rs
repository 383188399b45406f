//! Sv39 三级页表：页表项编码、遍历、映射与拆除

use array_macro::array;

use core::convert::TryFrom;
use core::ptr::{self, NonNull};

use crate::consts::{PGSHIFT, PGSIZE};
use crate::register::satp;
use super::{Addr, PageAllocator, PhysAddr, VirtAddr, VmError};

/// 页表项中 PPN 之前的标志位数
const SV39FLAGLEN: usize = 10;
/// 页表项中标志位的掩码
const FLAG_MASK: usize = (1 << SV39FLAGLEN) - 1;

bitflags! {
    /// 页表项标志位，与跳板页汇编约定的编码逐位一致
    pub struct PteFlag: usize {
        /// 有效
        const V = 1 << 0;
        /// 可读
        const R = 1 << 1;
        /// 可写
        const W = 1 << 2;
        /// 可执行
        const X = 1 << 3;
        /// 用户态可访问
        const U = 1 << 4;
        /// 全局映射
        const G = 1 << 5;
        /// 已访问
        const A = 1 << 6;
        /// 已写
        const D = 1 << 7;
        /// 已换出。只为换页机制保留，当前没有逻辑会设置或检查它
        const S = 1 << 8;
    }
}

/// 页表项
#[repr(C)]
#[derive(Debug)]
pub struct PageTableEntry {
    data: usize,
}

impl PageTableEntry {
    #[inline]
    pub fn is_valid(&self) -> bool {
        (self.data & (PteFlag::V.bits())) > 0
    }

    /// 叶子项至少带有 R/W/X 之一，中间项三者皆无
    #[inline]
    pub fn is_leaf(&self) -> bool {
        let flag_bits = self.data & (PteFlag::R | PteFlag::W | PteFlag::X).bits();
        flag_bits != 0
    }

    #[inline]
    pub fn is_user(&self) -> bool {
        (self.data & (PteFlag::U.bits())) > 0
    }

    #[inline]
    fn as_page_table(&self) -> *mut PageTable {
        ((self.data >> SV39FLAGLEN) << PGSHIFT) as *mut PageTable
    }

    #[inline]
    pub fn as_phys_addr(&self) -> PhysAddr {
        unsafe { PhysAddr::from_raw((self.data >> SV39FLAGLEN) << PGSHIFT) }
    }

    #[inline]
    fn write_zero(&mut self) {
        self.data = 0;
    }

    /// 写入一个指向下一级页表的中间项
    #[inline]
    fn write(&mut self, pa: PhysAddr) {
        self.data = ((pa.as_usize() >> PGSHIFT) << SV39FLAGLEN) | (PteFlag::V.bits());
    }

    #[inline]
    fn write_perm(&mut self, pa: PhysAddr, perm: PteFlag) {
        self.data = ((pa.as_usize() >> PGSHIFT) << SV39FLAGLEN) | (perm | PteFlag::V).bits()
    }

    #[inline]
    pub fn read_perm(&self) -> PteFlag {
        PteFlag::from_bits_truncate(self.data & FLAG_MASK)
    }

    #[inline]
    pub fn raw(&self) -> usize {
        self.data
    }
}

/// 页表节点：512 个页表项，恰好占一页
#[repr(C, align(4096))]
pub struct PageTable {
    data: [PageTableEntry; 512],
}

impl PageTable {
    pub const fn empty() -> Self {
        Self {
            data: array![_ => PageTableEntry { data: 0 }; 512],
        }
    }

    /// 从分配器取一页清零的内存作为新节点
    pub fn alloc(kmem: &dyn PageAllocator) -> Result<NonNull<PageTable>, VmError> {
        let pa = kmem.alloc_zeroed_page().ok_or(VmError::OutOfMemory)?;
        NonNull::new(pa.as_usize() as *mut PageTable).ok_or(VmError::OutOfMemory)
    }

    #[inline]
    pub fn phys_addr(&self) -> PhysAddr {
        unsafe { PhysAddr::from_raw(self as *const PageTable as usize) }
    }

    /// 以此节点为根、带地址空间号 `asid` 的 satp 值
    #[inline]
    pub fn as_satp(&self, asid: usize) -> usize {
        satp::make(self as *const PageTable as usize, asid)
    }

    #[inline]
    pub fn entry(&self, index: usize) -> &PageTableEntry {
        &self.data[index]
    }

    /// 把 `[va, va+size)` 覆盖到的每一页线性映射到从 `pa` 开始的物理页。
    ///
    /// # 流程解释
    /// 1. 把起止地址按页对齐：`[round_down(va), round_down(va+size-1)]`；
    /// 2. 对每一页调用 [`walk_alloc`](Self::walk_alloc) 找到（必要时创建）末级页表项；
    /// 3. 页表项已有效时直接 panic，必须先解除映射，不允许静默覆盖；
    /// 4. 写入物理页号与权限位。
    ///
    /// # 返回值
    /// 中间页表节点分配失败时返回 `VmError::OutOfMemory`，已经建立的映射保留，
    /// 由调用者负责回滚。
    pub fn map_pages(
        &mut self,
        mut va: VirtAddr,
        size: usize,
        mut pa: PhysAddr,
        perm: PteFlag,
        kmem: &dyn PageAllocator,
    ) -> Result<(), VmError> {
        if size == 0 {
            panic!("map_pages: size");
        }
        let mut last = VirtAddr::try_from(va.as_usize() + size - 1)?;
        va.pg_round_down();
        last.pg_round_down();

        loop {
            let pte = self.walk_alloc(va, kmem)?;
            if pte.is_valid() {
                log::error!(
                    "map_pages: va={:#x} pa={:#x} old pte={:#x}",
                    va.as_usize(),
                    pa.as_usize(),
                    pte.data
                );
                panic!("remap");
            }
            pte.write_perm(pa, perm);
            if va == last {
                break;
            }
            va.add_page();
            pa.add_page();
        }

        Ok(())
    }

    /// 找到 `va` 对应的末级页表项，沿途缺失的中间节点会被分配并清零。
    pub fn walk_alloc(
        &mut self,
        va: VirtAddr,
        kmem: &dyn PageAllocator,
    ) -> Result<&mut PageTableEntry, VmError> {
        if !va.is_translatable() {
            return Err(VmError::VaTooLarge(va.as_usize()));
        }
        let mut pgt = self as *mut PageTable;
        for level in (1..=2).rev() {
            let pte = unsafe { &mut (*pgt).data[va.page_num(level)] };

            if pte.is_valid() {
                pgt = pte.as_page_table();
            } else {
                let node = Self::alloc(kmem)?;
                pte.write(unsafe { PhysAddr::from_raw(node.as_ptr() as usize) });
                pgt = node.as_ptr();
            }
        }
        unsafe { Ok(&mut (*pgt).data[va.page_num(0)]) }
    }

    /// 找到 `va` 对应的末级页表项，中间节点缺失时返回 `None`
    pub fn walk_mut(&mut self, va: VirtAddr) -> Option<&mut PageTableEntry> {
        if !va.is_translatable() {
            return None;
        }
        let mut pgt = self as *mut PageTable;
        for level in (1..=2).rev() {
            let pte = unsafe { &mut (*pgt).data[va.page_num(level)] };

            if pte.is_valid() {
                pgt = pte.as_page_table();
            } else {
                return None
            }
        }
        unsafe { Some(&mut (*pgt).data[va.page_num(0)]) }
    }

    pub fn walk(&self, va: VirtAddr) -> Option<&PageTableEntry> {
        if !va.is_translatable() {
            return None;
        }
        let mut pgt = self as *const PageTable;
        for level in (1..=2).rev() {
            let pte = unsafe { &(*pgt).data[va.page_num(level)] };

            if pte.is_valid() {
                pgt = pte.as_page_table();
            } else {
                return None
            }
        }
        unsafe { Some(&(*pgt).data[va.page_num(0)]) }
    }

    /// 查找用户可访问的 `va` 所在物理页
    pub fn walk_addr(&self, va: VirtAddr) -> Result<PhysAddr, VmError> {
        match self.walk(va) {
            Some(pte) if pte.is_valid() => {
                if pte.is_user() {
                    Ok(pte.as_phys_addr())
                } else {
                    Err(VmError::NotUserAccessible(va.as_usize()))
                }
            }
            _ => Err(VmError::NotMapped(va.as_usize())),
        }
    }

    /// `va` 所在页是否有有效的叶子映射
    pub fn is_mapped(&self, va: VirtAddr) -> bool {
        matches!(self.walk(va), Some(pte) if pte.is_valid())
    }

    /// 从按页对齐的 `va` 开始解除 `count` 页的映射，`freeing` 时归还物理页。
    ///
    /// 页表项缺失或不是叶子都说明页表已经不一致，直接 panic。
    pub fn unmap_pages(
        &mut self,
        va: usize,
        count: usize,
        kmem: &dyn PageAllocator,
        freeing: bool,
    ) {
        if va % PGSIZE != 0 {
            panic!("unmap_pages: va {:#x} not aligned", va);
        }

        for ca in (va..(va + PGSIZE * count)).step_by(PGSIZE) {
            let pte = match VirtAddr::try_from(ca).ok().and_then(|va| self.walk_mut(va)) {
                Some(pte) => pte,
                None => panic!("unmap_pages: walk {:#x}", ca),
            };
            if !pte.is_valid() {
                panic!("unmap_pages: not mapped {:#x}", ca);
            }
            if !pte.is_leaf() {
                panic!("unmap_pages: not a leaf {:#x}", ca);
            }
            if freeing {
                kmem.free_page(pte.as_phys_addr());
            }
            pte.write_zero();
        }
    }

    /// 递归释放此节点下的所有中间节点（不含此节点本身）。
    /// 所有叶子映射必须已经解除。
    pub fn free_walk(&mut self, kmem: &dyn PageAllocator) {
        for pte in self.data.iter_mut() {
            if !pte.is_valid() {
                continue;
            }
            if pte.is_leaf() {
                panic!("freewalk: leaf {:#x}", pte.data);
            }
            let child = pte.as_page_table();
            unsafe { (*child).free_walk(kmem) };
            kmem.free_page(pte.as_phys_addr());
            pte.write_zero();
        }
    }

    /// 递归解除此节点下的所有叶子映射。带 U 位的叶子归用户所有，
    /// 物理页一并释放；其余叶子（跳板页、陷阱帧）只解除映射。
    pub fn unmap_leaves(&mut self, kmem: &dyn PageAllocator) {
        for pte in self.data.iter_mut() {
            if !pte.is_valid() {
                continue;
            }
            if pte.is_leaf() {
                if pte.is_user() {
                    kmem.free_page(pte.as_phys_addr());
                }
                pte.write_zero();
            } else {
                unsafe { (*pte.as_page_table()).unmap_leaves(kmem) };
            }
        }
    }

    /// 清除 `index` 项对应的整棵子树：先释放子树中的中间节点，再释放子节点本身。
    pub fn free_subtree(&mut self, index: usize, kmem: &dyn PageAllocator) {
        let pte = &mut self.data[index];
        if !pte.is_valid() {
            return;
        }
        if pte.is_leaf() {
            panic!("free_subtree: leaf {:#x}", pte.data);
        }
        unsafe { (*pte.as_page_table()).free_walk(kmem) };
        kmem.free_page(pte.as_phys_addr());
        pte.write_zero();
    }

    /// 以缩进形式打印整棵页表
    pub fn vmprint(&self) {
        log::info!("page table {:#x}", self.phys_addr().as_usize());
        self.vmprint_level(0);
    }

    fn vmprint_level(&self, depth: usize) {
        const INDENT: [&str; 3] = ["..", ".. ..", ".. .. .."];
        for (i, pte) in self.data.iter().enumerate() {
            if !pte.is_valid() {
                continue;
            }
            log::info!(
                "{}{}: pte {:#x} pa {:#x} {:?}",
                INDENT[depth],
                i,
                pte.data,
                pte.as_phys_addr().as_usize(),
                pte.read_perm()
            );
            if !pte.is_leaf() && depth < 2 {
                unsafe { (*pte.as_page_table()).vmprint_level(depth + 1) };
            }
        }
    }
}

/// 把一个节点整页复制到新分配的节点中
pub(super) fn clone_node(src: &PageTable, kmem: &dyn PageAllocator) -> Result<NonNull<PageTable>, VmError> {
    let node = PageTable::alloc(kmem)?;
    unsafe { ptr::copy_nonoverlapping(src as *const PageTable, node.as_ptr(), 1) };
    Ok(node)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consts::MAXVA;
    use crate::test_util::arena;

    fn va(x: usize) -> VirtAddr {
        VirtAddr::try_from(x).unwrap()
    }

    #[test]
    fn walk_builds_three_levels() {
        let kmem = arena(8);
        let root = PageTable::alloc(kmem).unwrap().as_ptr();
        let root = unsafe { &mut *root };
        let before = kmem.free_pages();

        assert!(root.walk(va(0x1000)).is_none());
        let pte = root.walk_alloc(va(0x1000), kmem).unwrap();
        assert!(!pte.is_valid());
        // 新建了第 1 级和第 0 级两个节点
        assert_eq!(kmem.free_pages(), before - 2);
        // 同一个第 0 级节点里的邻居不再分配
        root.walk_alloc(va(0x2000), kmem).unwrap();
        assert_eq!(kmem.free_pages(), before - 2);

        root.free_walk(kmem);
        assert_eq!(kmem.free_pages(), before);
    }

    #[test]
    fn walk_rejects_addresses_past_maxva() {
        let kmem = arena(4);
        let root = unsafe { &mut *PageTable::alloc(kmem).unwrap().as_ptr() };
        let err = root.walk_alloc(va(usize::from(MAXVA)), kmem).unwrap_err();
        assert_eq!(err, VmError::VaTooLarge(usize::from(MAXVA)));
        assert!(root.walk(va(usize::from(MAXVA))).is_none());
    }

    #[test]
    fn map_pages_covers_partial_pages() {
        let kmem = arena(8);
        let root = unsafe { &mut *PageTable::alloc(kmem).unwrap().as_ptr() };
        let pa = unsafe { PhysAddr::from_raw(0x8000_0000) };
        // 0x1800..0x2800 跨两页
        root.map_pages(va(0x1800), 0x1000, pa, PteFlag::R | PteFlag::U, kmem).unwrap();
        let first = root.walk(va(0x1000)).unwrap();
        assert!(first.is_valid() && first.is_leaf() && first.is_user());
        assert_eq!(first.as_phys_addr().as_usize(), 0x8000_0000);
        assert_eq!(root.walk(va(0x2000)).unwrap().as_phys_addr().as_usize(), 0x8000_1000);
        assert!(!root.is_mapped(va(0x3000)));
        assert_eq!(first.read_perm(), PteFlag::V | PteFlag::R | PteFlag::U);
        // 中间项不带 R/W/X
        assert!(!root.entry(0).is_leaf());
    }

    #[test]
    #[should_panic(expected = "remap")]
    fn mapping_over_a_valid_entry_is_fatal() {
        let kmem = arena(8);
        let root = unsafe { &mut *PageTable::alloc(kmem).unwrap().as_ptr() };
        let pa = unsafe { PhysAddr::from_raw(0x8000_0000) };
        root.map_pages(va(0x4000), PGSIZE, pa, PteFlag::R, kmem).unwrap();
        let _ = root.map_pages(va(0x4000), PGSIZE, pa, PteFlag::R | PteFlag::W, kmem);
    }

    #[test]
    #[should_panic(expected = "unmap_pages: not mapped")]
    fn unmapping_a_missing_page_is_fatal() {
        let kmem = arena(8);
        let root = unsafe { &mut *PageTable::alloc(kmem).unwrap().as_ptr() };
        let pa = unsafe { PhysAddr::from_raw(0x8000_0000) };
        root.map_pages(va(0), PGSIZE, pa, PteFlag::R, kmem).unwrap();
        root.unmap_pages(0, 2, kmem, false);
    }

    #[test]
    fn unmap_can_release_backing_pages() {
        let kmem = arena(8);
        let root = unsafe { &mut *PageTable::alloc(kmem).unwrap().as_ptr() };
        let page = kmem.alloc_page().unwrap();
        root.map_pages(va(0x5000), PGSIZE, page, PteFlag::R | PteFlag::W, kmem).unwrap();
        let before = kmem.free_pages();
        root.unmap_pages(0x5000, 1, kmem, true);
        assert_eq!(kmem.free_pages(), before + 1);
        assert!(!root.is_mapped(va(0x5000)));
    }

    #[test]
    fn map_pages_reports_exhaustion() {
        // 根节点占一页，剩下的一页不够建两级中间节点
        let kmem = arena(2);
        let root = unsafe { &mut *PageTable::alloc(kmem).unwrap().as_ptr() };
        let pa = unsafe { PhysAddr::from_raw(0x8000_0000) };
        assert_eq!(
            root.map_pages(va(0), PGSIZE, pa, PteFlag::R, kmem),
            Err(VmError::OutOfMemory)
        );
    }

    #[test]
    fn swapped_bit_is_reserved_encoding() {
        assert_eq!(PteFlag::S.bits(), 1 << 8);
        let kmem = arena(4);
        let root = unsafe { &mut *PageTable::alloc(kmem).unwrap().as_ptr() };
        let pa = unsafe { PhysAddr::from_raw(0x8000_0000) };
        root.map_pages(va(0), PGSIZE, pa, PteFlag::R, kmem).unwrap();
        assert!(!root.walk(va(0)).unwrap().read_perm().contains(PteFlag::S));
        assert_eq!(root.walk(va(0)).unwrap().raw() >> 10 << 12, 0x8000_0000);
    }
}
