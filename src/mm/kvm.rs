//! 内核虚拟内存空间管理
//!
//! 全局内核页表 [`KVM`] 在启动时建立，之后只读。每个进程另有一份
//! [`ProcKernelPageTable`]：根节点是全局根节点的副本，共享其下所有子树，
//! 只在 `VKSTACK` 所在的顶级槽位挂一棵私有子树，用来映射进程自己的内核栈。

use core::cell::UnsafeCell;
use core::convert::TryFrom;
use core::ptr::NonNull;

use crate::arch;
use crate::consts::{
    ACLINT_S, FLASH_BFR, FRAME_BFR, FRAME_BFR_SIZE, KSTACK_PAGES, LEDS, PGSIZE, TRAMPOLINE, UART, VKSTACK,
};
use super::pagetable::clone_node;
use super::{Addr, FreeList, PageAllocator, PageTable, PhysAddr, PteFlag, VirtAddr, VmError};

/// 内核的物理页分配器，由启动代码用 RAM 中内核镜像之后的部分初始化
pub static KMEM: FreeList = FreeList::new("kmem");

/// 全局内核页表
pub static KVM: Kvm = Kvm::new(&KMEM);

pub struct Kvm {
    root: UnsafeCell<PageTable>,
    kmem: &'static dyn PageAllocator,
}

unsafe impl Sync for Kvm {}

impl Kvm {
    pub const fn new(kmem: &'static dyn PageAllocator) -> Self {
        Self {
            root: UnsafeCell::new(PageTable::empty()),
            kmem,
        }
    }

    pub fn allocator(&self) -> &'static dyn PageAllocator {
        self.kmem
    }

    fn root(&self) -> &PageTable {
        unsafe { &*self.root.get() }
    }

    /// 全局内核页表的 satp，地址空间号为 0
    pub fn as_satp(&self) -> usize {
        self.root().as_satp(0)
    }

    /// # 功能说明
    /// 建立内核地址空间：SoC 控制寄存器页、闪存缓冲、帧缓冲、
    /// 内核代码段（R|X）、内核数据段及其后直到 `PHYSTOP` 的内存（R|W），
    /// 以及位于最高处的跳板页。内核镜像只在裸机目标上映射。
    ///
    /// # 安全性
    /// 只能在启动阶段、其他 hart 使用内核页表之前调用一次。
    pub unsafe fn kvm_init(&self) {
        // LED、UART、ULPI、ACLINT 控制寄存器
        debug_assert_eq!(usize::from(LEDS) & !(PGSIZE - 1), usize::from(UART) & !(PGSIZE - 1));
        debug_assert_eq!(usize::from(LEDS) & !(PGSIZE - 1), usize::from(ACLINT_S) & !(PGSIZE - 1));
        self.kvm_map(VirtAddr::from(LEDS), PhysAddr::from(LEDS), PGSIZE, PteFlag::R | PteFlag::W);

        self.kvm_map(
            VirtAddr::from(FLASH_BFR),
            PhysAddr::from(FLASH_BFR),
            PGSIZE,
            PteFlag::R | PteFlag::W,
        );

        self.kvm_map(
            VirtAddr::from(FRAME_BFR),
            PhysAddr::from(FRAME_BFR),
            FRAME_BFR_SIZE,
            PteFlag::R | PteFlag::W,
        );

        #[cfg(all(target_arch = "riscv64", target_os = "none"))]
        self.map_kernel_image();

        self.kvm_map(
            VirtAddr::from(TRAMPOLINE),
            PhysAddr::from_raw(arch::trampoline_page()),
            PGSIZE,
            PteFlag::R | PteFlag::X,
        );

        if self.root().entry(VirtAddr::from(VKSTACK).page_num(2)).is_valid() {
            panic!("kvm_init: VKSTACK slot is used by the kernel mappings");
        }
    }

    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    unsafe fn map_kernel_image(&self) {
        use crate::consts::{KERNBASE, PHYSTOP};

        // etext 从 kernel.ld 中导出，按页对齐
        extern "C" {
            fn etext();
        }
        let etext = etext as usize;

        self.kvm_map(
            VirtAddr::from(KERNBASE),
            PhysAddr::from(KERNBASE),
            etext - usize::from(KERNBASE),
            PteFlag::R | PteFlag::X,
        );

        self.kvm_map(
            VirtAddr::from(KERNBASE) + (etext - usize::from(KERNBASE)),
            PhysAddr::from_raw(etext),
            usize::from(PHYSTOP) - etext,
            PteFlag::R | PteFlag::W,
        );
    }

    /// 在全局内核页表上建立映射，失败即 panic。
    ///
    /// # 安全性
    /// 只能在启动阶段调用。
    pub unsafe fn kvm_map(&self, va: VirtAddr, pa: PhysAddr, size: usize, perm: PteFlag) {
        #[cfg(feature = "verbose_init_info")]
        log::info!(
            "kvm_map: va={:#x}, pa={:#x}, size={:#x}",
            va.as_usize(),
            pa.as_usize(),
            size
        );

        if let Err(err) = (*self.root.get()).map_pages(va, size, pa, perm, self.kmem) {
            panic!("kvm_map: {}", err);
        }
    }

    /// 在当前 hart 上启用全局内核页表
    pub fn kvm_init_hart(&self) {
        crate::register::satp::write(self.as_satp());
        arch::sfence_vma();
    }

    /// 把内核虚拟地址翻译为物理地址，未映射时 panic
    pub fn kvm_pa(&self, va: VirtAddr) -> usize {
        let off = va.as_usize() % PGSIZE;
        match self.root().walk(va) {
            Some(pte) if pte.is_valid() => pte.as_phys_addr().as_usize() + off,
            Some(_) => panic!("kvm_pa: va={:?} mapped pa not valid", va),
            None => panic!("kvm_pa: va={:?} no mapped pa", va),
        }
    }

    /// # 功能说明
    /// 为一个进程建立私有内核页表：复制全局根节点，再在 `VKSTACK` 处
    /// 映射 `KSTACK_PAGES` 页新分配的内核栈（R|W）。
    ///
    /// # 返回值
    /// 物理页不足时返回 `VmError::OutOfMemory`，已分配的页全部归还。
    ///
    /// # 可能的错误
    /// 全局内核页表在 `VKSTACK` 的顶级槽位已有映射时 panic，
    /// 否则私有内核栈会写进所有进程共享的子树。
    pub fn proc_kpagetable(&self) -> Result<ProcKernelPageTable, VmError> {
        let kmem = self.kmem;
        let root = clone_node(self.root(), kmem)?;
        let mut kpt = ProcKernelPageTable { root, kmem };

        let slot = VirtAddr::from(VKSTACK).page_num(2);
        if kpt.table().entry(slot).is_valid() {
            panic!("proc_kpagetable: VKSTACK slot {} is shared", slot);
        }

        for i in 0..KSTACK_PAGES {
            let page = kmem.alloc_zeroed_page().ok_or(VmError::OutOfMemory)?;
            let va = VirtAddr::from(VKSTACK) + i * PGSIZE;
            if let Err(err) = kpt.table_mut().map_pages(va, PGSIZE, page, PteFlag::R | PteFlag::W, kmem) {
                kmem.free_page(page);
                return Err(err);
            }
        }

        Ok(kpt)
    }
}

/// 进程私有的内核页表，独占根节点、`VKSTACK` 子树与内核栈页
pub struct ProcKernelPageTable {
    root: NonNull<PageTable>,
    kmem: &'static dyn PageAllocator,
}

unsafe impl Send for ProcKernelPageTable {}

impl ProcKernelPageTable {
    pub fn table(&self) -> &PageTable {
        unsafe { self.root.as_ref() }
    }

    fn table_mut(&mut self) -> &mut PageTable {
        unsafe { self.root.as_mut() }
    }

    pub fn as_satp(&self, asid: usize) -> usize {
        self.table().as_satp(asid)
    }

    /// 内核栈栈顶的虚拟地址
    pub fn kstack_top(&self) -> usize {
        usize::from(VKSTACK) + KSTACK_PAGES * PGSIZE
    }

    /// 内核栈栈底在内核直接映射下的地址，宿主机上用它访问栈内存
    pub fn kstack_phys(&self) -> Option<PhysAddr> {
        self.table()
            .walk(VirtAddr::from(VKSTACK))
            .filter(|pte| pte.is_valid())
            .map(|pte| pte.as_phys_addr())
    }
}

impl Drop for ProcKernelPageTable {
    /// 依次释放内核栈页、`VKSTACK` 私有子树和根节点。
    /// 从全局页表复制来的其他顶级项只是别名，不释放。
    fn drop(&mut self) {
        let kmem = self.kmem;
        let table = self.table_mut();
        for i in 0..KSTACK_PAGES {
            let va = usize::from(VKSTACK) + i * PGSIZE;
            if let Ok(va_addr) = VirtAddr::try_from(va) {
                if table.is_mapped(va_addr) {
                    table.unmap_pages(va, 1, kmem, true);
                }
            }
        }
        table.free_subtree(VirtAddr::from(VKSTACK).page_num(2), kmem);
        kmem.free_page(table.phys_addr());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{arena, kernel_vm};

    #[test]
    fn global_table_covers_devices_and_trampoline() {
        let kvm = kernel_vm(arena(16));
        assert_eq!(kvm.kvm_pa(VirtAddr::from(ACLINT_S)), usize::from(ACLINT_S));
        assert_eq!(kvm.kvm_pa(VirtAddr::from(UART)), usize::from(UART));
        assert_eq!(
            kvm.kvm_pa(VirtAddr::from(FRAME_BFR) + (FRAME_BFR_SIZE - 1)),
            usize::from(FRAME_BFR) + FRAME_BFR_SIZE - 1
        );
        assert_eq!(kvm.kvm_pa(VirtAddr::from(TRAMPOLINE)), arch::trampoline_page());
    }

    #[test]
    fn proc_kernel_table_has_private_stack() {
        let kmem = arena(32);
        let kvm = kernel_vm(kmem);
        let before = kmem.free_pages();

        let a = kvm.proc_kpagetable().unwrap();
        let b = kvm.proc_kpagetable().unwrap();
        // 根、VKSTACK 下两级节点、内核栈
        assert_eq!(kmem.free_pages(), before - 2 * (3 + KSTACK_PAGES));

        assert_ne!(a.kstack_phys(), b.kstack_phys());
        let stack = a.table().walk(VirtAddr::from(VKSTACK)).unwrap();
        assert_eq!(stack.read_perm(), PteFlag::V | PteFlag::R | PteFlag::W);
        // 共享的全局映射照常可见
        let tramp = a.table().walk(VirtAddr::from(TRAMPOLINE)).unwrap();
        assert_eq!(tramp.as_phys_addr().as_usize(), arch::trampoline_page());
        // 全局页表里看不到进程的内核栈
        assert!(kvm.root().walk(VirtAddr::from(VKSTACK)).is_none());

        drop(a);
        drop(b);
        assert_eq!(kmem.free_pages(), before);
        // 共享子树原样保留
        assert_eq!(kvm.kvm_pa(VirtAddr::from(LEDS)), 0);
    }

    #[test]
    fn failed_stack_allocation_returns_every_page() {
        let kmem = arena(16);
        let kvm = kernel_vm(kmem);
        // 留下根与两级节点，再加两页栈
        let keep = 3 + 2;
        let mut hoard = std::vec::Vec::new();
        while kmem.free_pages() > keep {
            hoard.push(kmem.alloc_page().unwrap());
        }
        assert_eq!(kvm.proc_kpagetable().err(), Some(VmError::OutOfMemory));
        assert_eq!(kmem.free_pages(), keep);
        for page in hoard {
            kmem.free_page(page);
        }
    }

    #[test]
    fn satp_carries_the_asid() {
        let kmem = arena(16);
        let kvm = kernel_vm(kmem);
        let kpt = kvm.proc_kpagetable().unwrap();
        let satp = kpt.as_satp(7);
        assert_eq!(crate::register::satp::asid(satp), 7);
        assert_eq!(crate::register::satp::root(satp), kpt.table().phys_addr().as_usize());
        assert_eq!(crate::register::satp::asid(kvm.as_satp()), 0);
    }
}
