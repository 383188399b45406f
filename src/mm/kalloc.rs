//! 物理页分配接口与一个基于空闲链表的实现
//!
//! 内核其余部分只通过 [`PageAllocator`] 申请和归还整页物理内存，
//! 页表节点、陷阱帧、内核栈与用户页都来自这里。

use core::ptr;

use crate::consts::PGSIZE;
use crate::spinlock::SpinLock;

use super::{Addr, PhysAddr};

/// 整页物理内存分配器
pub trait PageAllocator: Sync {
    /// 分配一页，内容未定义。内存耗尽时返回 `None`。
    fn alloc_page(&self) -> Option<PhysAddr>;

    /// 归还一页。归还不属于自己的页是致命错误。
    fn free_page(&self, pa: PhysAddr);

    /// 当前空闲页数
    fn free_pages(&self) -> usize;

    /// 分配一页并清零
    fn alloc_zeroed_page(&self) -> Option<PhysAddr> {
        let pa = self.alloc_page()?;
        unsafe { ptr::write_bytes(pa.as_usize() as *mut u8, 0, PGSIZE) };
        Some(pa)
    }
}

/// 空闲页里存放的链表节点
struct Run {
    next: usize,
}

struct FreeListInner {
    head: usize,
    start: usize,
    end: usize,
    free: usize,
}

/// 管理 `[start, end)` 内物理页的空闲链表
pub struct FreeList {
    inner: SpinLock<FreeListInner>,
}

impl FreeList {
    pub const fn new(name: &'static str) -> Self {
        Self {
            inner: SpinLock::new(
                FreeListInner { head: 0, start: 0, end: 0, free: 0 },
                name,
            ),
        }
    }

    /// 把 `[start, end)` 中所有完整的页交给分配器。
    ///
    /// # 安全性
    /// 这段内存必须可写，且此后只归分配器所有。
    pub unsafe fn init(&self, start: usize, end: usize) {
        let start = (start + PGSIZE - 1) & !(PGSIZE - 1);
        let end = end & !(PGSIZE - 1);
        {
            let mut inner = self.inner.lock();
            inner.start = start;
            inner.end = end;
        }
        let mut pa = start;
        while pa + PGSIZE <= end {
            self.free_page(PhysAddr::from_raw(pa));
            pa += PGSIZE;
        }
        log::debug!("kalloc: {} pages in [{:#x}, {:#x})", self.free_pages(), start, end);
    }
}

impl PageAllocator for FreeList {
    fn alloc_page(&self) -> Option<PhysAddr> {
        let mut inner = self.inner.lock();
        if inner.head == 0 {
            return None;
        }
        let pa = inner.head;
        inner.head = unsafe { (*(pa as *const Run)).next };
        inner.free -= 1;
        drop(inner);
        // 填充垃圾数据，尽早暴露未初始化的使用
        unsafe { ptr::write_bytes(pa as *mut u8, 5, PGSIZE) };
        Some(unsafe { PhysAddr::from_raw(pa) })
    }

    fn free_page(&self, pa: PhysAddr) {
        let pa = pa.as_usize();
        let mut inner = self.inner.lock();
        if pa % PGSIZE != 0 || pa < inner.start || pa >= inner.end {
            panic!("kfree: {:#x} outside [{:#x}, {:#x})", pa, inner.start, inner.end);
        }
        unsafe {
            ptr::write_bytes(pa as *mut u8, 1, PGSIZE);
            (*(pa as *mut Run)).next = inner.head;
        }
        inner.head = pa;
        inner.free += 1;
    }

    fn free_pages(&self) -> usize {
        self.inner.lock().free
    }
}
