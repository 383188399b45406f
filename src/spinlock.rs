//! 自旋锁模块
//! 自旋锁将数据包裹在自身内部以保护这些数据。

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut, Drop};
use core::sync::atomic::{fence, AtomicBool, AtomicIsize, Ordering};

use crate::process::{pop_off, push_off, CpuManager};

/// 表示一个自旋锁结构，用于在多核环境下保护共享数据。
///
/// 获取锁之前先关闭当前 hart 的中断（可嵌套，见 [`push_off`]），
/// 然后忙等待直到 `lock` 由 `false` 变为 `true`，并记录持有者的 hart 编号。
///
/// # 字段说明
/// - `lock`: 锁状态（`false`=未锁定，`true`=已锁定）；
/// - `name`: 锁的名称，用于调试和标识；
/// - `cpuid`: 持有锁的 hart 编号，只在 `lock` 为 `true` 时有意义（-1 表示无人持有）；
/// - `data`: 被保护的数据。
#[derive(Debug)]
pub struct SpinLock<T: ?Sized> {
    lock: AtomicBool,
    name: &'static str,
    cpuid: AtomicIsize,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// 创建一个新的自旋锁实例。
    ///
    /// # 参数
    /// - `data`: 需要被保护的数据；
    /// - `name`: 锁的标识名称，用于调试。
    pub const fn new(data: T, name: &'static str) -> Self {
        Self {
            lock: AtomicBool::new(false),
            name,
            cpuid: AtomicIsize::new(-1),
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> SpinLock<T> {
    /// 获取自旋锁并返回一个守卫对象。
    ///
    /// # 流程解释
    /// 1. 调用`push_off()`禁用中断；
    /// 2. 检查是否已持有锁，重复获取是致命错误；
    /// 3. 通过原子操作忙等待直到获取锁；
    /// 4. 设置内存屏障并记录当前 hart 编号。
    ///
    /// 守卫离开作用域时释放锁。
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        self.acquire();
        SpinLockGuard {
            lock: self,
            data: unsafe { &mut *self.data.get() },
        }
    }

    /// 当前 hart 是否持有此锁。
    ///
    /// 必须在关中断时调用，否则读到的 hart 编号可能已经过时。
    fn holding(&self) -> bool {
        self.lock.load(Ordering::Relaxed)
            && self.cpuid.load(Ordering::Relaxed) == CpuManager::cpu_id() as isize
    }

    fn acquire(&self) {
        push_off();
        if self.holding() {
            panic!("spinlock {} acquire", self.name);
        }
        while self
            .lock
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            core::hint::spin_loop();
        }
        fence(Ordering::SeqCst);
        self.cpuid.store(CpuManager::cpu_id() as isize, Ordering::Relaxed);
    }

    fn release(&self) {
        if !self.holding() {
            panic!("spinlock {} release", self.name);
        }
        self.cpuid.store(-1, Ordering::Relaxed);
        fence(Ordering::SeqCst);
        self.lock.store(false, Ordering::Release);
        pop_off();
    }

    /// 在没有守卫的情况下释放锁。
    ///
    /// # 安全性
    /// 只用于跨上下文切换交接锁的场景：锁由调度器获取，
    /// 由第一次运行的进程释放（见 `fork_ret`）。
    pub unsafe fn unlock(&self) {
        self.release();
    }

    /// 为一把已经由当前 hart 持有、但守卫已被遗忘的锁重新造一个守卫。
    ///
    /// # 安全性
    /// 调用者必须保证锁确实被当前 hart 持有，且没有其他存活的守卫。
    pub unsafe fn guard_unchecked(&self) -> SpinLockGuard<'_, T> {
        debug_assert!(self.holding());
        SpinLockGuard {
            lock: self,
            data: &mut *self.data.get(),
        }
    }

    /// 锁的地址，供 sleep 判断调用者持有的是否就是进程自身的锁
    pub fn addr(&self) -> usize {
        self as *const Self as *const u8 as usize
    }

    /// 不加锁地拿到内部数据的引用。
    ///
    /// # 安全性
    /// 调用者必须保证此时没有其他人在修改数据。
    pub unsafe fn get_unchecked(&self) -> &T {
        &*self.data.get()
    }
}

/// 自旋锁守卫，持有期间可以访问被保护的数据
pub struct SpinLockGuard<'a, T: ?Sized> {
    lock: &'a SpinLock<T>,
    data: &'a mut T,
}

impl<'a, T: ?Sized> SpinLockGuard<'a, T> {
    pub fn holding(&self) -> bool {
        self.lock.holding()
    }

    /// 守卫对应的锁的地址
    pub fn lock_addr(&self) -> usize {
        self.lock.addr()
    }
}

impl<'a, T: ?Sized> Deref for SpinLockGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &*self.data
    }
}

impl<'a, T: ?Sized> DerefMut for SpinLockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut *self.data
    }
}

impl<'a, T: ?Sized> Drop for SpinLockGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::CPU_MANAGER;
    use crate::register::sstatus;

    #[test]
    fn guard_gives_exclusive_access() {
        let lock = SpinLock::new(5usize, "smoke");
        {
            let mut guard = lock.lock();
            *guard += 1;
            assert!(guard.holding());
        }
        assert_eq!(*lock.lock(), 6);
    }

    #[test]
    fn nested_locks_keep_interrupts_off_until_outermost_release() {
        sstatus::intr_on();
        let outer = SpinLock::new((), "outer");
        let inner = SpinLock::new((), "inner");

        let g1 = outer.lock();
        assert!(!sstatus::intr_get());
        let g2 = inner.lock();
        assert_eq!(unsafe { CPU_MANAGER.my_cpu() }.noff(), 2);
        drop(g2);
        assert!(!sstatus::intr_get());
        drop(g1);
        assert!(sstatus::intr_get());
        assert_eq!(unsafe { CPU_MANAGER.my_cpu() }.noff(), 0);
    }

    #[test]
    fn interrupts_stay_off_if_they_were_off_before() {
        sstatus::intr_off();
        let lock = SpinLock::new((), "off");
        drop(lock.lock());
        assert!(!sstatus::intr_get());
    }

    #[test]
    #[should_panic(expected = "spinlock twice acquire")]
    fn double_acquire_is_fatal() {
        let lock = SpinLock::new((), "twice");
        let _g1 = lock.lock();
        let _g2 = lock.lock();
    }

    #[test]
    #[should_panic(expected = "spinlock loose release")]
    fn release_without_holding_is_fatal() {
        let lock = SpinLock::new((), "loose");
        unsafe { lock.unlock() };
    }

    #[test]
    fn harts_exclude_each_other() {
        use std::sync::Arc;
        use std::vec::Vec;

        let counter = Arc::new(SpinLock::new(0usize, "counter"));
        let workers: Vec<_> = (0..4)
            .map(|_| {
                let counter = counter.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        let mut guard = counter.lock();
                        let seen = *guard;
                        core::hint::spin_loop();
                        *guard = seen + 1;
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(*counter.lock(), 4000);
    }
}
