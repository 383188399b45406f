//! 睡眠锁模块
//! 提供基于进程休眠/唤醒机制的同步原语，适用于可能长时间持有的锁。
//!
//! 当锁被占用时，尝试获取锁的进程会进入休眠状态，避免忙等待。
//! 只能在进程上下文中使用，中断处理程序里不能获取睡眠锁。

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut, Drop};

use crate::process::{Wakeup, CPU_MANAGER, PROC_MANAGER};
use crate::spinlock::SpinLock;

/// 受内部自旋锁保护的占用状态
struct Holder {
    locked: bool,
    /// 持有者的 pid，未被占用时为 0
    pid: usize,
}

pub struct SleepLock<T: ?Sized> {
    lock: SpinLock<Holder>,
    name: &'static str,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Sync for SleepLock<T> {}

impl<T> SleepLock<T> {
    pub const fn new(data: T, name: &'static str) -> Self {
        Self {
            lock: SpinLock::new(Holder { locked: false, pid: 0 }, "sleeplock"),
            name,
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> SleepLock<T> {
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// 等待者睡眠的通道
    fn channel(&self) -> usize {
        self.lock.addr()
    }

    pub fn lock(&self) -> SleepLockGuard<'_, T> {
        self.lock_with(&PROC_MANAGER)
    }

    /// # 功能说明
    /// 获取睡眠锁。锁被占用时当前进程在锁的通道上睡眠，
    /// 释放时由 `procs` 唤醒。
    ///
    /// # 返回值
    /// 持有期间可以访问数据的守卫，析构时释放锁。
    ///
    /// # 可能的错误
    /// 当前 hart 上没有运行的进程时 panic。
    pub fn lock_with<'a>(&'a self, procs: &'a dyn Wakeup) -> SleepLockGuard<'a, T> {
        let p = CPU_MANAGER.my_proc();
        let mut guard = self.lock.lock();

        while guard.locked {
            p.sleep(self.channel(), guard);
            guard = self.lock.lock();
        }

        guard.locked = true;
        guard.pid = p.pid();
        drop(guard);

        SleepLockGuard {
            lock: self,
            procs,
            data: unsafe { &mut *self.data.get() },
        }
    }

    /// 当前进程是否持有这把锁
    pub fn holding(&self) -> bool {
        let pid = match CPU_MANAGER.try_my_proc() {
            Some(p) => p.pid(),
            None => return false,
        };
        let guard = self.lock.lock();
        guard.locked && guard.pid == pid
    }

    fn unlock(&self, procs: &dyn Wakeup) {
        let mut guard = self.lock.lock();
        guard.locked = false;
        guard.pid = 0;
        procs.wakeup(self.channel());
        drop(guard);
    }
}

pub struct SleepLockGuard<'a, T: ?Sized> {
    lock: &'a SleepLock<T>,
    procs: &'a dyn Wakeup,
    data: &'a mut T,
}

impl<'a, T: ?Sized> Deref for SleepLockGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &*self.data
    }
}

impl<'a, T: ?Sized> DerefMut for SleepLockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut *self.data
    }
}

impl<'a, T: ?Sized> Drop for SleepLockGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.unlock(self.procs);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::ProcState;
    use crate::test_util::{on_first_run, proc_table};
    use std::boxed::Box;
    use std::sync::{Arc, Mutex};
    use std::vec::Vec;

    #[test]
    fn contender_sleeps_until_release() {
        let procs = proc_table(64);
        let lock: &'static SleepLock<Vec<&'static str>> =
            Box::leak(Box::new(SleepLock::new(Vec::new(), "test")));
        let holders = Arc::new(Mutex::new(Vec::new()));

        let a = procs.alloc_proc().unwrap();
        let b = procs.alloc_proc().unwrap();
        let h = holders.clone();
        on_first_run(a, move || {
            let mut guard = lock.lock_with(procs);
            guard.push("a");
            a.yielding();
            assert!(lock.holding());
            h.lock().unwrap().push(a.pid());
            drop(guard);
            assert!(!lock.holding());
        });
        let h = holders.clone();
        on_first_run(b, move || {
            let mut guard = lock.lock_with(procs);
            assert!(lock.holding());
            guard.push("b");
            h.lock().unwrap().push(b.pid());
        });
        a.excl.lock().state = ProcState::Runnable;
        b.excl.lock().state = ProcState::Runnable;

        unsafe { CPU_MANAGER.run_pass(procs) };
        // a 持有锁让出 CPU，b 在锁上睡眠
        assert_eq!(b.excl.lock().state, ProcState::Sleeping);

        unsafe { CPU_MANAGER.run_pass(procs) };
        assert_eq!(*holders.lock().unwrap(), [a.pid(), b.pid()]);
        let holder = lock.lock.lock();
        assert!(!holder.locked);
        assert_eq!(holder.pid, 0);
        drop(holder);
    }

    #[test]
    fn nobody_holds_outside_a_process() {
        let lock = SleepLock::new(0u8, "idle");
        assert!(!lock.holding());
        assert_eq!(lock.name(), "idle");
    }
}
