//! 单个进程的状态：调度状态、私有数据与 sleep/yield

use array_macro::array;

use alloc::sync::Arc;
use core::cell::UnsafeCell;
use core::mem;
use core::ptr;
use core::str;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::consts::NOFILE;
use crate::fs::{File, Inode};
use crate::mm::{PageAllocator, PhysAddr, ProcKernelPageTable, UserPageTable, VmError};
use crate::register::{satp, sepc};
use crate::spinlock::{SpinLock, SpinLockGuard};

use super::pmu::PmuState;
use super::{Context, CpuManager, TrapFrame, CPU_MANAGER};

pub mod syscall;

/// 进程的生命周期状态
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum ProcState {
    /// 空闲槽位
    Unused,
    /// 已分配资源但还不能被调度
    Allocated,
    Runnable,
    Running,
    /// 在某个通道上等待唤醒
    Sleeping,
    /// 已退出，等待父进程回收
    Zombie,
}

/// 受进程锁保护的字段
pub struct ProcExcl {
    pub state: ProcState,
    pub exit_status: i32,
    /// 睡眠时等待的通道，`0` 表示没有在睡眠
    pub channel: usize,
    pub pid: usize,
    pub pmu: PmuState,
}

impl ProcExcl {
    const fn new() -> Self {
        Self {
            state: ProcState::Unused,
            exit_status: 0,
            channel: 0,
            pid: 0,
            pmu: PmuState::new(),
        }
    }

    /// 清空所有字段，槽位回到 `Unused`
    pub fn cleanup(&mut self) {
        self.pid = 0;
        self.channel = 0;
        self.exit_status = 0;
        self.state = ProcState::Unused;
        self.pmu = PmuState::new();
    }
}

/// 进程的私有数据。
///
/// 只有进程自己（或在它不可能运行时的父进程、调度器）会访问，因此不加锁。
pub struct ProcData {
    kstack: usize,
    pub(super) sz: usize,
    pub(super) context: Context,
    pub(super) name: [u8; 16],
    pub(super) open_files: [Option<Arc<dyn File>>; NOFILE],
    pub(super) tf: *mut TrapFrame,
    pub(super) pagetable: Option<UserPageTable>,
    pub(super) kpagetable: Option<ProcKernelPageTable>,
    pub(super) cwd: Option<Arc<dyn Inode>>,
}

impl ProcData {
    const fn new() -> Self {
        Self {
            kstack: 0,
            sz: 0,
            context: Context::new(),
            name: [0; 16],
            open_files: array![_ => None; NOFILE],
            tf: ptr::null_mut(),
            pagetable: None,
            kpagetable: None,
            cwd: None,
        }
    }

    pub fn kstack(&self) -> usize {
        self.kstack
    }

    pub(super) fn set_kstack(&mut self, kstack: usize) {
        self.kstack = kstack;
    }

    /// 用户地址空间的大小（字节）
    pub fn size(&self) -> usize {
        self.sz
    }

    /// 清空上下文，下次被调度时从 `entry` 开始、使用自己的内核栈
    pub fn init_context(&mut self, entry: usize) {
        self.context.clear();
        self.context.set_ra(entry);
        self.context.set_sp(self.kstack);
    }

    pub(crate) fn context_ptr(&mut self) -> *mut Context {
        &mut self.context as *mut Context
    }

    pub fn tf(&self) -> &TrapFrame {
        match unsafe { self.tf.as_ref() } {
            Some(tf) => tf,
            None => panic!("proc: no trapframe"),
        }
    }

    pub fn tf_mut(&mut self) -> &mut TrapFrame {
        match unsafe { self.tf.as_mut() } {
            Some(tf) => tf,
            None => panic!("proc: no trapframe"),
        }
    }

    pub fn pagetable(&self) -> &UserPageTable {
        match self.pagetable.as_ref() {
            Some(pt) => pt,
            None => panic!("proc: no user page table"),
        }
    }

    pub fn pagetable_mut(&mut self) -> &mut UserPageTable {
        match self.pagetable.as_mut() {
            Some(pt) => pt,
            None => panic!("proc: no user page table"),
        }
    }

    /// 进程名，遇到第一个 0 字节截止
    pub fn name(&self) -> &str {
        let len = self.name.iter().position(|&c| c == 0).unwrap_or(self.name.len());
        str::from_utf8(&self.name[..len]).unwrap_or("???")
    }

    pub fn set_name(&mut self, name: &[u8]) {
        let len = name.len().min(self.name.len() - 1);
        self.name = [0; 16];
        self.name[..len].copy_from_slice(&name[..len]);
    }

    /// # 功能说明
    /// 返回用户态之前填写陷阱帧中内核侧的字段，
    /// 下一次从用户态陷入时 `uservec` 靠它们回到内核。
    ///
    /// # 参数
    /// - `kernel_trap`：陷入后要跳转的 `usertrap` 地址
    /// - `user_asid`：进程用户地址空间的地址空间号
    ///
    /// # 返回值
    /// 用户页表的 satp 值，交给 `userret` 切换。
    pub fn user_ret_prepare(&mut self, kernel_trap: usize, user_asid: usize) -> usize {
        let kstack = self.kstack;
        let tf = self.tf_mut();
        // 当前装入的就是进程私有的内核页表
        tf.kernel_satp = satp::read();
        tf.kernel_sp = kstack;
        tf.kernel_trap = kernel_trap;
        tf.kernel_hartid = CpuManager::cpu_id();
        sepc::write(tf.epc);

        self.pagetable().as_satp(user_asid)
    }

    /// 把内核数据复制到用户地址 `dst`
    pub fn copy_out(&mut self, dst: usize, src: &[u8]) -> Result<(), VmError> {
        self.pagetable_mut().copy_out(dst, src)
    }

    /// 从用户地址 `src` 复制到内核缓冲区
    pub fn copy_in(&self, dst: &mut [u8], src: usize) -> Result<(), VmError> {
        self.pagetable().copy_in(dst, src)
    }

    /// 释放打开的文件与当前目录的引用
    pub fn close_files(&mut self) {
        for f in self.open_files.iter_mut() {
            drop(f.take());
        }
        drop(self.cwd.take());
    }

    /// # 功能说明
    /// 释放进程的全部内存：陷阱帧页、用户页表（连同其中的用户页）、
    /// 进程私有内核页表与内核栈。可以在只分配了一部分资源时调用。
    ///
    /// # 流程解释
    /// 先归还陷阱帧页，再拆除用户页表：跳板页与陷阱帧只取消映射，
    /// `[0, sz)` 的用户页逐一释放，最后是页表自身的节点。
    /// 私有内核页表最后释放，此前进程一直可以在自己的内核栈上运行。
    pub fn free_address_space(&mut self, kmem: &dyn PageAllocator) {
        if !self.tf.is_null() {
            kmem.free_page(unsafe { PhysAddr::from_raw(self.tf as usize) });
            self.tf = ptr::null_mut();
        }
        if let Some(mut pt) = self.pagetable.take() {
            pt.dealloc(self.sz);
            drop(pt);
        }
        self.sz = 0;
        drop(self.kpagetable.take());
        self.kstack = 0;
        self.context.clear();
    }
}

/// 进程表中的一个槽位
pub struct Proc {
    index: usize,
    pub excl: SpinLock<ProcExcl>,
    pub(super) data: UnsafeCell<ProcData>,
    /// 被 kill 之后置位，由进程自己在回到用户态之前检查
    pub killed: AtomicBool,
}

// data 只由拥有该进程的执行流访问
unsafe impl Sync for Proc {}

impl Proc {
    pub const fn new(index: usize) -> Self {
        Self {
            index,
            excl: SpinLock::new(ProcExcl::new(), "process"),
            data: UnsafeCell::new(ProcData::new()),
            killed: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    /// 进程私有内核页表使用的地址空间号
    #[inline]
    pub fn kernel_asid(&self) -> usize {
        2 * self.index + 1
    }

    /// 进程用户页表使用的地址空间号
    #[inline]
    pub fn user_asid(&self) -> usize {
        2 * self.index + 2
    }

    /// 父进程在 `wait` 中睡眠的通道
    #[inline]
    pub fn channel(&self) -> usize {
        self as *const Proc as usize
    }

    pub fn pid(&self) -> usize {
        self.excl.lock().pid
    }

    #[inline]
    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn set_killed(&self) {
        self.killed.store(true, Ordering::Relaxed);
    }

    /// # 安全性
    /// 调用者必须是该进程自己，或者保证该进程此时不会运行。
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn data_mut(&self) -> &mut ProcData {
        &mut *self.data.get()
    }

    /// # 安全性
    /// 同 [`data_mut`](Self::data_mut)。
    pub unsafe fn data(&self) -> &ProcData {
        &*self.data.get()
    }

    /// # 功能说明
    /// 主动放弃 CPU：状态改为 `Runnable` 后切回调度器，
    /// 下次被调度时从这里返回。
    ///
    /// # 可能的错误
    /// 进程当前不是 `Running` 时 panic。
    pub fn yielding(&self) {
        let mut guard = self.excl.lock();
        assert_eq!(guard.state, ProcState::Running);
        guard.state = ProcState::Runnable;
        guard = unsafe { CPU_MANAGER.sched(guard, self.data_mut().context_ptr()) };
        drop(guard);
    }

    /// # 功能说明
    /// 原子地释放 `guard` 并在 `channel` 上睡眠，直到被 `wakeup`。
    ///
    /// # 流程解释
    /// 1. 先取得进程锁再释放 `guard`。`wakeup` 需要进程锁，
    ///    所以在两者之间不会丢失唤醒；
    /// 2. 若 `guard` 本身就是进程锁，直接接管它；
    /// 3. 记录通道并改为 `Sleeping`，切回调度器；
    /// 4. 被唤醒后清除通道，释放进程锁。
    ///
    /// # 返回值
    /// 返回时不持有任何锁，调用者需要时自行重新加锁。
    pub fn sleep<T: ?Sized>(&self, channel: usize, guard: SpinLockGuard<'_, T>) {
        let mut excl_guard = if guard.lock_addr() == self.excl.addr() {
            mem::forget(guard);
            unsafe { self.excl.guard_unchecked() }
        } else {
            let excl_guard = self.excl.lock();
            drop(guard);
            excl_guard
        };

        excl_guard.channel = channel;
        excl_guard.state = ProcState::Sleeping;

        excl_guard = unsafe { CPU_MANAGER.sched(excl_guard, self.data_mut().context_ptr()) };

        excl_guard.channel = 0;
        drop(excl_guard);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consts::{KSTACK_PAGES, TRAPFRAME};
    use crate::mm::{Addr, VirtAddr};
    use crate::test_util::{arena, kernel_vm};

    #[test]
    fn asids_are_unique_per_slot() {
        let a = Proc::new(0);
        let b = Proc::new(5);
        assert_eq!((a.kernel_asid(), a.user_asid()), (1, 2));
        assert_eq!((b.kernel_asid(), b.user_asid()), (11, 12));
    }

    #[test]
    fn names_are_truncated_and_nul_terminated() {
        let mut pd = ProcData::new();
        pd.set_name(b"a-very-long-process-name");
        assert_eq!(pd.name(), "a-very-long-pro");
        pd.set_name(b"init");
        assert_eq!(pd.name(), "init");
    }

    #[test]
    fn cleanup_returns_slot_to_unused() {
        let mut excl = ProcExcl::new();
        excl.state = ProcState::Zombie;
        excl.pid = 9;
        excl.exit_status = 3;
        excl.pmu.configure(0, 1, 0, 2);
        excl.cleanup();
        assert_eq!(excl.state, ProcState::Unused);
        assert_eq!((excl.pid, excl.exit_status, excl.channel), (0, 0, 0));
        assert_eq!(excl.pmu.physical_mask(!0), 0);
    }

    #[test]
    fn user_return_fills_kernel_side_of_trapframe() {
        let kmem = arena(32);
        let kvm = kernel_vm(kmem);
        let mut pd = ProcData::new();
        let tf = kmem.alloc_zeroed_page().unwrap();
        pd.tf = tf.as_usize() as *mut TrapFrame;
        pd.pagetable = Some(UserPageTable::new(tf, kmem).unwrap());
        let kpt = kvm.proc_kpagetable().unwrap();
        pd.set_kstack(kpt.kstack_top());
        let kernel_satp = kpt.as_satp(1);
        pd.kpagetable = Some(kpt);

        satp::write(kernel_satp);
        pd.tf_mut().epc = 0x40;
        let user_satp = pd.user_ret_prepare(0xdead_0000, 2);

        let tf = pd.tf();
        assert_eq!(tf.kernel_satp, kernel_satp);
        assert_eq!(tf.kernel_sp, pd.kstack());
        assert_eq!(tf.kernel_trap, 0xdead_0000);
        assert_eq!(tf.kernel_hartid, CpuManager::cpu_id());
        assert_eq!(sepc::read(), 0x40);
        assert_eq!(satp::asid(user_satp), 2);
        assert_eq!(satp::root(user_satp), pd.pagetable().phys_addr().as_usize());
        assert_eq!(
            pd.pagetable().walk_addr(VirtAddr::from(TRAPFRAME)).err(),
            Some(VmError::NotUserAccessible(usize::from(TRAPFRAME)))
        );

        let before = kmem.free_pages();
        pd.free_address_space(kmem);
        // 陷阱帧 + 用户页表三页 + 根、两级节点与内核栈
        assert_eq!(kmem.free_pages(), before + 1 + 3 + 3 + KSTACK_PAGES);
        assert!(pd.tf.is_null());
        assert_eq!(pd.size(), 0);
    }
}
