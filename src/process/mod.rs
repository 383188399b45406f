//! 进程控制模块

use array_macro::array;

use core::sync::atomic::Ordering;

use crate::arch;
use crate::consts::{NPROC, PGSIZE, ROOT_PID, TRAPFRAME};
use crate::mm::{Addr, Kvm, UserPageTable, VmError, KVM};
use crate::spinlock::SpinLock;
use crate::trap::user_trap_ret;

pub use cpu::{CpuManager, CPU_MANAGER};
pub use cpu::{pop_off, push_off};
pub use proc::{Proc, ProcData, ProcExcl, ProcState};
pub use context::Context;
pub use trapframe::TrapFrame;
pub use proc::syscall;

mod context;
mod cpu;
pub mod pmu;
mod proc;
mod trapframe;

use pmu::PmuFirmware;

/// 系统中唯一的进程表
pub static PROC_MANAGER: ProcManager<NPROC> = ProcManager::new(&KVM, &pmu::FIRMWARE, fork_ret);

/// 进程管理中可以返回给调用者的失败
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ProcError {
    #[error("no free process slot")]
    NoFreeSlot,
    #[error(transparent)]
    Vm(#[from] VmError),
    #[error(transparent)]
    Pmu(#[from] pmu::SbiError),
    #[error("no children to wait for")]
    NoChildren,
    #[error("process has been killed")]
    Killed,
    #[error("no process with pid {0}")]
    NoSuchProcess(usize),
    #[error("invalid argument")]
    InvalidArgument,
    #[error("unknown system call {0}")]
    UnknownSyscall(usize),
}

/// 可以按通道唤醒睡眠进程的对象，睡眠锁和时钟通过它唤醒等待者
pub trait Wakeup: Sync {
    fn wakeup(&self, channel: usize);
}

/// 进程表。
///
/// 父子关系单独放在 `parents` 里，由一把锁保护，
/// `wait` 与 `exit` 都先取这把锁，再取单个进程的锁。
pub struct ProcManager<const N: usize> {
    table: [Proc; N],

    /// 下标是子进程槽位，值是父进程槽位
    parents: SpinLock<[Option<usize>; N]>,

    /// 第一个用户进程的槽位，孤儿进程交给它
    init_proc: usize,

    /// 下一个分配的 pid
    pid: SpinLock<usize>,

    kvm: &'static Kvm,
    pmu: &'static dyn PmuFirmware,

    /// 新进程第一次被调度时的入口
    first_run: extern "C" fn(),
}

impl<const N: usize> ProcManager<N> {
    pub const fn new(
        kvm: &'static Kvm,
        pmu: &'static dyn PmuFirmware,
        first_run: extern "C" fn(),
    ) -> Self {
        Self {
            table: array![i => Proc::new(i); N],
            parents: SpinLock::new(array![_ => None; N], "proc parents"),
            init_proc: 0,
            pid: SpinLock::new(ROOT_PID, "pid"),
            kvm,
            pmu,
            first_run,
        }
    }

    pub fn proc(&self, index: usize) -> &Proc {
        &self.table[index]
    }

    pub fn kvm(&self) -> &'static Kvm {
        self.kvm
    }

    fn alloc_pid(&self) -> usize {
        let mut pid = self.pid.lock();
        let ret = *pid;
        *pid += 1;
        ret
    }

    /// # 功能说明
    /// 找一个空闲槽位并为它准备好运行所需的全部资源：
    /// 陷阱帧页、用户页表（已映射跳板页与陷阱帧）、
    /// 私有内核页表与内核栈，以及从 `first_run` 开始的上下文。
    ///
    /// # 返回值
    /// 成功时槽位处于 `Allocated`，已分配 pid，锁已释放。
    /// 没有空闲槽位返回 `NoFreeSlot`；物理页不足返回 `Vm(OutOfMemory)`，
    /// 此时已分配的页全部归还，槽位保持 `Unused`。
    pub fn alloc_proc(&self) -> Result<&Proc, ProcError> {
        let kmem = self.kvm.allocator();
        for p in self.table.iter() {
            let mut guard = p.excl.lock();
            if guard.state != ProcState::Unused {
                drop(guard);
                continue;
            }

            let pd = unsafe { p.data_mut() };
            if let Err(err) = self.alloc_resources(pd) {
                pd.free_address_space(kmem);
                return Err(err.into());
            }
            pd.init_context(self.first_run as usize);

            guard.pid = self.alloc_pid();
            guard.state = ProcState::Allocated;
            return Ok(p);
        }

        Err(ProcError::NoFreeSlot)
    }

    fn alloc_resources(&self, pd: &mut ProcData) -> Result<(), VmError> {
        let kmem = self.kvm.allocator();
        let tf = kmem.alloc_zeroed_page().ok_or(VmError::OutOfMemory)?;
        pd.tf = tf.as_usize() as *mut TrapFrame;
        pd.pagetable = Some(UserPageTable::new(tf, kmem)?);
        let kpt = self.kvm.proc_kpagetable()?;
        pd.set_kstack(kpt.kstack_top());
        pd.kpagetable = Some(kpt);
        Ok(())
    }

    /// 归还槽位的全部资源，槽位回到 `Unused`。调用者持有该进程的锁。
    fn free_proc(&self, p: &Proc, excl: &mut ProcExcl) {
        let pd = unsafe { p.data_mut() };
        pd.free_address_space(self.kvm.allocator());
        pd.name = [0; 16];
        p.killed.store(false, Ordering::Relaxed);
        excl.cleanup();
    }

    /// # 功能说明
    /// 建立第一个用户进程：把 `code` 装入地址 0 的一页，
    /// 用户栈指针指向该页顶端，然后标记为可运行。
    pub fn user_init(&self, code: &[u8]) -> Result<(), ProcError> {
        let p = self.alloc_proc()?;
        debug_assert_eq!(p.index(), self.init_proc);
        debug_assert_eq!(p.pid(), ROOT_PID);

        let pd = unsafe { p.data_mut() };
        if let Err(err) = pd.pagetable_mut().uvm_init(code) {
            let mut excl = p.excl.lock();
            self.free_proc(p, &mut excl);
            return Err(err.into());
        }
        pd.sz = PGSIZE;

        // 从地址 0 开始执行，栈在同一页的顶端
        let tf = pd.tf_mut();
        tf.epc = 0;
        tf.sp = PGSIZE;

        pd.set_name(b"initcode");
        p.excl.lock().state = ProcState::Runnable;
        Ok(())
    }

    /// 唤醒所有在 `channel` 上睡眠的进程。调用时不能持有任何进程锁。
    pub fn wakeup(&self, channel: usize) {
        for p in self.table.iter() {
            let mut guard = p.excl.lock();
            if guard.state == ProcState::Sleeping && guard.channel == channel {
                guard.state = ProcState::Runnable;
            }
            drop(guard);
        }
    }

    pub(crate) fn set_parent(&self, child_i: usize, parent_i: usize) {
        let mut guard = self.parents.lock();
        let ret = guard[child_i].replace(parent_i);
        debug_assert!(ret.is_none());
        drop(guard);
    }

    /// # 功能说明
    /// 当前进程退出，不再返回。
    ///
    /// # 流程解释
    /// 1. 关闭打开的文件；
    /// 2. 持有父子关系锁，把所有子进程交给 init，唤醒 init 与自己的父进程；
    /// 3. 取得自己的锁，停止并清零性能计数器，记录退出码，改为 `Zombie`；
    /// 4. 释放父子关系锁后切回调度器。父进程在 `wait` 中释放其余资源。
    ///
    /// # 可能的错误
    /// init 进程退出或进程没有父进程时 panic。
    pub fn exiting(&self, exit_pi: usize, exit_status: i32) -> ! {
        if exit_pi == self.init_proc {
            panic!("init process exiting");
        }

        let p = &self.table[exit_pi];
        unsafe { p.data_mut().close_files() };

        let mut parent_map = self.parents.lock();

        let mut have_child = false;
        for parent in parent_map.iter_mut() {
            if *parent == Some(exit_pi) {
                *parent = Some(self.init_proc);
                have_child = true;
            }
        }
        if have_child {
            self.wakeup(self.table[self.init_proc].channel());
        }
        let exit_parent = match parent_map[exit_pi] {
            Some(parent) => parent,
            None => panic!("exiting: slot {} has no parent", exit_pi),
        };
        self.wakeup(self.table[exit_parent].channel());

        let mut exit_excl = p.excl.lock();
        exit_excl.pmu.clear(self.pmu);
        exit_excl.exit_status = exit_status;
        exit_excl.state = ProcState::Zombie;
        drop(parent_map);

        unsafe {
            let ctx = p.data_mut().context_ptr();
            CPU_MANAGER.sched(exit_excl, ctx);
        }

        unreachable!("exiting {}", exit_pi);
    }

    /// # 功能说明
    /// 等待槽位 `pi` 的任一子进程退出并回收它。
    ///
    /// # 参数
    /// - `addr`：非 0 时把子进程的退出码（4 字节）写到该用户地址
    ///
    /// # 返回值
    /// 被回收子进程的 pid。没有子进程返回 `NoChildren`，
    /// 等待期间被 kill 返回 `Killed`，写退出码失败返回对应的 `Vm` 错误。
    pub fn waiting(&self, pi: usize, addr: usize) -> Result<usize, ProcError> {
        let p = &self.table[pi];
        let mut parent_map = self.parents.lock();

        loop {
            let mut have_child = false;
            for i in 0..N {
                if parent_map[i] != Some(pi) {
                    continue;
                }

                let mut child_excl = self.table[i].excl.lock();
                have_child = true;
                if child_excl.state != ProcState::Zombie {
                    continue;
                }

                let child_pid = child_excl.pid;
                if addr != 0 {
                    let status = child_excl.exit_status.to_ne_bytes();
                    unsafe { p.data_mut() }.copy_out(addr, &status)?;
                }
                parent_map[i] = None;
                self.free_proc(&self.table[i], &mut child_excl);
                return Ok(child_pid);
            }

            if !have_child {
                return Err(ProcError::NoChildren);
            }
            if p.is_killed() {
                return Err(ProcError::Killed);
            }

            // 有子进程但都还没退出
            p.sleep(p.channel(), parent_map);
            parent_map = self.parents.lock();
        }
    }

    /// 标记 `pid` 被杀死。睡眠中的进程改为可运行，
    /// 它会在下一次回到用户态之前退出。
    pub fn kill(&self, pid: usize) -> Result<(), ProcError> {
        for p in self.table.iter() {
            let mut guard = p.excl.lock();
            if guard.state != ProcState::Unused && guard.pid == pid {
                p.set_killed();
                if guard.state == ProcState::Sleeping {
                    guard.state = ProcState::Runnable;
                }
                return Ok(());
            }
        }

        Err(ProcError::NoSuchProcess(pid))
    }

    /// # 功能说明
    /// 复制槽位 `pi` 的进程：用户内存、陷阱帧（子进程 `a0` 为 0）、
    /// 打开的文件、当前目录与进程名，子进程随后可运行。
    ///
    /// # 返回值
    /// 子进程的 pid。进程表满或物理页不足时返回错误，子进程的资源全部释放。
    pub fn fork(&self, pi: usize) -> Result<usize, ProcError> {
        let pdata = unsafe { self.table[pi].data_mut() };
        let child = self.alloc_proc()?;
        let mut cexcl = child.excl.lock();
        let cdata = unsafe { child.data_mut() };

        let size = pdata.sz;
        if let Err(err) = pdata.pagetable().uvm_copy(cdata.pagetable_mut(), size) {
            self.free_proc(child, &mut cexcl);
            return Err(err.into());
        }
        cdata.sz = size;

        // 子进程从 fork 返回 0
        *cdata.tf_mut() = pdata.tf().clone();
        cdata.tf_mut().a0 = 0;

        cdata.open_files.clone_from(&pdata.open_files);
        cdata.cwd.clone_from(&pdata.cwd);
        cdata.name = pdata.name;

        let cpid = cexcl.pid;
        drop(cexcl);

        self.set_parent(child.index(), pi);

        child.excl.lock().state = ProcState::Runnable;
        Ok(cpid)
    }

    /// # 功能说明
    /// 把槽位 `pi` 的用户内存增加或减少 `n` 字节。
    /// 缩小后刷新该进程用户地址空间的 TLB。
    ///
    /// # 返回值
    /// 调整之前的大小。越过陷阱帧或缩到 0 以下返回错误，大小不变。
    pub fn growproc(&self, pi: usize, n: isize) -> Result<usize, ProcError> {
        let p = &self.table[pi];
        let pd = unsafe { p.data_mut() };
        let old_size = pd.sz;
        let new_size = if n >= 0 {
            old_size.checked_add(n as usize)
        } else {
            old_size.checked_sub(n.unsigned_abs())
        }
        .ok_or(ProcError::InvalidArgument)?;

        if new_size > usize::from(TRAPFRAME) {
            return Err(VmError::VaTooLarge(new_size).into());
        }

        if new_size > old_size {
            pd.sz = pd.pagetable_mut().uvm_alloc(old_size, new_size)?;
        } else if new_size < old_size {
            pd.sz = pd.pagetable_mut().uvm_dealloc(old_size, new_size);
            arch::sfence_vma_asid(p.user_asid());
        }
        Ok(old_size)
    }

    /// 把进程表打印到日志，用于调试。不加锁，避免卡住的机器上再次死锁。
    pub fn procdump(&self) {
        log::info!("procdump:");
        let parents = unsafe { self.parents.get_unchecked() };
        for p in self.table.iter() {
            let excl = unsafe { p.excl.get_unchecked() };
            if excl.state == ProcState::Unused {
                continue;
            }
            let pd = unsafe { p.data() };
            let ppid = parents[p.index()].map_or(0, |pi| unsafe { self.table[pi].excl.get_unchecked() }.pid);
            log::info!(
                "{} {:?} {} sz={:#x} parent={} killed={}",
                excl.pid,
                excl.state,
                pd.name(),
                pd.size(),
                ppid,
                p.is_killed()
            );
        }
    }
}

impl<const N: usize> Wakeup for ProcManager<N> {
    fn wakeup(&self, channel: usize) {
        ProcManager::wakeup(self, channel)
    }
}

/// 新进程第一次被调度时从这里开始
extern "C" fn fork_ret() {
    // 调度器切换进来时还持有进程锁
    unsafe {
        CPU_MANAGER.my_proc().excl.unlock();
        user_trap_ret()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::hosted;
    use crate::test_util::{on_first_run, proc_table};
    use std::boxed::Box;
    use std::sync::atomic::AtomicBool;
    use std::sync::{Arc, Mutex};
    use std::vec::Vec;

    fn make_runnable(p: &Proc) {
        p.excl.lock().state = ProcState::Runnable;
    }

    fn state(p: &Proc) -> ProcState {
        p.excl.lock().state
    }

    #[test]
    fn pids_increase_and_slots_run_out() {
        let procs = proc_table(64);
        let a = procs.alloc_proc().unwrap();
        let b = procs.alloc_proc().unwrap();
        assert_eq!((a.pid(), b.pid()), (1, 2));
        assert_eq!(state(a), ProcState::Allocated);

        procs.free_proc(a, &mut a.excl.lock());
        assert_eq!(state(a), ProcState::Unused);
        // 释放的槽位被复用，pid 不会复用
        let c = procs.alloc_proc().unwrap();
        assert_eq!((c.index(), c.pid()), (0, 3));

        procs.alloc_proc().unwrap();
        procs.alloc_proc().unwrap();
        assert_eq!(procs.alloc_proc().err(), Some(ProcError::NoFreeSlot));
    }

    #[test]
    fn first_process_runs_code_from_address_zero() {
        let procs = proc_table(32);
        let code = [0x13, 0x05, 0x40, 0x06];
        procs.user_init(&code).unwrap();

        let p = procs.proc(0);
        assert_eq!(p.pid(), ROOT_PID);
        assert_eq!(state(p), ProcState::Runnable);
        let pd = unsafe { p.data() };
        assert_eq!((pd.tf().epc, pd.tf().sp, pd.size()), (0, PGSIZE, PGSIZE));
        let mut loaded = [0u8; 4];
        pd.copy_in(&mut loaded, 0).unwrap();
        assert_eq!(loaded, code);
    }

    #[test]
    fn allocation_failure_returns_every_page() {
        let procs = proc_table(5 + 10);
        let kmem = procs.kvm().allocator();
        assert_eq!(kmem.free_pages(), 10);
        assert_eq!(
            procs.alloc_proc().err(),
            Some(ProcError::Vm(VmError::OutOfMemory))
        );
        assert_eq!(kmem.free_pages(), 10);
        assert_eq!(state(procs.proc(0)), ProcState::Unused);
    }

    #[test]
    fn round_robin_visits_runnable_slots_in_order() {
        let procs = proc_table(64);
        let order = Arc::new(Mutex::new(Vec::new()));
        for _ in 0..4 {
            procs.alloc_proc().unwrap();
        }
        for i in [1, 3] {
            let p = procs.proc(i);
            procs.free_proc(p, &mut p.excl.lock());
        }
        for i in [0, 2] {
            let p = procs.proc(i);
            let order = order.clone();
            on_first_run(p, move || {
                order.lock().unwrap().push(i);
                p.yielding();
                order.lock().unwrap().push(i + 10);
            });
            make_runnable(p);
        }

        assert!(unsafe { CPU_MANAGER.run_pass(procs) });
        assert_eq!(*order.lock().unwrap(), [0, 2]);
        assert_eq!(state(procs.proc(0)), ProcState::Runnable);

        assert!(unsafe { CPU_MANAGER.run_pass(procs) });
        assert_eq!(*order.lock().unwrap(), [0, 2, 10, 12]);
        assert!(!unsafe { CPU_MANAGER.run_pass(procs) });
        assert_eq!(state(procs.proc(1)), ProcState::Unused);
        // 回到调度器后换回全局内核页表
        assert_eq!(crate::register::satp::read(), procs.kvm().as_satp());
    }

    #[test]
    fn sleepers_wake_only_on_their_channel() {
        let procs = proc_table(32);
        let p = procs.alloc_proc().unwrap();
        let cond: &'static SpinLock<bool> = Box::leak(Box::new(SpinLock::new(false, "cond")));
        let chan = cond.addr();
        let woke = Arc::new(AtomicBool::new(false));
        let w = woke.clone();
        on_first_run(p, move || {
            let mut guard = cond.lock();
            while !*guard {
                p.sleep(chan, guard);
                guard = cond.lock();
            }
            drop(guard);
            w.store(true, Ordering::SeqCst);
        });
        make_runnable(p);

        unsafe { CPU_MANAGER.run_pass(procs) };
        assert_eq!(state(p), ProcState::Sleeping);
        assert_eq!(p.excl.lock().channel, chan);

        procs.wakeup(chan + 1);
        assert_eq!(state(p), ProcState::Sleeping);

        procs.wakeup(chan);
        assert_eq!(state(p), ProcState::Runnable);
        procs.wakeup(chan);
        assert_eq!(state(p), ProcState::Runnable);

        // 条件不满足，重新睡下
        unsafe { CPU_MANAGER.run_pass(procs) };
        assert_eq!(state(p), ProcState::Sleeping);
        assert!(!woke.load(Ordering::SeqCst));

        *cond.lock() = true;
        procs.wakeup(chan);
        unsafe { CPU_MANAGER.run_pass(procs) };
        assert!(woke.load(Ordering::SeqCst));
        assert_eq!(p.excl.lock().channel, 0);
    }

    #[test]
    fn kill_wakes_a_sleeper() {
        let procs = proc_table(32);
        let p = procs.alloc_proc().unwrap();
        let cond: &'static SpinLock<()> = Box::leak(Box::new(SpinLock::new((), "cond")));
        let saw_kill = Arc::new(AtomicBool::new(false));
        let s = saw_kill.clone();
        on_first_run(p, move || {
            p.sleep(cond.addr(), cond.lock());
            s.store(p.is_killed(), Ordering::SeqCst);
        });
        make_runnable(p);

        unsafe { CPU_MANAGER.run_pass(procs) };
        assert_eq!(state(p), ProcState::Sleeping);

        assert_eq!(procs.kill(99), Err(ProcError::NoSuchProcess(99)));
        procs.kill(p.pid()).unwrap();
        assert_eq!(state(p), ProcState::Runnable);

        unsafe { CPU_MANAGER.run_pass(procs) };
        assert!(saw_kill.load(Ordering::SeqCst));
    }

    #[test]
    fn exit_and_wait_reclaim_the_child() {
        let procs = proc_table(96);
        let kmem = procs.kvm().allocator();
        let parent = procs.alloc_proc().unwrap();
        let result = Arc::new(Mutex::new(None));
        let r = result.clone();
        on_first_run(parent, move || {
            procs.growproc(0, PGSIZE as isize).unwrap();
            let before = kmem.free_pages();
            let child_pid = procs.fork(0).unwrap();
            let reaped = procs.waiting(0, 0x10).unwrap();
            let mut status = [0u8; 4];
            unsafe { procs.proc(0).data() }.copy_in(&mut status, 0x10).unwrap();
            let after = kmem.free_pages();
            let no_more = procs.waiting(0, 0).err();
            *r.lock().unwrap() = Some((child_pid, reaped, i32::from_ne_bytes(status), before, after, no_more));
        });
        on_first_run(procs.proc(1), move || {
            // 子进程继承了父进程的一页用户内存
            assert_eq!(unsafe { procs.proc(1).data() }.size(), PGSIZE);
            procs.exiting(1, 42);
        });
        make_runnable(parent);
        hosted::hart().take_flushes();

        for _ in 0..8 {
            if result.lock().unwrap().is_some() {
                break;
            }
            unsafe { CPU_MANAGER.run_pass(procs) };
        }

        let (child_pid, reaped, status, before, after, no_more) = result.lock().unwrap().take().unwrap();
        assert_eq!(child_pid, reaped);
        assert_eq!(status, 42);
        assert_eq!(before, after);
        assert_eq!(no_more, Some(ProcError::NoChildren));
        assert_eq!(state(procs.proc(1)), ProcState::Unused);

        let flushes = hosted::hart().take_flushes();
        assert!(flushes.contains(&Some(procs.proc(1).kernel_asid())));
        assert!(flushes.contains(&Some(procs.proc(1).user_asid())));
    }

    #[test]
    fn fork_copies_registers_and_name() {
        let procs = proc_table(64);
        let parent = procs.alloc_proc().unwrap();
        let pd = unsafe { parent.data_mut() };
        pd.tf_mut().a0 = 7;
        pd.tf_mut().epc = 0x80;
        pd.set_name(b"shell");

        let cpid = procs.fork(0).unwrap();
        let child = procs.proc(1);
        assert_eq!(child.pid(), cpid);
        assert_eq!(state(child), ProcState::Runnable);
        let cd = unsafe { child.data() };
        assert_eq!((cd.tf().a0, cd.tf().epc), (0, 0x80));
        assert_eq!(cd.name(), "shell");
        assert_eq!(procs.parents.lock()[1], Some(0));
    }

    #[test]
    fn procdump_does_not_take_locks() {
        let procs = proc_table(64);
        procs.alloc_proc().unwrap();
        procs.fork(0).unwrap();
        // 即使进程锁被占用也能打印
        let guard = procs.proc(1).excl.lock();
        procs.procdump();
        drop(guard);
    }

    #[test]
    fn shrinking_flushes_the_user_asid() {
        let procs = proc_table(64);
        let p = procs.alloc_proc().unwrap();
        assert_eq!(procs.growproc(0, 2 * PGSIZE as isize), Ok(0));
        hosted::hart().take_flushes();
        assert_eq!(procs.growproc(0, -(PGSIZE as isize)), Ok(2 * PGSIZE));
        assert_eq!(hosted::hart().take_flushes(), [Some(p.user_asid())]);
        assert_eq!(unsafe { p.data() }.size(), PGSIZE);

        assert_eq!(procs.growproc(0, -(4 * PGSIZE as isize)), Err(ProcError::InvalidArgument));
        assert_eq!(
            procs.growproc(0, usize::from(TRAPFRAME) as isize),
            Err(ProcError::Vm(VmError::VaTooLarge(usize::from(TRAPFRAME) + PGSIZE)))
        );
        assert_eq!(unsafe { p.data() }.size(), PGSIZE);
    }
}
