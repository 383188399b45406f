//! 处理器状态管理，用于控制正在执行的进程与中断开关

use array_macro::array;

use core::cell::UnsafeCell;
use core::ptr;

use crate::arch::{self, swtch};
use crate::consts::NCPU;
use crate::register::{satp, sstatus, tp};
use crate::spinlock::SpinLockGuard;
use super::{Context, Proc, ProcExcl, ProcManager, ProcState};

/// 所有 hart 的状态表
pub static CPU_MANAGER: CpuManager = CpuManager::new();

pub struct CpuManager {
    table: [UnsafeCell<Cpu>; NCPU],
}

// 每个 hart 只访问自己的表项
unsafe impl Sync for CpuManager {}

impl CpuManager {
    const fn new() -> Self {
        Self {
            table: array![_ => UnsafeCell::new(Cpu::new()); NCPU],
        }
    }

    /// 当前 hart 的编号。必须在关中断时调用，否则可能读到迁移之前的编号。
    #[inline]
    pub fn cpu_id() -> usize {
        tp::read()
    }

    /// 当前 hart 的状态记录。
    ///
    /// # 安全性
    /// 返回的引用只在关中断、且没有经过 `swtch` 时有效。
    pub unsafe fn my_cpu(&self) -> &Cpu {
        &*self.my_cpu_ptr()
    }

    /// # 安全性
    /// 同 [`my_cpu`](Self::my_cpu)，且调用者不能同时持有其他指向同一记录的引用。
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn my_cpu_mut(&self) -> &mut Cpu {
        &mut *self.my_cpu_ptr()
    }

    #[inline]
    fn my_cpu_ptr(&self) -> *mut Cpu {
        self.table[Self::cpu_id()].get()
    }

    /// 把编号为 `id` 的 hart 记录恢复为初始状态。
    ///
    /// # 安全性
    /// 该 hart 上不能有正在运行的内核线程。
    pub unsafe fn reset_cpu(&self, id: usize) {
        *self.table[id].get() = Cpu::new();
    }

    /// 当前 hart 上运行的进程，没有时 panic
    pub fn my_proc(&self) -> &Proc {
        match self.try_my_proc() {
            Some(p) => p,
            None => panic!("my_proc(): no process running"),
        }
    }

    /// 当前 hart 上运行的进程
    pub fn try_my_proc(&self) -> Option<&Proc> {
        push_off();
        let p = unsafe { (*self.my_cpu_ptr()).proc };
        pop_off();
        unsafe { p.as_ref() }
    }

    /// 按下标顺序扫描一遍进程表，依次运行每个可运行的进程。
    ///
    /// # 流程解释
    /// 对每个槽位：
    /// 1. 获取进程锁，状态不是 `Runnable` 则跳过；
    /// 2. 标记为 `Running`，装入进程私有内核页表（地址空间号 `2i+1`），
    ///    启动它的性能计数器，然后 `swtch` 进去；
    /// 3. 进程通过 [`sched`](Self::sched) 切回来时仍持有自己的锁。
    ///    停止计数器，如果进程已经退出就按它的两个地址空间号刷新 TLB，
    ///    最后换回全局内核页表。
    ///
    /// # 返回值
    /// 本轮是否运行过至少一个进程。
    ///
    /// # 安全性
    /// 只能在 hart 的调度器线程上调用，且调用时不持有任何锁。
    pub unsafe fn run_pass<const N: usize>(&self, procs: &ProcManager<N>) -> bool {
        let mut found = false;
        for p in procs.table.iter() {
            let mut guard = p.excl.lock();
            if guard.state != ProcState::Runnable {
                drop(guard);
                continue;
            }

            guard.state = ProcState::Running;
            found = true;

            let c = self.my_cpu_ptr();
            (*c).proc = p as *const Proc;
            let pd = &mut *p.data.get();
            match pd.kpagetable.as_ref() {
                Some(kpt) => satp::write(kpt.as_satp(p.kernel_asid())),
                None => panic!("scheduler: pid {} has no kernel page table", guard.pid),
            }
            guard.pmu.switch_in(procs.pmu, guard.pid);

            swtch(ptr::addr_of_mut!((*c).scheduler), ptr::addr_of_mut!(pd.context));

            // 回到调度器时仍持有进程锁、中断关闭
            guard.pmu.switch_out(procs.pmu, guard.pid);
            if guard.state == ProcState::Zombie {
                arch::sfence_vma_asid(p.user_asid());
                arch::sfence_vma_asid(p.kernel_asid());
            }
            satp::write(procs.kvm.as_satp());

            let c = self.my_cpu_ptr();
            if (*c).proc.is_null() {
                panic!("scheduler: context switch back with no process reference");
            }
            (*c).proc = ptr::null();
            drop(guard);
        }
        found
    }

    /// 每个 hart 的调度循环，永不返回。一整轮没有可运行的进程时等待中断。
    ///
    /// # 安全性
    /// 见 [`run_pass`](Self::run_pass)。
    pub unsafe fn scheduler<const N: usize>(&self, procs: &ProcManager<N>) -> ! {
        (*self.my_cpu_ptr()).proc = ptr::null();
        loop {
            // 确保设备能够中断
            sstatus::intr_on();

            if !self.run_pass(procs) {
                sstatus::intr_on();
                arch::wfi();
            }
        }
    }

    /// 从进程切回本 hart 的调度器。
    ///
    /// # 流程解释
    /// 调用前必须：持有且只持有该进程的锁、中断已关闭、状态已不是 `Running`，
    /// 任一条件不满足都会 panic。切回来时可能已换到另一个 hart，
    /// 所以 `intena` 写回到切回之后所在 hart 的记录中。
    ///
    /// # 返回值
    /// 原样返回进程锁的守卫，锁仍被持有，由调用者释放。
    ///
    /// # 安全性
    /// `ctx` 必须是该进程的上下文。
    pub unsafe fn sched<'a>(
        &self,
        guard: SpinLockGuard<'a, ProcExcl>,
        ctx: *mut Context,
    ) -> SpinLockGuard<'a, ProcExcl> {
        if !guard.holding() {
            panic!("sched: not holding proc's lock");
        }
        let c = self.my_cpu_ptr();
        if (*c).noff != 1 {
            panic!("sched: locks {}", (*c).noff);
        }
        if guard.state == ProcState::Running {
            panic!("sched: proc is running");
        }
        if sstatus::intr_get() {
            panic!("sched: interruptible");
        }

        let intena = (*c).intena;
        swtch(ctx, ptr::addr_of_mut!((*c).scheduler));
        (*self.my_cpu_ptr()).intena = intena;

        guard
    }
}

/// 一个 hart 的状态
pub struct Cpu {
    /// 正在运行的进程
    proc: *const Proc,

    /// 调度器线程的上下文，`swtch` 切回这里
    scheduler: Context,

    /// `push_off` 的嵌套深度
    noff: u8,

    /// 最外层 `push_off` 之前中断是否打开
    intena: bool,
}

impl Cpu {
    const fn new() -> Self {
        Self {
            proc: ptr::null(),
            scheduler: Context::new(),
            noff: 0,
            intena: false,
        }
    }

    pub fn noff(&self) -> u8 {
        self.noff
    }
}

/// 关中断并记录嵌套深度。与 `intr_off` 不同，需要成对的 `pop_off` 才会恢复中断。
pub fn push_off() {
    let old = sstatus::intr_get();
    sstatus::intr_off();
    let c = unsafe { CPU_MANAGER.my_cpu_mut() };
    if c.noff == 0 {
        c.intena = old;
    }
    c.noff += 1;
}

pub fn pop_off() {
    if sstatus::intr_get() {
        panic!("pop_off(): interruptable");
    }
    let c = unsafe { CPU_MANAGER.my_cpu_mut() };
    if c.noff == 0 {
        panic!("pop_off(): count not match");
    }
    c.noff -= 1;
    if c.noff == 0 && c.intena {
        sstatus::intr_on();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_pop_nest() {
        sstatus::intr_on();
        push_off();
        push_off();
        assert!(!sstatus::intr_get());
        pop_off();
        assert!(!sstatus::intr_get());
        pop_off();
        assert!(sstatus::intr_get());
    }

    #[test]
    #[should_panic(expected = "count not match")]
    fn unbalanced_pop_is_fatal() {
        sstatus::intr_off();
        pop_off();
    }

    #[test]
    fn no_process_on_a_fresh_hart() {
        assert!(CPU_MANAGER.try_my_proc().is_none());
    }

    #[test]
    #[should_panic(expected = "no process running")]
    fn my_proc_requires_a_process() {
        CPU_MANAGER.my_proc();
    }
}
