//! 进程管理相关的系统调用
//!
//! 调用号放在 `a7`，参数在 `a0..a5`，返回值写回 `a0`，失败时返回 -1。

use crate::process::pmu::{pmu_control, pmu_setup};
use crate::process::{Proc, ProcError, ProcManager};
use crate::timer;

pub const SYS_FORK: usize = 1;
pub const SYS_EXIT: usize = 2;
pub const SYS_WAIT: usize = 3;
pub const SYS_KILL: usize = 6;
pub const SYS_GETPID: usize = 11;
pub const SYS_SBRK: usize = 12;
pub const SYS_SLEEP: usize = 13;
pub const SYS_UPTIME: usize = 14;
pub const SYS_PMU_SETUP: usize = 30;
pub const SYS_PMU_CONTROL: usize = 31;

/// # 功能说明
/// 分发当前进程 `p` 发起的系统调用，把结果写回陷阱帧的 `a0`。
///
/// # 流程解释
/// 先从陷阱帧读出调用号与参数，再执行调用。
/// 执行期间进程可能睡眠或复制自己，所以不在调用过程中持有陷阱帧的引用。
pub fn syscall<const N: usize>(procs: &ProcManager<N>, p: &Proc) {
    let (num, a0, a1, a2) = {
        let tf = unsafe { p.data() }.tf();
        (tf.a7, tf.arg(0), tf.arg(1), tf.arg(2))
    };

    let result = match num {
        SYS_FORK => procs.fork(p.index()),
        SYS_EXIT => procs.exiting(p.index(), a0 as i32),
        SYS_WAIT => procs.waiting(p.index(), a0),
        SYS_KILL => procs.kill(a0).map(|()| 0),
        SYS_GETPID => Ok(p.pid()),
        SYS_SBRK => procs.growproc(p.index(), a0 as i32 as isize),
        SYS_SLEEP => timer::clock_sleep(p, a0 as i32 as usize).map(|()| 0),
        SYS_UPTIME => Ok(timer::uptime()),
        SYS_PMU_SETUP => pmu_setup(procs.pmu, p, a0, a1, a2),
        SYS_PMU_CONTROL => pmu_control(procs.pmu, p, a0, a1, a2),
        _ => Err(ProcError::UnknownSyscall(num)),
    };

    #[cfg(feature = "trace_syscall")]
    log::trace!("pid {}: syscall {} -> {:?}", p.pid(), num, result);

    let ret = match result {
        Ok(ret) => ret,
        Err(ProcError::UnknownSyscall(num)) => {
            log::warn!(
                "{} {}: unknown sys call {}",
                p.pid(),
                unsafe { p.data() }.name(),
                num
            );
            usize::MAX
        }
        Err(_err) => {
            #[cfg(feature = "kernel_warning")]
            log::warn!("pid {}: syscall {} failed: {}", p.pid(), num, _err);
            usize::MAX
        }
    };
    unsafe { p.data_mut() }.tf_mut().a0 = ret;
}
