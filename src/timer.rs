//! 时钟滴答
//!
//! hart 0 上的每次时钟中断让 [`TICKS`] 加一并唤醒在它上面睡眠的进程。

use core::num::Wrapping;

use crate::arch::{aclint_read_time, aclint_write_timecmp};
use crate::consts::INTERVAL;
use crate::process::{Proc, ProcError, Wakeup};
use crate::spinlock::SpinLock;

/// 启动以来的时钟滴答数
pub static TICKS: SpinLock<Wrapping<usize>> = SpinLock::new(Wrapping(0), "time");

#[inline]
fn ticks_channel() -> usize {
    TICKS.addr()
}

/// 在当前 hart 上安排下一次时钟中断，同时清除当前的中断
pub fn set_next_timeout() {
    aclint_write_timecmp(aclint_read_time() + INTERVAL);
}

/// 滴答加一，唤醒 `sleep` 系统调用中的进程
pub fn clock_intr(procs: &dyn Wakeup) {
    let mut ticks = TICKS.lock();
    *ticks += Wrapping(1);
    procs.wakeup(ticks_channel());
    drop(ticks);
}

pub fn uptime() -> usize {
    TICKS.lock().0
}

/// 让进程 `p` 睡眠至少 `n` 个滴答。期间被 kill 时提前返回 `Killed`。
pub fn clock_sleep(p: &Proc, n: usize) -> Result<(), ProcError> {
    let mut ticks = TICKS.lock();
    let start = *ticks;
    while *ticks - start < Wrapping(n) {
        if p.is_killed() {
            return Err(ProcError::Killed);
        }
        p.sleep(ticks_channel(), ticks);
        ticks = TICKS.lock();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::{ProcState, CPU_MANAGER};
    use crate::test_util::{on_first_run, proc_table};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn sleeper_needs_enough_ticks() {
        let procs = proc_table(32);
        let p = procs.alloc_proc().unwrap();
        let done = Arc::new(AtomicBool::new(false));
        let d = done.clone();
        on_first_run(p, move || {
            let start = uptime();
            clock_sleep(p, 2).unwrap();
            assert!(uptime() >= start + 2);
            d.store(true, Ordering::SeqCst);
        });
        p.excl.lock().state = ProcState::Runnable;

        unsafe { CPU_MANAGER.run_pass(procs) };
        assert_eq!(p.excl.lock().state, ProcState::Sleeping);

        for _ in 0..4 {
            if done.load(Ordering::SeqCst) {
                break;
            }
            clock_intr(procs);
            unsafe { CPU_MANAGER.run_pass(procs) };
        }
        assert!(done.load(Ordering::SeqCst));
    }

    #[test]
    fn killed_sleeper_gives_up() {
        let procs = proc_table(32);
        let p = procs.alloc_proc().unwrap();
        let result = Arc::new(std::sync::Mutex::new(None));
        let r = result.clone();
        on_first_run(p, move || {
            *r.lock().unwrap() = Some(clock_sleep(p, 1_000_000));
        });
        p.excl.lock().state = ProcState::Runnable;

        unsafe { CPU_MANAGER.run_pass(procs) };
        procs.kill(p.pid()).unwrap();
        unsafe { CPU_MANAGER.run_pass(procs) };
        assert_eq!(*result.lock().unwrap(), Some(Err(ProcError::Killed)));
    }

    #[test]
    fn timeout_moves_forward() {
        set_next_timeout();
        let first = crate::arch::hosted::hart().timecmp.load(Ordering::SeqCst);
        set_next_timeout();
        assert!(crate::arch::hosted::hart().timecmp.load(Ordering::SeqCst) > first);
    }
}
