//! 可抢占的 RISC-V 多任务内核核心
//!
//! 裸机目标上由 `rmain` 启动；其他目标上 `arch::hosted` 模拟出若干 hart，
//! 调度、锁、页表与陷阱处理代码在宿主机上原样运行并接受测试。

#![no_std]
#![warn(rust_2018_idioms)]

#[macro_use]
extern crate bitflags;

extern crate alloc;

#[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
extern crate std;

#[macro_use]
mod arch;

pub mod consts;
pub mod fs;
pub mod klog;
pub mod mm;
pub mod process;
pub mod register;
pub mod sleeplock;
pub mod spinlock;
pub mod timer;
pub mod trap;

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
mod rmain;

#[cfg(test)]
mod test_util;

#[cfg(all(target_arch = "riscv64", target_os = "none", not(test)))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo<'_>) -> ! {
    klog::PANICKED.store(true, core::sync::atomic::Ordering::Relaxed);
    log::error!("{}", info);
    loop {
        arch::wfi();
    }
}
