//! 执行环境相关的底层原语
//!
//! 裸机 RISC-V 上直接使用汇编访问 CSR、刷新 TLB 并切换上下文；
//! 其他目标上由 [`hosted`] 模拟出若干 hart，使得调度器、锁与页表
//! 代码可以原样在宿主机上运行和测试。

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
mod riscv;
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
pub use riscv::*;

#[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
pub mod hosted;
#[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
pub use hosted::{
    aclint_read_time, aclint_write_timecmp, hart_id, kernelvec, sfence_vma, sfence_vma_asid,
    swtch, trampoline_page, user_ret, uservec, wfi, KernelThread,
};

/// 读取一个监督模式 CSR
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
macro_rules! csr_read {
    ($csr:ident) => {{
        let ret: usize;
        unsafe { core::arch::asm!(concat!("csrr {}, ", stringify!($csr)), out(reg) ret) };
        ret
    }};
}

/// 写入一个监督模式 CSR
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
macro_rules! csr_write {
    ($csr:ident, $val:expr) => {{
        let val: usize = $val;
        unsafe { core::arch::asm!(concat!("csrw ", stringify!($csr), ", {}"), in(reg) val) };
    }};
}

#[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
macro_rules! csr_read {
    ($csr:ident) => {
        $crate::arch::hosted::hart()
            .$csr
            .load(core::sync::atomic::Ordering::SeqCst)
    };
}

#[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
macro_rules! csr_write {
    ($csr:ident, $val:expr) => {
        $crate::arch::hosted::hart()
            .$csr
            .store($val, core::sync::atomic::Ordering::SeqCst)
    };
}
