//! 内核线程的上下文

#[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
use alloc::sync::Arc;

#[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
use crate::arch::KernelThread;

/// `swtch` 保存与恢复的寄存器：返回地址、栈指针和 12 个被调用者保存寄存器。
/// 字段偏移与 `asm/swtch.S` 一致。
#[repr(C)]
pub struct Context {
    ra: usize,
    sp: usize,
    s: [usize; 12],

    /// 宿主机上承载这个上下文的线程，首次切换进来时创建
    #[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
    pub(crate) thread: Option<Arc<KernelThread>>,
}

impl Context {
    pub const fn new() -> Self {
        Self {
            ra: 0,
            sp: 0,
            s: [0; 12],
            #[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
            thread: None,
        }
    }

    /// 清空所有寄存器。宿主机上同时丢弃旧线程，下次切换进来时从 `ra` 重新开始。
    pub fn clear(&mut self) {
        self.ra = 0;
        self.sp = 0;
        self.s = [0; 12];
        #[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
        {
            self.thread = None;
        }
    }

    pub fn set_ra(&mut self, ra: usize) {
        self.ra = ra;
    }

    pub fn set_sp(&mut self, sp: usize) {
        self.sp = sp;
    }

    pub fn ra(&self) -> usize {
        self.ra
    }

    pub fn sp(&self) -> usize {
        self.sp
    }
}
