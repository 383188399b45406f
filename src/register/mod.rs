//! 定义操作所需RISC-V寄存器的接口
//!
//! 裸机上每个访问都是一条 `csrr`/`csrw`，宿主机上读写模拟 hart 的寄存器。

pub mod satp;
pub mod scause;
pub mod sie;
pub mod sstatus;

pub mod sepc {
    #[inline]
    pub fn read() -> usize {
        csr_read!(sepc)
    }

    #[inline]
    pub fn write(sepc: usize) {
        csr_write!(sepc, sepc)
    }
}

pub mod stval {
    #[inline]
    pub fn read() -> usize {
        csr_read!(stval)
    }
}

pub mod stvec {
    #[inline]
    pub fn write(stvec: usize) {
        csr_write!(stvec, stvec)
    }

    #[inline]
    pub fn read() -> usize {
        csr_read!(stvec)
    }
}

pub mod tp {
    /// 内核中 tp 始终保存当前 hart 的编号
    #[inline]
    pub fn read() -> usize {
        crate::arch::hart_id()
    }
}
