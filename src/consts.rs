//! 内核的编译期常量：进程表规模、页大小、SoC 地址空间布局

use core::ops::{Add, Sub};

/// 带类型的常量地址，只在常量定义处使用，再由 `PhysAddr`/`VirtAddr` 转换而来
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct ConstAddr(usize);

impl ConstAddr {
    pub const fn as_usize(self) -> usize {
        self.0
    }

    pub const fn const_add(self, off: usize) -> Self {
        Self(self.0 + off)
    }

    pub const fn const_sub(self, off: usize) -> Self {
        Self(self.0 - off)
    }
}

impl From<ConstAddr> for usize {
    fn from(addr: ConstAddr) -> Self {
        addr.0
    }
}

impl Add<usize> for ConstAddr {
    type Output = Self;

    fn add(self, rhs: usize) -> Self {
        Self(self.0 + rhs)
    }
}

impl Sub<usize> for ConstAddr {
    type Output = Self;

    fn sub(self, rhs: usize) -> Self {
        Self(self.0 - rhs)
    }
}

// ======================= 进程与硬件线程 =======================

/// 进程表槽位数
pub const NPROC: usize = 64;
/// 硬件线程（hart）上限
pub const NCPU: usize = 8;
/// 每个进程可打开的文件数
pub const NOFILE: usize = 16;
/// 第一个用户进程的 pid
pub const ROOT_PID: usize = 1;
/// 每个进程可同时映射的性能计数器句柄数
pub const MAX_PMU_HANDLES: usize = 8;

// ======================= 分页 =======================

pub const PGSIZE: usize = 4096;
pub const PGSHIFT: usize = 12;
pub const PGMASKLEN: usize = 9;
pub const PGMASK: usize = 0x1FF;

/// 每个进程私有内核栈的页数
pub const KSTACK_PAGES: usize = 4;

/// Sv39 下可用的最高虚拟地址再加一。
/// 实际上少用了一位，以避免对高位做符号扩展。
pub const MAXVA: ConstAddr = ConstAddr(1 << (9 + 9 + 9 + 12 - 1));

/// 跳板页映射在所有地址空间（用户与内核）的最高处
pub const TRAMPOLINE: ConstAddr = MAXVA.const_sub(PGSIZE);
/// 陷阱帧紧贴在跳板页下方
pub const TRAPFRAME: ConstAddr = TRAMPOLINE.const_sub(PGSIZE);
/// 每个进程私有内核页表中内核栈的虚拟地址，各进程相同
pub const VKSTACK: ConstAddr = ConstAddr(0x3E_C000_0000);

// ======================= I/O =======================

/// LED、UART、ULPI、ACLINT、HDMI 控制寄存器共用最低的一页
pub const LEDS: ConstAddr = ConstAddr(0x0);
pub const UART: ConstAddr = ConstAddr(0x1);
pub const ACLINT_S: ConstAddr = ConstAddr(0x80);
pub const FLASH_BFR: ConstAddr = ConstAddr(0x20_0000);
pub const FRAME_BFR: ConstAddr = ConstAddr(0x10_0000);
pub const FRAME_BFR_SIZE: usize = 0x8_0000;

/// 主输入设备（UART）的中断号，直接接在 supervisor 外部中断上
pub const UART_IRQ: usize = 0;
/// 中断分发表的大小
pub const NIRQ: usize = 8;

/// 两次时钟中断之间的 ACLINT 计数
pub const INTERVAL: u64 = 1_000_000;

// ======================= 物理内存 =======================

pub const KERNBASE: ConstAddr = ConstAddr(0x4000_0000);
pub const PHYSTOP: ConstAddr = ConstAddr(0x4018_0000);
