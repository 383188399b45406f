//! 监督中断使能寄存器 (sie) 操作模块

const SSIE: usize = 1 << 1; // software
const STIE: usize = 1 << 5; // timer
const SEIE: usize = 1 << 9; // external

#[inline]
fn read() -> usize {
    csr_read!(sie)
}

#[inline]
fn write(x: usize) {
    csr_write!(sie, x)
}

/// 打开软件、时钟与外部中断源
pub fn intr_on() {
    write(read() | SSIE | STIE | SEIE);
}
