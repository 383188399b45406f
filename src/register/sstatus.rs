//! 监督状态寄存器 (sstatus) 操作模块

use bit_field::BitField;

const SIE: usize = 1;  // supervisor interrupt enable
const SPIE: usize = 5; // supervisor previous interrupt enable
const SPP: usize = 8;  // previous mode, is from supervisor?

#[inline]
pub fn read() -> usize {
    csr_read!(sstatus)
}

#[inline]
pub fn write(x: usize) {
    csr_write!(sstatus, x)
}

/// 打开当前 hart 的中断
#[inline]
pub fn intr_on() {
    write(*read().set_bit(SIE, true));
}

#[inline]
pub fn intr_off() {
    write(*read().set_bit(SIE, false));
}

#[inline]
pub fn intr_get() -> bool {
    read().get_bit(SIE)
}

#[inline]
pub fn is_from_supervisor() -> bool {
    read().get_bit(SPP)
}

#[inline]
pub fn is_from_user() -> bool {
    !read().get_bit(SPP)
}

/// `sret` 之后进入用户态并打开中断
#[inline]
pub fn user_ret_prepare() {
    let mut x = read();
    x.set_bit(SPP, false);
    x.set_bit(SPIE, true);
    write(x);
}

/// 仅用于构造模拟的陷阱现场
#[cfg(test)]
pub fn set_spp(supervisor: bool) {
    write(*read().set_bit(SPP, supervisor));
}
