//! 监督地址转换与保护寄存器 (satp) 操作模块

const SATP_SV39: usize = 8 << 60;
const ASID_SHIFT: usize = 44;
const ASID_MASK: usize = 0xFFFF;
const PPN_MASK: usize = (1 << 44) - 1;

#[inline]
pub fn read() -> usize {
    csr_read!(satp)
}

#[inline]
pub fn write(satp: usize) {
    csr_write!(satp, satp)
}

/// 由根页表的物理地址和地址空间号组成 Sv39 的 satp 值
#[inline]
pub const fn make(root_pa: usize, asid: usize) -> usize {
    SATP_SV39 | ((asid & ASID_MASK) << ASID_SHIFT) | (root_pa >> 12)
}

/// satp 中的地址空间号
#[inline]
pub const fn asid(satp: usize) -> usize {
    (satp >> ASID_SHIFT) & ASID_MASK
}

/// satp 所指根页表的物理地址
#[inline]
pub const fn root(satp: usize) -> usize {
    (satp & PPN_MASK) << 12
}
