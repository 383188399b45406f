//! 监督模式陷阱原因寄存器 (scause) 操作模块

use bit_field::BitField;

const INTERRUPT_BIT: usize = 63;

const INTERRUPT_SUPERVISOR_TIMER: usize = 5;
const INTERRUPT_SUPERVISOR_EXTERNAL: usize = 9;

const EXCEPTION_ILLEGAL_INSTRUCTION: usize = 2;
const EXCEPTION_ECALL_USER: usize = 8;
const EXCEPTION_INSTRUCTION_PAGE_FAULT: usize = 12;
const EXCEPTION_LOAD_PAGE_FAULT: usize = 13;
const EXCEPTION_STORE_PAGE_FAULT: usize = 15;

/// 内核关心的几类陷阱原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScauseType {
    /// 监督模式时钟中断
    IntSTimer,
    /// 监督模式外部中断
    IntSExt,
    /// 用户态 `ecall`
    ExcUEcall,
    ExcIllegalInstr,
    ExcPageFault,
    Unknown(usize),
}

#[inline]
pub fn read() -> usize {
    csr_read!(scause)
}

#[cfg(test)]
pub fn write(scause: usize) {
    csr_write!(scause, scause)
}

/// 把原始 scause 值归类
pub fn decode(scause: usize) -> ScauseType {
    let code = scause.get_bits(0..INTERRUPT_BIT);
    if scause.get_bit(INTERRUPT_BIT) {
        match code {
            INTERRUPT_SUPERVISOR_TIMER => ScauseType::IntSTimer,
            INTERRUPT_SUPERVISOR_EXTERNAL => ScauseType::IntSExt,
            _ => ScauseType::Unknown(scause),
        }
    } else {
        match code {
            EXCEPTION_ECALL_USER => ScauseType::ExcUEcall,
            EXCEPTION_ILLEGAL_INSTRUCTION => ScauseType::ExcIllegalInstr,
            EXCEPTION_INSTRUCTION_PAGE_FAULT
            | EXCEPTION_LOAD_PAGE_FAULT
            | EXCEPTION_STORE_PAGE_FAULT => ScauseType::ExcPageFault,
            _ => ScauseType::Unknown(scause),
        }
    }
}

#[inline]
pub fn get_scause() -> ScauseType {
    decode(read())
}

/// 构造中断原因的原始值
pub const fn interrupt(code: usize) -> usize {
    (1 << INTERRUPT_BIT) | code
}

pub const TIMER: usize = interrupt(INTERRUPT_SUPERVISOR_TIMER);
pub const EXTERNAL: usize = interrupt(INTERRUPT_SUPERVISOR_EXTERNAL);
pub const ECALL_USER: usize = EXCEPTION_ECALL_USER;
pub const ILLEGAL_INSTRUCTION: usize = EXCEPTION_ILLEGAL_INSTRUCTION;
