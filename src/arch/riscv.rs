//! 裸机 RISC-V 实现

use core::arch::{asm, global_asm};
use core::ptr;

use crate::consts::{ACLINT_S, TRAMPOLINE};
use crate::process::Context;

global_asm!(include_str!("../asm/kernelvec.S"));
global_asm!(include_str!("../asm/swtch.S"));
global_asm!(include_str!("../asm/trampoline.S"));

extern "C" {
    /// 保存当前寄存器到 `old`，从 `new` 恢复寄存器。见 `asm/swtch.S`。
    pub fn swtch(old: *mut Context, new: *mut Context);

    fn trampoline();
    fn uservec_entry();
    fn userret_entry();
    fn kernelvec_entry();
}

#[inline]
pub fn hart_id() -> usize {
    let ret: usize;
    unsafe { asm!("mv {}, tp", out(reg) ret) };
    ret
}

/// 刷新整个 TLB
#[inline]
pub fn sfence_vma() {
    unsafe { asm!("sfence.vma zero, zero") };
}

/// 只刷新属于 `asid` 的 TLB 项
#[inline]
pub fn sfence_vma_asid(asid: usize) {
    unsafe { asm!("sfence.vma zero, {}", in(reg) asid) };
}

#[inline]
pub fn wfi() {
    unsafe { asm!("wfi") };
}

/// 跳板页的物理地址
#[inline]
pub fn trampoline_page() -> usize {
    trampoline as usize
}

/// `uservec` 在跳板页映射之后的虚拟地址
#[inline]
pub fn uservec() -> usize {
    usize::from(TRAMPOLINE) + (uservec_entry as usize - trampoline as usize)
}

#[inline]
pub fn kernelvec() -> usize {
    kernelvec_entry as usize
}

/// 跳到跳板页中的 `userret`，切换到用户页表并 `sret`。
pub unsafe fn user_ret(trapframe: usize, satp: usize) -> ! {
    let userret_va = usize::from(TRAMPOLINE) + (userret_entry as usize - trampoline as usize);
    let userret: extern "C" fn(usize, usize) -> ! = core::mem::transmute(userret_va);
    userret(trapframe, satp)
}

#[inline]
pub fn aclint_read_time() -> u64 {
    unsafe { ptr::read_volatile(usize::from(ACLINT_S) as *const u64) }
}

#[inline]
pub fn aclint_write_timecmp(value: u64) {
    unsafe { ptr::write_volatile((usize::from(ACLINT_S) + 8) as *mut u64, value) }
}

/// SBI 调用，返回 `(error, value)`
#[inline]
pub fn sbi_call(
    eid: usize,
    fid: usize,
    a0: usize,
    a1: usize,
    a2: usize,
    a3: usize,
    a4: usize,
) -> (isize, usize) {
    let error: isize;
    let value: usize;
    unsafe {
        asm!(
            "ecall",
            inlateout("a0") a0 => error,
            inlateout("a1") a1 => value,
            in("a2") a2,
            in("a3") a3,
            in("a4") a4,
            in("a6") fid,
            in("a7") eid,
        );
    }
    (error, value)
}
