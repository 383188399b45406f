//! 中断处理模块，用户或内核模式下发生中断或异常时进行处理

use crate::arch;
use crate::consts::{NIRQ, TRAPFRAME, UART_IRQ};
use crate::process::{syscall, CpuManager, Proc, ProcManager, ProcState, Wakeup, CPU_MANAGER, PROC_MANAGER};
use crate::register::scause::{self, ScauseType};
use crate::register::{sepc, sie, sstatus, stval, stvec};
use crate::spinlock::SpinLock;
use crate::timer::{clock_intr, set_next_timeout};

/// `devintr` 识别出的中断类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    Timer,
    Device,
    Unrecognized,
}

/// 外部中断号到处理函数的表
static IRQ_HANDLERS: SpinLock<[Option<fn()>; NIRQ]> = SpinLock::new([None; NIRQ], "irq");

/// 登记外部中断 `irq` 的处理函数，已有的处理函数被替换
pub fn register_irq(irq: usize, handler: fn()) {
    assert!(irq < NIRQ, "register_irq: irq {} out of range", irq);
    IRQ_HANDLERS.lock()[irq] = Some(handler);
}

fn dispatch_irq(irq: usize) -> bool {
    // 调用处理函数时不持有表的锁
    let handler = IRQ_HANDLERS.lock()[irq];
    match handler {
        Some(handler) => {
            handler();
            true
        }
        None => false,
    }
}

/// 在当前 hart 上安装内核陷阱向量，打开中断源并启动时钟
pub fn trap_init_hart() {
    stvec::write(arch::kernelvec());
    sie::intr_on();
    set_next_timeout();
}

/// # 功能说明
/// 处理设备中断。时钟中断只在 hart 0 上推进滴答，
/// 每个 hart 都重新设定自己的下一次时钟；外部中断交给 UART 的处理函数。
///
/// # 返回值
/// 中断的类型，不是设备中断时返回 `Unrecognized`。
pub fn devintr(procs: &dyn Wakeup) -> Interrupt {
    match scause::get_scause() {
        ScauseType::IntSTimer => {
            if CpuManager::cpu_id() == 0 {
                clock_intr(procs);
            }
            set_next_timeout();
            Interrupt::Timer
        }
        ScauseType::IntSExt => {
            if !dispatch_irq(UART_IRQ) {
                log::warn!("devintr: no handler for irq {}", UART_IRQ);
            }
            Interrupt::Device
        }
        _ => Interrupt::Unrecognized,
    }
}

/// 跳板页中的 `uservec` 跳到这里
#[no_mangle]
pub unsafe extern "C" fn usertrap() {
    handle_user_trap(&PROC_MANAGER);
    user_trap_ret();
}

/// # 功能说明
/// 处理来自用户态的陷阱：系统调用、设备中断或用户程序的异常。
///
/// # 流程解释
/// 1. 确认来自用户态，改用内核陷阱向量，把 `sepc` 存进陷阱帧；
/// 2. 系统调用：已被 kill 则退出，否则跳过 `ecall`、开中断后分发；
/// 3. 设备中断交给 `devintr`；
/// 4. 其他原因是用户程序的错误：默认杀死该进程，
///    开启 `user_fault_fatal` 时打印现场后 panic；
/// 5. 返回前再次检查 kill 标志，时钟中断则让出 CPU。
pub fn handle_user_trap<const N: usize>(procs: &ProcManager<N>) {
    if !sstatus::is_from_user() {
        panic!("usertrap: not from user mode, sstatus={:#x}", sstatus::read());
    }

    // 现在在内核里，陷阱交给 kerneltrap
    stvec::write(arch::kernelvec());

    let p = CPU_MANAGER.my_proc();
    unsafe { p.data_mut() }.tf_mut().epc = sepc::read();

    let mut which = Interrupt::Unrecognized;
    match scause::get_scause() {
        ScauseType::ExcUEcall => {
            if p.is_killed() {
                procs.exiting(p.index(), -1);
            }
            // 返回到 ecall 的下一条指令
            unsafe { p.data_mut() }.tf_mut().admit_ecall();
            // 已经处理完 sepc、scause、sstatus，可以开中断
            sstatus::intr_on();
            syscall::syscall(procs, p);
        }
        _ => {
            which = devintr(procs);
            if which == Interrupt::Unrecognized {
                user_fault(p);
            }
        }
    }

    if p.is_killed() {
        procs.exiting(p.index(), -1);
    }

    if which == Interrupt::Timer {
        p.yielding();
    }
}

#[cfg(not(feature = "user_fault_fatal"))]
fn user_fault(p: &Proc) {
    log::warn!(
        "usertrap: killed pid {} '{}' because of unexpected scause {:#x} sepc={:#x} stval={:#x}",
        p.pid(),
        unsafe { p.data() }.name(),
        scause::read(),
        sepc::read(),
        stval::read()
    );
    p.set_killed();
}

#[cfg(feature = "user_fault_fatal")]
fn user_fault(p: &Proc) {
    log::error!(
        "usertrap: pid {} '{}' unexpected scause {:#x} sepc={:#x} stval={:#x}",
        p.pid(),
        unsafe { p.data() }.name(),
        scause::read(),
        sepc::read(),
        stval::read()
    );
    let pd = unsafe { p.data() };
    pd.tf().dump();
    pd.pagetable().vmprint();
    panic!("usertrap: unexpected scause {:#x}", scause::read());
}

/// # 功能说明
/// 回到当前进程的用户态。
///
/// # 流程解释
/// 1. 关中断，把陷阱向量改为跳板页中的 `uservec`，
///    在 `sret` 之前不能再发生陷阱；
/// 2. 填好陷阱帧中下次陷入要用的内核信息，`sepc` 设为用户程序计数器；
/// 3. `sret` 后回到用户态并打开中断；
/// 4. 跳到跳板页中的 `userret`，切换到用户页表（用户地址空间号）后返回用户态。
///
/// # 安全性
/// 只能由持有当前进程、且不持有任何锁的执行流调用。
pub unsafe fn user_trap_ret() -> ! {
    let p = CPU_MANAGER.my_proc();

    sstatus::intr_off();
    stvec::write(arch::uservec());

    let satp = p.data_mut().user_ret_prepare(usertrap as usize, p.user_asid());
    sstatus::user_ret_prepare();

    arch::user_ret(TRAPFRAME.into(), satp)
}

/// `kernelvec` 跳到这里，运行在被打断的内核栈上
#[no_mangle]
pub extern "C" fn kerneltrap() {
    handle_kernel_trap(&PROC_MANAGER);
}

/// # 功能说明
/// 处理内核态下的陷阱。只接受设备中断，其他原因都是内核错误。
/// 时钟中断打断正在运行的进程时让出 CPU。
///
/// # 流程解释
/// 让出 CPU 后可能发生别的陷阱并改写 `sepc` 与 `sstatus`，
/// 所以先保存，返回前再恢复。
pub fn handle_kernel_trap<const N: usize>(procs: &ProcManager<N>) {
    let saved_sepc = sepc::read();
    let saved_sstatus = sstatus::read();

    if !sstatus::is_from_supervisor() {
        panic!("kerneltrap: not from supervisor mode");
    }
    if sstatus::intr_get() {
        panic!("kerneltrap: interrupts enabled");
    }

    let which = devintr(procs);
    if which == Interrupt::Unrecognized {
        log::error!(
            "kerneltrap: hart {} scause {:#x} sepc={:#x} stval={:#x}",
            CpuManager::cpu_id(),
            scause::read(),
            sepc::read(),
            stval::read()
        );
        if let Some(p) = CPU_MANAGER.try_my_proc() {
            log::error!("kerneltrap: running pid {} '{}'", p.pid(), unsafe { p.data() }.name());
        }
        panic!("kerneltrap: unexpected scause {:#x}", scause::read());
    }

    if which == Interrupt::Timer {
        if let Some(p) = CPU_MANAGER.try_my_proc() {
            let running = p.excl.lock().state == ProcState::Running;
            if running {
                p.yielding();
            }
        }
    }

    sepc::write(saved_sepc);
    sstatus::write(saved_sstatus);
}
