//! 内核主入口函数，完成各 hart 的初始化后进入调度器。
//!
//! 由 SBI 固件以监督模式跳入，`a0` 为 hart 编号。启动栈与链接脚本由板级代码提供。

use core::arch::asm;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::consts::PHYSTOP;
use crate::mm::{KMEM, KVM};
use crate::process::{CPU_MANAGER, PROC_MANAGER};
use crate::trap::trap_init_hart;

static STARTED: AtomicBool = AtomicBool::new(false);

/// 第一个用户程序：每隔 100 个滴答睡眠一次，永不退出
///
/// ```text
/// loop: li a0, 100
///       li a7, 13      # SYS_SLEEP
///       ecall
///       j loop
/// ```
static INITCODE: [u8; 16] = [
    0x13, 0x05, 0x40, 0x06, 0x93, 0x08, 0xd0, 0x00, 0x73, 0x00, 0x00, 0x00, 0x6f, 0xf0, 0x5f, 0xff,
];

#[no_mangle]
pub unsafe extern "C" fn rust_main(hartid: usize, _dtb: usize) -> ! {
    // cpu_id() 从 tp 读取
    asm!("mv tp, {}", in(reg) hartid);

    if hartid == 0 {
        extern "C" {
            fn kernel_end();
        }
        log::info!("rvkernel is booting");
        KMEM.init(kernel_end as usize, usize::from(PHYSTOP)); // 物理页分配器
        KVM.kvm_init(); // 内核页表
        KVM.kvm_init_hart(); // 开启分页
        trap_init_hart(); // 内核陷阱向量与时钟
        if let Err(err) = PROC_MANAGER.user_init(&INITCODE) {
            panic!("user_init: {}", err);
        }
        log::info!("kernel startup finished");

        STARTED.store(true, Ordering::SeqCst);
    } else {
        while !STARTED.load(Ordering::SeqCst) {}

        log::info!("hart {} starting", hartid);
        KVM.kvm_init_hart();
        trap_init_hart();
    }

    CPU_MANAGER.scheduler(&PROC_MANAGER);
}
