//! 用户进程的陷阱帧

/// 用户态陷入内核时保存的寄存器现场，以及跳板页重新进入内核所需的信息。
///
/// 每个进程独占一页，映射在用户地址空间的 `TRAPFRAME` 处（不带 U 位），
/// 字段偏移与 `asm/trampoline.S` 逐一对应，不能调整顺序。
#[repr(C)]
#[derive(Debug, Default, Clone)]
pub struct TrapFrame {
    /*   0 */ pub kernel_satp: usize,   // 进程私有内核页表
    /*   8 */ pub kernel_sp: usize,     // 进程内核栈的栈顶
    /*  16 */ pub kernel_trap: usize,   // usertrap()
    /*  24 */ pub epc: usize,           // 保存的用户程序计数器
    /*  32 */ pub kernel_hartid: usize, // 保存的内核 tp
    /*  40 */ pub ra: usize,
    /*  48 */ pub sp: usize,
    /*  56 */ pub gp: usize,
    /*  64 */ pub tp: usize,
    /*  72 */ pub t0: usize,
    /*  80 */ pub t1: usize,
    /*  88 */ pub t2: usize,
    /*  96 */ pub s0: usize,
    /* 104 */ pub s1: usize,
    /* 112 */ pub a0: usize,
    /* 120 */ pub a1: usize,
    /* 128 */ pub a2: usize,
    /* 136 */ pub a3: usize,
    /* 144 */ pub a4: usize,
    /* 152 */ pub a5: usize,
    /* 160 */ pub a6: usize,
    /* 168 */ pub a7: usize,
    /* 176 */ pub s2: usize,
    /* 184 */ pub s3: usize,
    /* 192 */ pub s4: usize,
    /* 200 */ pub s5: usize,
    /* 208 */ pub s6: usize,
    /* 216 */ pub s7: usize,
    /* 224 */ pub s8: usize,
    /* 232 */ pub s9: usize,
    /* 240 */ pub s10: usize,
    /* 248 */ pub s11: usize,
    /* 256 */ pub t3: usize,
    /* 264 */ pub t4: usize,
    /* 272 */ pub t5: usize,
    /* 280 */ pub t6: usize,
}

impl TrapFrame {
    /// 跳过 `ecall` 指令，返回用户态后从下一条指令继续
    #[inline]
    pub fn admit_ecall(&mut self) {
        self.epc += 4;
    }

    /// 第 `n` 个系统调用参数
    pub fn arg(&self, n: usize) -> usize {
        match n {
            0 => self.a0,
            1 => self.a1,
            2 => self.a2,
            3 => self.a3,
            4 => self.a4,
            5 => self.a5,
            _ => panic!("syscall argument {} out of range", n),
        }
    }

    /// 记录内核态下的寄存器状态
    pub fn dump(&self) {
        log::error!(
            "trapframe: epc={:#x} ra={:#x} sp={:#x} gp={:#x} tp={:#x}",
            self.epc, self.ra, self.sp, self.gp, self.tp
        );
        log::error!(
            "  a0={:#x} a1={:#x} a2={:#x} a3={:#x} a4={:#x} a5={:#x} a6={:#x} a7={:#x}",
            self.a0, self.a1, self.a2, self.a3, self.a4, self.a5, self.a6, self.a7
        );
        log::error!(
            "  kernel_satp={:#x} kernel_sp={:#x} kernel_trap={:#x} kernel_hartid={}",
            self.kernel_satp, self.kernel_sp, self.kernel_trap, self.kernel_hartid
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::size_of;

    #[test]
    fn layout_matches_trampoline() {
        let tf = TrapFrame::default();
        let base = &tf as *const TrapFrame as usize;
        assert_eq!(&tf.epc as *const usize as usize - base, 24);
        assert_eq!(&tf.kernel_hartid as *const usize as usize - base, 32);
        assert_eq!(&tf.a0 as *const usize as usize - base, 112);
        assert_eq!(&tf.a7 as *const usize as usize - base, 168);
        assert_eq!(size_of::<TrapFrame>(), 288);
    }
}
