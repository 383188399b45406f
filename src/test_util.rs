//! 单元测试共用的环境：独立的物理页池、内核页表与进程表，
//! 以及给测试进程注入执行体的入口。

use std::alloc::{alloc_zeroed, Layout};
use std::boxed::Box;
use std::sync::{Mutex, PoisonError};
use std::vec::Vec;

use crate::consts::PGSIZE;
use crate::mm::{FreeList, Kvm};
use crate::process::pmu::{NoPmu, PmuFirmware, SbiError};
use crate::process::{Proc, ProcManager, ProcState, CPU_MANAGER};

/// 一个含 `pages` 个空闲页的分配器，内存永不释放
pub fn arena(pages: usize) -> &'static FreeList {
    let layout = Layout::from_size_align(pages * PGSIZE, PGSIZE).unwrap();
    let start = unsafe { alloc_zeroed(layout) } as usize;
    assert_ne!(start, 0);
    let kmem: &'static FreeList = Box::leak(Box::new(FreeList::new("test kmem")));
    unsafe { kmem.init(start, start + pages * PGSIZE) };
    kmem
}

/// 在 `kmem` 上建好的内核页表
pub fn kernel_vm(kmem: &'static FreeList) -> &'static Kvm {
    let kvm: &'static Kvm = Box::leak(Box::new(Kvm::new(kmem)));
    unsafe { kvm.kvm_init() };
    kvm
}

/// 四个槽位的进程表，物理页池共 `pages` 页，其中 5 页用于内核页表
pub fn proc_table(pages: usize) -> &'static ProcManager<4> {
    proc_table_with(pages, &NoPmu)
}

/// 同 [`proc_table`]，计数器由 `pmu` 提供
pub fn proc_table_with(pages: usize, pmu: &'static dyn PmuFirmware) -> &'static ProcManager<4> {
    let kvm = kernel_vm(arena(pages));
    Box::leak(Box::new(ProcManager::new(kvm, pmu, test_first_run)))
}

/// 记录每次调用的假固件，`fail` 时启停返回错误
///
/// 配置时总是挑可用掩码中编号最小的计数器，计数器 `i` 读出 `1000 + i`。
pub struct Recorder {
    pub calls: Mutex<Vec<(&'static str, usize, bool)>>,
    pub counters: usize,
    pub fail: bool,
}

impl Recorder {
    pub const fn new(fail: bool) -> Self {
        Self { calls: Mutex::new(Vec::new()), counters: 4, fail }
    }

    pub fn leak(self) -> &'static Self {
        Box::leak(Box::new(self))
    }

    pub fn calls(&self) -> Vec<(&'static str, usize, bool)> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn record(&self, call: (&'static str, usize, bool)) {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).push(call);
    }

    fn result(&self) -> Result<(), SbiError> {
        if self.fail { Err(SbiError(-2)) } else { Ok(()) }
    }
}

impl PmuFirmware for Recorder {
    fn num_counters(&self) -> Result<usize, SbiError> {
        Ok(self.counters)
    }

    fn config_matching(&self, mask: usize, _flags: usize, event: usize) -> Result<usize, SbiError> {
        self.record(("config", event, false));
        if mask == 0 {
            return Err(SbiError(-3));
        }
        Ok(mask.trailing_zeros() as usize)
    }

    fn counter_start(&self, mask: usize, reset: bool) -> Result<(), SbiError> {
        self.record(("start", mask, reset));
        self.result()
    }

    fn counter_stop(&self, mask: usize, reset: bool) -> Result<(), SbiError> {
        self.record(("stop", mask, reset));
        self.result()
    }

    fn counter_read(&self, counter_idx: usize) -> Result<u64, SbiError> {
        self.record(("read", counter_idx, false));
        Ok(1000 + counter_idx as u64)
    }
}

type Body = Box<dyn FnOnce() + Send>;

static BODIES: Mutex<Vec<(usize, Body)>> = Mutex::new(Vec::new());

/// 进程 `p` 第一次被调度时在内核态执行 `body`，返回后进程变为僵尸
pub fn on_first_run(p: &Proc, body: impl FnOnce() + Send + 'static) {
    BODIES
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .push((p.channel(), Box::new(body)));
}

extern "C" fn test_first_run() {
    let p = CPU_MANAGER.my_proc();
    unsafe { p.excl.unlock() };

    let body = {
        let mut bodies = BODIES.lock().unwrap_or_else(PoisonError::into_inner);
        let i = bodies
            .iter()
            .position(|(channel, _)| *channel == p.channel())
            .unwrap_or_else(|| panic!("test: no body for proc {}", p.index()));
        bodies.swap_remove(i).1
    };
    body();
    finish(p)
}

/// 让进程直接变为僵尸并切回调度器，不再被调度
pub fn finish(p: &Proc) -> ! {
    let mut guard = p.excl.lock();
    guard.state = ProcState::Zombie;
    unsafe {
        let ctx = p.data_mut().context_ptr();
        let _guard = CPU_MANAGER.sched(guard, ctx);
    }
    unreachable!("zombie test proc rescheduled")
}
