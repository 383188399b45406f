//! 宿主机上的 hart 模拟
//!
//! 每个 hart 有一组模拟的监督模式 CSR。调用内核代码的宿主线程在第一次
//! 访问 hart 状态时自动占用一个空闲 hart，线程结束时归还。
//!
//! 上下文切换用宿主线程实现：每个内核线程（调度器或进程）对应一个
//! 宿主线程，[`swtch`] 把 hart 交给目标线程后阻塞自己，直到有人切换回来。
//! 因此同一时刻每个 hart 上只有一个线程在运行，锁、中断屏蔽以及
//! sleep/wakeup 的约束与真实硬件上完全一致。

use std::cell::{Cell, RefCell};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread;
use std::time::Duration;
use std::vec::Vec;

use array_macro::array;

use crate::consts::{NCPU, PGSIZE};
use crate::process::{Context, CPU_MANAGER};

/// 调度器线程等待被切换回来的最长时间，超时说明某个内核线程没有按约定让出 hart
const STALL_TIMEOUT: Duration = Duration::from_secs(20);

/// 一个模拟 hart 的 CSR 与 TLB 刷新记录
pub struct HartState {
    pub id: usize,
    claimed: AtomicBool,
    pub sstatus: AtomicUsize,
    pub sie: AtomicUsize,
    pub sepc: AtomicUsize,
    pub scause: AtomicUsize,
    pub stval: AtomicUsize,
    pub stvec: AtomicUsize,
    pub satp: AtomicUsize,
    pub timecmp: AtomicU64,
    flushes: Mutex<Vec<Option<usize>>>,
}

impl HartState {
    const fn new(id: usize) -> Self {
        Self {
            id,
            claimed: AtomicBool::new(false),
            sstatus: AtomicUsize::new(0),
            sie: AtomicUsize::new(0),
            sepc: AtomicUsize::new(0),
            scause: AtomicUsize::new(0),
            stval: AtomicUsize::new(0),
            stvec: AtomicUsize::new(0),
            satp: AtomicUsize::new(0),
            timecmp: AtomicU64::new(0),
            flushes: Mutex::new(Vec::new()),
        }
    }

    fn reset(&self) {
        for csr in [
            &self.sstatus, &self.sie, &self.sepc,
            &self.scause, &self.stval, &self.stvec, &self.satp,
        ] {
            csr.store(0, Ordering::SeqCst);
        }
        self.timecmp.store(0, Ordering::SeqCst);
        self.flushes.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }

    /// 取出并清空此 hart 上的 TLB 刷新记录，`None` 表示整表刷新
    pub fn take_flushes(&self) -> Vec<Option<usize>> {
        let mut flushes = self.flushes.lock().unwrap_or_else(PoisonError::into_inner);
        core::mem::take(&mut *flushes)
    }
}

static HARTS: [HartState; NCPU] = array![i => HartState::new(i); NCPU];

/// 占用期间 hart 归当前宿主线程所有，析构时归还
pub struct HartClaim(&'static HartState);

impl Drop for HartClaim {
    fn drop(&mut self) {
        self.0.claimed.store(false, Ordering::SeqCst);
    }
}

std::thread_local! {
    static CURRENT: Cell<Option<&'static HartState>> = const { Cell::new(None) };
    static CLAIM: RefCell<Option<HartClaim>> = const { RefCell::new(None) };
}

/// 为当前线程占用一个空闲 hart，并把它的 CSR 与 `Cpu` 记录清零
pub fn claim_hart() -> &'static HartState {
    loop {
        for hart in HARTS.iter() {
            if hart
                .claimed
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                hart.reset();
                unsafe { CPU_MANAGER.reset_cpu(hart.id) };
                CURRENT.with(|c| c.set(Some(hart)));
                CLAIM.with(|c| *c.borrow_mut() = Some(HartClaim(hart)));
                return hart;
            }
        }
        thread::sleep(Duration::from_millis(1));
    }
}

/// 当前线程所在的 hart
pub fn hart() -> &'static HartState {
    match CURRENT.with(|c| c.get()) {
        Some(hart) => hart,
        None => claim_hart(),
    }
}

#[inline]
pub fn hart_id() -> usize {
    hart().id
}

pub fn sfence_vma() {
    hart().flushes.lock().unwrap_or_else(PoisonError::into_inner).push(None);
}

pub fn sfence_vma_asid(asid: usize) {
    hart().flushes.lock().unwrap_or_else(PoisonError::into_inner).push(Some(asid));
}

pub fn wfi() {
    thread::yield_now();
}

/// 一个内核线程的交接棒：谁拿到 hart 谁运行
pub struct KernelThread {
    turn: Mutex<Option<&'static HartState>>,
    cv: Condvar,
    spawned: bool,
}

impl KernelThread {
    fn new(spawned: bool) -> Arc<Self> {
        Arc::new(Self {
            turn: Mutex::new(None),
            cv: Condvar::new(),
            spawned,
        })
    }

    fn resume(&self, hart: &'static HartState) {
        let mut turn = self.turn.lock().unwrap_or_else(PoisonError::into_inner);
        *turn = Some(hart);
        self.cv.notify_one();
    }

    fn park(&self) -> &'static HartState {
        let mut turn = self.turn.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(hart) = turn.take() {
                return hart;
            }
            if self.spawned {
                turn = self.cv.wait(turn).unwrap_or_else(PoisonError::into_inner);
            } else {
                let (next, timeout) = self
                    .cv
                    .wait_timeout(turn, STALL_TIMEOUT)
                    .unwrap_or_else(PoisonError::into_inner);
                turn = next;
                if timeout.timed_out() && turn.is_none() {
                    panic!("swtch: no kernel thread switched back to this hart");
                }
            }
        }
    }
}

/// 把当前 hart 交给 `new` 描述的内核线程，直到某个线程切换回 `old`。
///
/// 第一次切换到某个上下文时，以它的 `ra` 作为入口启动一个新的宿主线程。
pub unsafe fn swtch(old: *mut Context, new: *mut Context) {
    let hart = hart();
    let me = (*old)
        .thread
        .get_or_insert_with(|| KernelThread::new(false))
        .clone();

    let next = match (*new).thread.as_ref() {
        Some(next) => next.clone(),
        None => {
            let next = KernelThread::new(true);
            (*new).thread = Some(next.clone());
            let entry: extern "C" fn() = core::mem::transmute((*new).ra());
            let baton = next.clone();
            thread::Builder::new()
                .name(std::format!("kthread-{:#x}", new as usize))
                .spawn(move || {
                    let hart = baton.park();
                    CURRENT.with(|c| c.set(Some(hart)));
                    entry();
                    panic!("swtch: kernel thread entry returned");
                })
                .unwrap_or_else(|err| panic!("swtch: spawn kernel thread: {}", err));
            next
        }
    };

    next.resume(hart);
    let hart = me.park();
    CURRENT.with(|c| c.set(Some(hart)));
}

#[repr(C, align(4096))]
struct Page([u8; PGSIZE]);

static TRAMPOLINE_PAGE: Page = Page([0; PGSIZE]);

/// 跳板页的“物理地址”
pub fn trampoline_page() -> usize {
    &TRAMPOLINE_PAGE as *const Page as usize
}

extern "C" fn uservec_stub() {}
extern "C" fn kernelvec_stub() {}

pub fn uservec() -> usize {
    uservec_stub as usize
}

pub fn kernelvec() -> usize {
    kernelvec_stub as usize
}

pub unsafe fn user_ret(_trapframe: usize, _satp: usize) -> ! {
    panic!("user_ret: hosted harts have no user mode")
}

static MTIME: AtomicU64 = AtomicU64::new(0);

pub fn aclint_read_time() -> u64 {
    MTIME.fetch_add(1, Ordering::SeqCst)
}

pub fn aclint_write_timecmp(value: u64) {
    hart().timecmp.store(value, Ordering::SeqCst);
}
