//! 进程的性能计数器记录
//!
//! 每个进程最多登记 [`MAX_PMU_HANDLES`] 个计数器句柄，句柄映射到某个物理计数器。
//! 用户程序通过 [`pmu_setup`] 配置句柄、通过 [`pmu_control`] 启停和读取计数器；
//! 调度器在切换进程前后启动、停止该进程已启动的计数器，
//! 切换时的固件调用失败只记录日志，不影响调度。

use core::mem::size_of;

use crate::consts::MAX_PMU_HANDLES;

use super::{Proc, ProcError};

/// SBI PMU 扩展号 "PMU"
pub const SBI_EXT_PMU: usize = 0x504D55;
const SBI_PMU_NUM_COUNTERS: usize = 0;
const SBI_PMU_COUNTER_GET_INFO: usize = 1;
const SBI_PMU_COUNTER_CONFIG_MATCHING: usize = 2;
const SBI_PMU_COUNTER_START: usize = 3;
const SBI_PMU_COUNTER_STOP: usize = 4;
const SBI_PMU_COUNTER_FW_READ: usize = 5;
const SBI_PMU_START_SET_INIT_VALUE: usize = 1;
const SBI_PMU_STOP_FLAG_RESET: usize = 1;

/// `pmu_control` 的动作
pub const PMU_ACTION_START: usize = 1;
pub const PMU_ACTION_STOP: usize = 2;
pub const PMU_ACTION_READ: usize = 3;
pub const PMU_ACTION_STOP_READ: usize = 4;

/// 固件返回的错误码
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("SBI PMU call failed with error {0}")]
pub struct SbiError(pub isize);

/// 提供计数器服务的特权固件
pub trait PmuFirmware: Sync {
    /// 物理计数器的个数
    fn num_counters(&self) -> Result<usize, SbiError>;

    /// 在 `mask` 中挑一个能计数 `event` 的物理计数器并配置好，返回它的编号
    fn config_matching(&self, mask: usize, flags: usize, event: usize) -> Result<usize, SbiError>;

    /// 启动 `mask` 中的物理计数器，`reset` 时先清零
    fn counter_start(&self, mask: usize, reset: bool) -> Result<(), SbiError>;

    /// 停止 `mask` 中的物理计数器，`reset` 时同时清零
    fn counter_stop(&self, mask: usize, reset: bool) -> Result<(), SbiError>;

    /// 读取编号为 `counter_idx` 的物理计数器
    fn counter_read(&self, counter_idx: usize) -> Result<u64, SbiError>;
}

/// 没有 PMU 固件时使用：没有物理计数器，启停直接成功
pub struct NoPmu;

impl PmuFirmware for NoPmu {
    fn num_counters(&self) -> Result<usize, SbiError> {
        Ok(0)
    }

    fn config_matching(&self, _mask: usize, _flags: usize, _event: usize) -> Result<usize, SbiError> {
        Err(SbiError(-2))
    }

    fn counter_start(&self, _mask: usize, _reset: bool) -> Result<(), SbiError> {
        Ok(())
    }

    fn counter_stop(&self, _mask: usize, _reset: bool) -> Result<(), SbiError> {
        Ok(())
    }

    fn counter_read(&self, _counter_idx: usize) -> Result<u64, SbiError> {
        Err(SbiError(-2))
    }
}

/// 通过 SBI PMU 扩展访问计数器
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
pub struct SbiPmu;

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
impl SbiPmu {
    fn call(fid: usize, a0: usize, a1: usize, a2: usize, a3: usize) -> Result<usize, SbiError> {
        match crate::arch::sbi_call(SBI_EXT_PMU, fid, a0, a1, a2, a3, 0) {
            (0, value) => Ok(value),
            (error, _) => Err(SbiError(error)),
        }
    }
}

/// 读取编号为 `csr` 的用户态计数器 CSR（`cycle`、`instret`、`hpmcounter3..31`）
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
macro_rules! read_counter_csr {
    ($csr:expr, $($n:literal => $name:ident),* $(,)?) => {
        match $csr {
            $($n => csr_read!($name) as u64,)*
            _ => 0,
        }
    };
}

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
impl PmuFirmware for SbiPmu {
    fn num_counters(&self) -> Result<usize, SbiError> {
        Self::call(SBI_PMU_NUM_COUNTERS, 0, 0, 0, 0)
    }

    fn config_matching(&self, mask: usize, flags: usize, event: usize) -> Result<usize, SbiError> {
        Self::call(SBI_PMU_COUNTER_CONFIG_MATCHING, 0, mask, flags, event)
    }

    fn counter_start(&self, mask: usize, reset: bool) -> Result<(), SbiError> {
        let flags = if reset { SBI_PMU_START_SET_INIT_VALUE } else { 0 };
        Self::call(SBI_PMU_COUNTER_START, 0, mask, flags, 0).map(|_| ())
    }

    fn counter_stop(&self, mask: usize, reset: bool) -> Result<(), SbiError> {
        let flags = if reset { SBI_PMU_STOP_FLAG_RESET } else { 0 };
        Self::call(SBI_PMU_COUNTER_STOP, 0, mask, flags, 0).map(|_| ())
    }

    fn counter_read(&self, counter_idx: usize) -> Result<u64, SbiError> {
        let info = Self::call(SBI_PMU_COUNTER_GET_INFO, counter_idx, 0, 0, 0)?;
        if info >> 63 != 0 {
            // 固件计数器
            return Self::call(SBI_PMU_COUNTER_FW_READ, counter_idx, 0, 0, 0).map(|v| v as u64);
        }
        Ok(read_counter_csr!(info & 0xfff,
            0xc00 => cycle, 0xc02 => instret,
            0xc03 => hpmcounter3, 0xc04 => hpmcounter4, 0xc05 => hpmcounter5,
            0xc06 => hpmcounter6, 0xc07 => hpmcounter7, 0xc08 => hpmcounter8,
            0xc09 => hpmcounter9, 0xc0a => hpmcounter10, 0xc0b => hpmcounter11,
            0xc0c => hpmcounter12, 0xc0d => hpmcounter13, 0xc0e => hpmcounter14,
            0xc0f => hpmcounter15, 0xc10 => hpmcounter16, 0xc11 => hpmcounter17,
            0xc12 => hpmcounter18, 0xc13 => hpmcounter19, 0xc14 => hpmcounter20,
            0xc15 => hpmcounter21, 0xc16 => hpmcounter22, 0xc17 => hpmcounter23,
            0xc18 => hpmcounter24, 0xc19 => hpmcounter25, 0xc1a => hpmcounter26,
            0xc1b => hpmcounter27, 0xc1c => hpmcounter28, 0xc1d => hpmcounter29,
            0xc1e => hpmcounter30, 0xc1f => hpmcounter31,
        ))
    }
}

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
pub static FIRMWARE: SbiPmu = SbiPmu;
#[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
pub static FIRMWARE: NoPmu = NoPmu;

/// 一个句柄到物理计数器的映射
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PmuMapping {
    pub valid: bool,
    pub event_code: usize,
    pub flags: usize,
    pub counter_idx: usize,
}

impl PmuMapping {
    const fn empty() -> Self {
        Self { valid: false, event_code: 0, flags: 0, counter_idx: 0 }
    }
}

/// 进程的计数器配置，受进程锁保护
#[derive(Debug)]
pub struct PmuState {
    maps: [PmuMapping; MAX_PMU_HANDLES],
    config_success_mask: usize,
    started_handles_mask: usize,
}

impl PmuState {
    pub const fn new() -> Self {
        Self {
            maps: [PmuMapping::empty(); MAX_PMU_HANDLES],
            config_success_mask: 0,
            started_handles_mask: 0,
        }
    }

    /// 登记句柄 `handle` 对应的物理计数器
    pub fn configure(&mut self, handle: usize, event_code: usize, flags: usize, counter_idx: usize) {
        assert!(handle < MAX_PMU_HANDLES, "pmu: handle {} out of range", handle);
        self.maps[handle] = PmuMapping { valid: true, event_code, flags, counter_idx };
        self.config_success_mask |= 1 << handle;
    }

    pub fn mapping(&self, handle: usize) -> Option<&PmuMapping> {
        self.maps.get(handle).filter(|m| m.valid)
    }

    /// 标记 `handles` 中的句柄为已启动，只接受配置成功的句柄
    pub fn mark_started(&mut self, handles: usize) {
        self.started_handles_mask |= handles & self.config_success_mask;
    }

    pub fn mark_stopped(&mut self, handles: usize) {
        self.started_handles_mask &= !handles;
    }

    pub fn started_handles(&self) -> usize {
        self.started_handles_mask
    }

    /// `handles` 中配置成功且有效的句柄所占用的物理计数器掩码
    pub fn physical_mask(&self, handles: usize) -> usize {
        let effective = handles & self.config_success_mask;
        self.maps
            .iter()
            .enumerate()
            .filter(|(handle, m)| effective & (1 << handle) != 0 && m.valid)
            .fold(0, |mask, (_, m)| mask | (1 << m.counter_idx))
    }

    /// 进程被切换进来之前：启动它已启动的计数器
    pub fn switch_in(&self, fw: &dyn PmuFirmware, pid: usize) {
        let mask = self.physical_mask(self.started_handles_mask);
        if mask != 0 {
            if let Err(err) = fw.counter_start(mask, false) {
                log::warn!("pmu: start {:#x} for pid {}: {}", mask, pid, err);
            }
        }
    }

    /// 进程被切换出去之后：暂停它的计数器，保留计数值
    pub fn switch_out(&self, fw: &dyn PmuFirmware, pid: usize) {
        let mask = self.physical_mask(self.started_handles_mask);
        if mask != 0 {
            if let Err(err) = fw.counter_stop(mask, false) {
                log::warn!("pmu: stop {:#x} for pid {}: {}", mask, pid, err);
            }
        }
    }

    /// 停止并清零所有已启动的计数器，清空配置
    pub fn clear(&mut self, fw: &dyn PmuFirmware) {
        let mask = self.physical_mask(self.started_handles_mask);
        if mask != 0 {
            if let Err(err) = fw.counter_stop(mask, true) {
                log::warn!("pmu: reset {:#x}: {}", mask, err);
            }
        }
        *self = Self::new();
    }
}

const WORD: usize = size_of::<u64>();

/// # 功能说明
/// `pmu_setup` 系统调用：按 `config_mask` 中的每个句柄，
/// 从用户数组 `codes[handle]`、`flags[handle]` 读出事件码和标志，
/// 请固件为它挑一个本次还没用过的物理计数器。
///
/// # 流程解释
/// 1. 先停止并清空进程原有的配置；`config_mask` 为 0 时到此为止；
/// 2. 固件没有计数器时直接返回 0；
/// 3. 按句柄从小到大配置，读用户内存失败、计数器用尽或固件拒绝时停止，
///    之前配置成功的句柄保留。
///
/// # 返回值
/// 配置成功的句柄掩码。
pub fn pmu_setup(
    fw: &dyn PmuFirmware,
    p: &Proc,
    config_mask: usize,
    codes: usize,
    flags: usize,
) -> Result<usize, ProcError> {
    p.excl.lock().pmu.clear(fw);
    if config_mask == 0 {
        return Ok(0);
    }

    let total = match fw.num_counters() {
        Ok(n) if n > 0 => n,
        _ => return Ok(0),
    };
    let all = if total >= usize::BITS as usize { !0 } else { (1 << total) - 1 };

    let pd = unsafe { p.data() };
    let mut allocated = 0usize;
    let mut success = 0usize;
    for handle in (0..MAX_PMU_HANDLES).filter(|&h| config_mask & (1 << h) != 0) {
        let mut event = [0u8; WORD];
        let mut flag = [0u8; WORD];
        if pd.copy_in(&mut event, codes + handle * WORD).is_err()
            || pd.copy_in(&mut flag, flags + handle * WORD).is_err()
        {
            log::warn!("pmu_setup: copy_in failed for handle {}", handle);
            break;
        }
        let (event, flag) = (u64::from_ne_bytes(event) as usize, u64::from_ne_bytes(flag) as usize);

        let available = all & !allocated;
        if available == 0 {
            log::warn!("pmu_setup: no physical counter left for handle {}", handle);
            break;
        }
        let idx = match fw.config_matching(available, flag, event) {
            Ok(idx) if idx < usize::BITS as usize => idx,
            Ok(idx) => {
                log::warn!("pmu_setup: firmware returned counter {} for handle {}", idx, handle);
                break;
            }
            Err(err) => {
                log::warn!("pmu_setup: config_matching for handle {}: {}", handle, err);
                break;
            }
        };

        allocated |= 1 << idx;
        p.excl.lock().pmu.configure(handle, event, flag, idx);
        success |= 1 << handle;
    }

    Ok(success)
}

/// # 功能说明
/// `pmu_control` 系统调用：对 `handles` 中的句柄执行 `action`。
///
/// # 流程解释
/// 1. `handles` 必须都是配置成功的句柄；
/// 2. 停止只作用于已启动的句柄，启动只作用于未启动的句柄，启动前清零；
/// 3. 读取时按句柄从小到大把计数值（8 字节）依次写到用户地址 `out`，
///    单个计数器读失败时跳过它的位置；
/// 4. 最后更新已启动句柄的记录。
///
/// # 返回值
/// 成功返回 0。句柄未配置或动作未知返回 `InvalidArgument`，
/// 写用户内存失败返回 `Vm`，固件启停失败返回 `Pmu`（已启动记录照常更新）。
pub fn pmu_control(
    fw: &dyn PmuFirmware,
    p: &Proc,
    action: usize,
    handles: usize,
    out: usize,
) -> Result<usize, ProcError> {
    let (effective, physical) = {
        let excl = p.excl.lock();
        if handles & !excl.pmu.config_success_mask != 0 {
            log::warn!("pmu_control: handles {:#x} not configured", handles);
            return Err(ProcError::InvalidArgument);
        }
        let started = excl.pmu.started_handles_mask;
        let effective = match action {
            PMU_ACTION_START => handles & !started,
            PMU_ACTION_STOP | PMU_ACTION_STOP_READ => handles & started,
            PMU_ACTION_READ => handles,
            _ => return Err(ProcError::InvalidArgument),
        };
        (effective, excl.pmu.physical_mask(effective))
    };

    let mut fw_result = Ok(());
    if matches!(action, PMU_ACTION_STOP | PMU_ACTION_STOP_READ) && physical != 0 {
        fw_result = fw_result.and(fw.counter_stop(physical, false));
    }

    if matches!(action, PMU_ACTION_READ | PMU_ACTION_STOP_READ) {
        let mut slot = 0;
        for handle in (0..MAX_PMU_HANDLES).filter(|&h| handles & (1 << h) != 0) {
            let idx = p.excl.lock().pmu.mapping(handle).map(|m| m.counter_idx);
            let value = match idx.map(|idx| fw.counter_read(idx)) {
                Some(Ok(value)) => value,
                _ => {
                    log::warn!("pmu_control: read failed for handle {}", handle);
                    slot += 1;
                    continue;
                }
            };
            unsafe { p.data_mut() }.copy_out(out + slot * WORD, &value.to_ne_bytes())?;
            slot += 1;
        }
    }

    if action == PMU_ACTION_START && physical != 0 {
        fw_result = fw_result.and(fw.counter_start(physical, true));
    }

    let mut excl = p.excl.lock();
    match action {
        PMU_ACTION_START => excl.pmu.mark_started(effective),
        PMU_ACTION_STOP | PMU_ACTION_STOP_READ => excl.pmu.mark_stopped(effective),
        _ => {}
    }
    drop(excl);

    fw_result.map(|()| 0).map_err(ProcError::from)
}
