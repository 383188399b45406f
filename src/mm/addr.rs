//! 提供物理地址与虚拟地址包装

use core::convert::TryFrom;
use core::fmt;
use core::ops::{Add, Sub};
use core::result::Result;

use crate::consts::{ConstAddr, MAXVA, PGMASK, PGMASKLEN, PGSHIFT, PGSIZE};

use super::VmError;

/// 物理地址与虚拟地址的公共操作
pub trait Addr {
    fn data_ref(&self) -> &usize;

    fn data_mut(&mut self) -> &mut usize;

    #[inline]
    fn pg_round_up(&mut self) {
        *self.data_mut() = (*self.data_mut() + PGSIZE - 1) & !(PGSIZE - 1)
    }

    #[inline]
    fn pg_round_down(&mut self) {
        *self.data_mut() = *self.data_mut() & !(PGSIZE - 1)
    }

    #[inline]
    fn add_page(&mut self) {
        *self.data_mut() += PGSIZE;
    }

    #[inline]
    fn as_usize(&self) -> usize {
        *self.data_ref()
    }

    #[inline]
    fn as_ptr(&self) -> *const u8 {
        *self.data_ref() as *const u8
    }

    #[inline]
    fn as_mut_ptr(&mut self) -> *mut u8 {
        *self.data_mut() as *mut u8
    }
}

/// 按页对齐的物理地址。内核对物理内存做恒等映射，所以它也可以直接当指针用。
#[repr(C)]
#[derive(Copy, Clone, Eq, PartialEq, PartialOrd, Ord)]
pub struct PhysAddr(usize);

impl Addr for PhysAddr {
    #[inline]
    fn data_ref(&self) -> &usize {
        &self.0
    }

    #[inline]
    fn data_mut(&mut self) -> &mut usize {
        &mut self.0
    }
}

impl PhysAddr {
    /// # 安全性
    /// `raw` 必须按页对齐。
    #[inline]
    pub const unsafe fn from_raw(raw: usize) -> Self {
        Self(raw)
    }

    #[inline]
    pub fn into_raw(self) -> usize {
        self.0
    }
}

impl TryFrom<usize> for PhysAddr {
    type Error = &'static str;

    fn try_from(addr: usize) -> Result<Self, Self::Error> {
        if addr % PGSIZE != 0 {
            return Err("PhysAddr addr not aligned");
        }
        Ok(PhysAddr(addr))
    }
}

impl From<ConstAddr> for PhysAddr {
    fn from(const_addr: ConstAddr) -> Self {
        Self(const_addr.into())
    }
}

impl fmt::Debug for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysAddr({:#x})", self.0)
    }
}

/// 虚拟地址，不超过 [`MAXVA`]
#[repr(C)]
#[derive(Copy, Clone, Eq, PartialEq, PartialOrd, Ord)]
pub struct VirtAddr(usize);

impl Addr for VirtAddr {
    #[inline]
    fn data_ref(&self) -> &usize {
        &self.0
    }

    #[inline]
    fn data_mut(&mut self) -> &mut usize {
        &mut self.0
    }
}

impl VirtAddr {
    #[inline]
    pub fn into_raw(self) -> usize {
        self.0
    }

    /// 第 `level` 级页表中的 9 位索引
    #[inline]
    pub fn page_num(&self, level: usize) -> usize {
        (self.0 >> (PGSHIFT + level * PGMASKLEN)) & PGMASK
    }

    /// 此地址能否被页表翻译（严格小于 MAXVA）
    #[inline]
    pub fn is_translatable(&self) -> bool {
        self.0 < usize::from(MAXVA)
    }
}

impl TryFrom<usize> for VirtAddr {
    type Error = VmError;

    fn try_from(addr: usize) -> Result<Self, Self::Error> {
        if addr > MAXVA.into() {
            Err(VmError::VaTooLarge(addr))
        } else {
            Ok(Self(addr))
        }
    }
}

impl From<ConstAddr> for VirtAddr {
    fn from(const_addr: ConstAddr) -> Self {
        Self(const_addr.into())
    }
}

impl fmt::Debug for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtAddr({:#x})", self.0)
    }
}

impl Add<usize> for VirtAddr {
    type Output = Self;

    fn add(self, off: usize) -> Self {
        Self(self.0 + off)
    }
}

impl Sub for VirtAddr {
    type Output = usize;

    fn sub(self, other: Self) -> usize {
        self.0 - other.0
    }
}
