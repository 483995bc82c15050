//! 内存盘：以内存数组模拟的块设备，用于启动早期与测试。

use array_macro::array;

use core::sync::atomic::{AtomicUsize, Ordering};

use crate::consts::fs::BSIZE;
use crate::fs::Buf;
use crate::spinlock::SpinLock;
use super::{BlockDevice, DiskError};

/// 容量为 `N` 个块、只服务于设备号 `dev` 的内存盘。
///
/// 记录读写次数，便于观察缓存命中情况。
pub struct RamDisk<const N: usize> {
    dev: u32,
    blocks: SpinLock<[[u8; BSIZE]; N]>,
    reads: AtomicUsize,
    writes: AtomicUsize,
}

impl<const N: usize> RamDisk<N> {
    pub const fn new(dev: u32) -> Self {
        Self {
            dev,
            blocks: SpinLock::new(array![_ => [0; BSIZE]; N], "ramdisk"),
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
        }
    }

    /// 从设备读取次数
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::Relaxed)
    }

    /// 向设备写入次数
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::Relaxed)
    }

    /// 绕过缓存直接查看磁盘上的块内容。
    pub fn peek(&self, blockno: u32, out: &mut [u8; BSIZE]) -> Result<(), DiskError> {
        let i = self.locate(self.dev, blockno)?;
        out.copy_from_slice(&self.blocks.lock()[i]);
        Ok(())
    }

    /// 绕过缓存直接改写磁盘上的块内容。
    pub fn poke(&self, blockno: u32, src: &[u8; BSIZE]) -> Result<(), DiskError> {
        let i = self.locate(self.dev, blockno)?;
        self.blocks.lock()[i].copy_from_slice(src);
        Ok(())
    }

    fn locate(&self, dev: u32, blockno: u32) -> Result<usize, DiskError> {
        if dev != self.dev {
            return Err(DiskError::NoDevice);
        }
        let i = blockno as usize;
        if i >= N {
            return Err(DiskError::OutOfRange);
        }
        Ok(i)
    }
}

impl<const N: usize> BlockDevice for RamDisk<N> {
    fn rw(&self, buf: &mut Buf<'_>, writing: bool) -> Result<(), DiskError> {
        let i = self.locate(buf.read_dev(), buf.read_blockno())?;
        let mut blocks = self.blocks.lock();
        if writing {
            blocks[i].copy_from_slice(buf.data());
            self.writes.fetch_add(1, Ordering::Relaxed);
        } else {
            buf.data_mut().copy_from_slice(&blocks[i]);
            self.reads.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }
}
