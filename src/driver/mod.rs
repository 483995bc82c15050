//! 块设备驱动接口
//!
//! 缓存层只通过 [`BlockDevice`] 与磁盘交互，
//! 具体驱动（virtio 磁盘、内存盘等）由内核在启动时接入。

use core::fmt;

use crate::fs::Buf;

pub mod ramdisk;

pub use ramdisk::RamDisk;

/// 块设备驱动需要实现的读写接口。
pub trait BlockDevice: Sync {
    /// 按缓冲块记录的 `(dev, blockno)` 同步读写一个块。
    ///
    /// # 功能说明
    /// - `writing == false`：把磁盘上的块读入 `buf` 的数据区；
    /// - `writing == true`：把 `buf` 的数据区写回磁盘。
    ///
    /// 调用期间当前进程可能被阻塞，直到传输完成。
    /// 调用者持有该缓冲块的睡眠锁，且不持有任何自旋锁。
    ///
    /// # 可能的错误
    /// 传输失败时返回 [`DiskError`]，缓存层不重试，原样交给上层。
    fn rw(&self, buf: &mut Buf<'_>, writing: bool) -> Result<(), DiskError>;
}

/// 块设备传输失败的原因。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskError {
    /// 设备报告 I/O 错误
    Io,
    /// 块号超出设备容量
    OutOfRange,
    /// 设备号不属于该驱动
    NoDevice,
}

impl fmt::Display for DiskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiskError::Io => f.write_str("disk i/o error"),
            DiskError::OutOfRange => f.write_str("block number out of range"),
            DiskError::NoDevice => f.write_str("no such device"),
        }
    }
}
