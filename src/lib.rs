//! xv6 内核的磁盘块缓存层
//!
//! 位于块设备驱动与文件系统之间，保证每个磁盘块在内存中至多一份副本，
//! 并以自旋锁保护元数据、睡眠锁保护块数据。调度器与块设备驱动都是外部协作者，
//! 分别通过 [`process::Scheduler`] 与 [`driver::BlockDevice`] 接入。

#![cfg_attr(not(test), no_std)]
#![warn(rust_2018_idioms)]

#[macro_use]
extern crate log;

pub mod consts;
pub mod driver;
pub mod fs;
pub mod process;
pub mod sleeplock;
pub mod spinlock;

pub use driver::{BlockDevice, DiskError};
pub use fs::{Bcache, Buf, BCACHE};
