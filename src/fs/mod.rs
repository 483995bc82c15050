//! 文件系统模块
//!
//! 目前只包含位于块设备之上的缓存层，
//! 索引节点、目录与日志层通过 [`BCACHE`] 访问磁盘块。

mod bio;

pub use bio::{hash, Bcache, Buf, BufData, BufStat, BCACHE};
