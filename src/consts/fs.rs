//! 缓存层与磁盘块相关的常量

/// 磁盘块大小（字节）
pub const BSIZE: usize = 1024;

/// 缓冲区缓存中缓冲块的数量
pub const NBUF: usize = 30;

/// 哈希桶的数量，与缓冲块数量无关。
/// 取素数以让连续块号均匀散布。
pub const NBUCKETS: usize = 13;

/// 哈希时设备号的乘数，
/// 需足够大，使不同设备的较小块号不会落入相同的槽位序列。
pub const HASH_K: usize = 10000;
