//! 缓存层
//!
//! 缓冲区缓存位于块设备与文件系统之间，保证每个磁盘块在内存中至多一份副本，
//! 并串行化对这份副本的访问。
//!
//! 元数据按 `(dev, blockno)` 的哈希分散在若干个桶中，每个桶由各自的自旋锁保护，
//! 命中路径只需锁住一个桶。未命中时持有目标桶锁，对其他桶只做非阻塞的尝试加锁，
//! 选出全池最久未使用的空闲缓冲块迁入目标桶，因此不需要全局锁，也不需要全局的加锁顺序。
//!
//! 使用方式：
//! * 通过 [`Bcache::bread`] 获取某个磁盘块的缓冲块；
//! * 修改数据后调用 [`Buf::bwrite`] 写回磁盘；
//! * 用完后丢弃 [`Buf`]（或调用 [`Buf::brelse`]），之后不得再访问；
//! * 同一时刻只有一个进程能使用某个缓冲块，所以不要长时间持有。

mod bucket;

use array_macro::array;

use core::hint;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::consts::fs::{self, BSIZE, HASH_K};
use crate::driver::{BlockDevice, DiskError};
use crate::sleeplock::{SleepLock, SleepLockGuard};
use crate::spinlock::SpinLock;
use bucket::Bucket;

pub static BCACHE: Bcache = Bcache::new();

/// 计算 `(dev, blockno)` 所在的桶。
///
/// 所有需要定位桶的地方都必须使用同一个函数。
#[inline]
pub const fn hash(dev: u32, blockno: u32, nbuckets: usize) -> usize {
    (dev as usize)
        .wrapping_mul(HASH_K)
        .wrapping_add(blockno as usize)
        % nbuckets
}

/// 全局缓冲区缓存（Buffer Cache）结构体，用于块设备的读写缓存。
///
/// `Bcache` 提供了一个固定大小（`NBUF` 个）的内存缓冲块池，
/// 元数据分布在 `NBUCKETS` 个哈希桶中。缓冲块的数量与桶的数量在编译期确定，
/// 运行期间不会改变；缓冲块只会在桶之间迁移。
///
/// 该结构通常在内核初始化阶段通过 [`binit`](Self::binit) 初始化，
/// 并贯穿操作系统运行期间，是文件系统与块设备驱动之间的关键缓冲层。
pub struct Bcache<const NBUF: usize = { fs::NBUF }, const NBUCKETS: usize = { fs::NBUCKETS }> {
    /// 哈希桶，每个桶的自旋锁保护其链表以及链上缓冲块的
    /// 身份、引用计数与最近使用时间。
    buckets: [SpinLock<Bucket<NBUF>>; NBUCKETS],

    /// 缓冲块的数据部分，下标与桶中的控制表项一一对应。
    bufs: [BufInner; NBUF],

    /// 逻辑时钟，每次获取或释放缓冲块时前进。
    ticks: AtomicUsize,

    /// 由 `binit` 注册的块设备。
    disk: SpinLock<Option<&'static dyn BlockDevice>>,
}

/// 未命中时的回收候选。
#[derive(Clone, Copy)]
struct Candidate {
    bucket: usize,
    index: usize,
    ticks: usize,
}

impl<const NBUF: usize, const NBUCKETS: usize> Bcache<NBUF, NBUCKETS> {
    pub const fn new() -> Self {
        Self {
            buckets: array![_ => SpinLock::new(Bucket::new(), "bcache.bucket"); NBUCKETS],
            bufs: array![_ => BufInner::new(); NBUF],
            ticks: AtomicUsize::new(0),
            disk: SpinLock::new(None, "bcache.disk"),
        }
    }

    /// 初始化缓冲区缓存。
    ///
    /// # 功能说明
    /// 注册块设备，并把全部缓冲块挂到 0 号桶上。此后缓冲块随着回收
    /// 在各个桶之间重新分布。该函数应仅在系统启动时调用一次。
    ///
    /// # 可能的错误
    /// - 重复调用会 panic（`"binit twice"`）；
    /// - 桶的数量为 0 时 panic。
    pub fn binit(&self, disk: &'static dyn BlockDevice) {
        assert!(NBUCKETS > 0, "binit: no buckets");

        let mut guard = self.disk.lock();
        if guard.is_some() {
            panic!("binit twice");
        }
        *guard = Some(disk);
        drop(guard);

        let mut bucket = self.buckets[0].lock();
        for i in 0..NBUF {
            bucket.push_front(i, bucket::blank());
        }
        drop(bucket);

        #[cfg(feature = "verbose_init_info")]
        info!("bcache: {} bufs of {} bytes in {} buckets", NBUF, BSIZE, NBUCKETS);
    }

    /// 获取指定设备与块号对应的缓冲块，返回时已持有其睡眠锁。
    ///
    /// # 功能说明
    /// 若缓存命中，则返回已存在的缓冲块；否则回收全池最久未使用的空闲缓冲块，
    /// 将其分配给新请求。该函数不涉及磁盘读写，调用者需通过
    /// [`Buf::is_valid`] 判断是否需要从磁盘加载数据，或直接使用 [`bread`](Self::bread)。
    ///
    /// # 流程解释
    /// - 调用 `claim` 在桶锁的保护下定位或回收缓冲块，并把引用计数加一；
    /// - 回收扫描因其他 hart 占用桶锁而不完整时，`claim` 放弃本轮，从头重试；
    /// - 不持有任何桶锁后，再等待缓冲块的睡眠锁。
    ///
    /// # 可能的错误
    /// - 所有缓冲块都被引用时触发 panic（`"bget: no buffers"`）。
    pub fn bget(&self, dev: u32, blockno: u32) -> Buf<'_> {
        loop {
            if let Some(index) = self.claim(dev, blockno) {
                let inner = &self.bufs[index];
                return Buf {
                    index,
                    dev,
                    blockno,
                    owner: self,
                    valid: &inner.valid,
                    data: Some(inner.data.lock()),
                };
            }
            #[cfg(feature = "kernel_warning")]
            warn!("bget: scan for ({}, {}) contended, retrying", dev, blockno);
            hint::spin_loop();
        }
    }

    /// 定位或回收 `(dev, blockno)` 的缓冲块，成功时返回其下标，引用计数已加一。
    ///
    /// # 流程解释
    /// 1. 锁住目标桶并查找，命中则直接返回；
    /// 2. 未命中时不释放目标桶锁，它将容纳结果。从目标桶开始循环地访问每个桶恰好一次：
    ///    目标桶直接检查，其他桶只尝试加锁，失败则跳过并记下本轮扫描不完整；
    ///    检查完一个外部桶立即释放其锁，所以任何时刻至多持有两把桶锁；
    /// 3. 在所有检查过的桶中记下时钟值最小的空闲缓冲块；
    /// 4. 候选在外部桶时，再次尝试锁住该桶并确认候选仍在桶中且未被引用，
    ///    然后将其摘下、释放该桶，再挂到目标桶的链表头部；
    /// 5. 重设身份、有效位、引用计数与时钟值后释放目标桶锁。
    ///
    /// # 返回值
    /// - `Some(index)`：缓冲块下标；
    /// - `None`：扫描受到竞争或候选失效，目标桶锁已释放，调用者应重试。
    ///
    /// # 可能的错误
    /// - 一轮不受竞争的完整扫描都找不到空闲缓冲块时 panic。
    fn claim(&self, dev: u32, blockno: u32) -> Option<usize> {
        let key = hash(dev, blockno, NBUCKETS);
        let mut target = self.buckets[key].lock();

        if let Some(index) = target.find(dev, blockno) {
            let b = target.get_mut(index);
            b.refcnt += 1;
            b.ticks = self.tick();
            trace!("bget: hit ({}, {}) in buf {}", dev, blockno, index);
            return Some(index);
        }

        let mut best: Option<Candidate> = None;
        let mut contended = false;
        for step in 0..NBUCKETS {
            let i = (key + step) % NBUCKETS;
            let found = if i == key {
                target.lru_unused()
            } else {
                match self.buckets[i].try_lock() {
                    Some(bucket) => bucket.lru_unused(),
                    None => {
                        contended = true;
                        None
                    }
                }
            };
            if let Some((index, ticks)) = found {
                if best.map_or(true, |c| ticks < c.ticks) {
                    best = Some(Candidate { bucket: i, index, ticks });
                }
            }
        }

        let victim = match best {
            Some(c) => c,
            None if contended => return None,
            None => panic!("bget: no buffers"),
        };

        if victim.bucket != key {
            let mut src = self.buckets[victim.bucket].try_lock()?;
            if !src.is_unused(victim.index) {
                return None;
            }
            src.unlink(victim.index);
            drop(src);
            target.push_front(victim.index, bucket::blank());
            trace!("bget: move buf {} from bucket {} to {}", victim.index, victim.bucket, key);
        }

        let ticks = self.tick();
        target.assign(victim.index, dev, blockno, ticks);
        self.bufs[victim.index].valid.store(false, Ordering::Relaxed);
        drop(target);
        trace!("bget: miss ({}, {}) recycles buf {}", dev, blockno, victim.index);
        Some(victim.index)
    }

    /// 从缓冲区缓存中读取指定设备与块号对应的数据。
    ///
    /// # 功能说明
    /// 若缓冲块未被标记为有效（即未曾从磁盘加载），则会触发一次同步的磁盘读取。
    /// 睡眠锁保证同一个块的并发首次读取中只有一个真正访问磁盘，
    /// 其余的进程醒来时看到的已是有效数据。
    ///
    /// # 返回值
    /// - `Ok(buf)`：包含指定块数据的缓冲块，仍持有睡眠锁；
    /// - `Err(e)`：磁盘读取失败，缓冲块保持无效并已被释放。
    pub fn bread(&self, dev: u32, blockno: u32) -> Result<Buf<'_>, DiskError> {
        let mut b = self.bget(dev, blockno);
        if !b.is_valid() {
            self.device().rw(&mut b, false)?;
            b.valid.store(true, Ordering::Relaxed);
            debug!("bread: fill ({}, {}) into buf {}", dev, blockno, b.index);
        }
        Ok(b)
    }

    /// 不改变任何状态地查看 `(dev, blockno)` 是否驻留在缓存中。
    pub fn stat(&self, dev: u32, blockno: u32) -> Option<BufStat> {
        let key = hash(dev, blockno, NBUCKETS);
        let bucket = self.buckets[key].lock();
        bucket.find(dev, blockno)
            .map(|index| self.stat_of(key, &bucket, index))
    }

    /// 逐桶遍历所有代表某个块的缓冲块。
    ///
    /// 回调在持有桶锁时执行，不得阻塞，也不得再调用本缓存的任何方法。
    /// 遍历期间其他 hart 可能在桶之间迁移缓冲块，只有静止状态下的结果才是全池快照。
    pub fn for_each_resident(&self, mut f: impl FnMut(u32, u32, &BufStat)) {
        for (key, lock) in self.buckets.iter().enumerate() {
            let bucket = lock.lock();
            for index in bucket.iter() {
                if let Some((dev, blockno)) = bucket.get(index).key {
                    f(dev, blockno, &self.stat_of(key, &bucket, index));
                }
            }
        }
    }

    /// 每个桶当前挂着的缓冲块数量。
    pub fn occupancy(&self) -> [usize; NBUCKETS] {
        let mut out = [0; NBUCKETS];
        for (n, lock) in out.iter_mut().zip(self.buckets.iter()) {
            *n = lock.lock().len();
        }
        out
    }

    fn stat_of(&self, key: usize, bucket: &Bucket<NBUF>, index: usize) -> BufStat {
        let b = bucket.get(index);
        BufStat {
            index,
            bucket: key,
            refcnt: b.refcnt,
            ticks: b.ticks,
            valid: self.bufs[index].valid.load(Ordering::Relaxed),
        }
    }

    fn tick(&self) -> usize {
        self.ticks.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn device(&self) -> &'static dyn BlockDevice {
        match *self.disk.lock() {
            Some(disk) => disk,
            None => panic!("bcache: no disk"),
        }
    }
}

impl<const NBUF: usize, const NBUCKETS: usize> Default for Bcache<NBUF, NBUCKETS> {
    fn default() -> Self {
        Self::new()
    }
}

/// `Buf` 归还缓冲块时需要的缓存操作，与缓存的容量参数无关。
trait BufOwner: Sync {
    fn brelse(&self, index: usize, dev: u32, blockno: u32);
    fn bpin(&self, index: usize, dev: u32, blockno: u32);
    fn bunpin(&self, index: usize, dev: u32, blockno: u32);
    fn disk(&self) -> &'static dyn BlockDevice;
}

impl<const NBUF: usize, const NBUCKETS: usize> BufOwner for Bcache<NBUF, NBUCKETS> {
    /// 释放一个引用并刷新最近使用时间。
    /// 引用计数归零后缓冲块可被回收，但数据保留，以便再次命中。
    fn brelse(&self, index: usize, dev: u32, blockno: u32) {
        let mut bucket = self.buckets[hash(dev, blockno, NBUCKETS)].lock();
        let ticks = self.tick();
        let b = bucket.get_mut(index);
        debug_assert_eq!(b.key, Some((dev, blockno)));
        b.refcnt = match b.refcnt.checked_sub(1) {
            Some(rc) => rc,
            None => panic!("brelse: refcnt"),
        };
        b.ticks = ticks;
    }

    fn bpin(&self, index: usize, dev: u32, blockno: u32) {
        let mut bucket = self.buckets[hash(dev, blockno, NBUCKETS)].lock();
        bucket.get_mut(index).refcnt += 1;
    }

    /// 调用者自身还持有一个引用，所以引用计数至少为 2。
    fn bunpin(&self, index: usize, dev: u32, blockno: u32) {
        let mut bucket = self.buckets[hash(dev, blockno, NBUCKETS)].lock();
        let b = bucket.get_mut(index);
        if b.refcnt <= 1 {
            panic!("buf unpin not match");
        }
        b.refcnt -= 1;
    }

    fn disk(&self) -> &'static dyn BlockDevice {
        self.device()
    }
}

/// 缓冲块在某一时刻的元数据快照。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufStat {
    /// 缓冲块在池中的下标
    pub index: usize,
    /// 所在的桶
    pub bucket: usize,
    pub refcnt: usize,
    /// 最近使用时间
    pub ticks: usize,
    pub valid: bool,
}

/// 已获取的缓冲块，代表一个特定的 `(dev, blockno)`。
///
/// 持有其数据的睡眠锁，并在生命周期结束时释放睡眠锁、归还引用。
pub struct Buf<'a> {
    /// 缓冲块在池中的下标。
    index: usize,

    /// 缓冲块对应的设备编号。
    dev: u32,

    /// 缓冲块在设备中的逻辑块号。
    blockno: u32,

    owner: &'a dyn BufOwner,

    valid: &'a AtomicBool,

    /// 缓冲数据的睡眠锁保护访问器。
    ///
    /// 在 `Buf` 生命周期内保证始终为 `Some`，
    /// 在 `Drop` 中先取出释放睡眠锁，再归还引用。
    data: Option<SleepLockGuard<'a, BufData>>,
}

impl<'a> Buf<'a> {
    pub fn read_dev(&self) -> u32 {
        self.dev
    }

    pub fn read_blockno(&self) -> u32 {
        self.blockno
    }

    /// 缓冲块在池中的下标。
    pub fn index(&self) -> usize {
        self.index
    }

    /// 数据是否已反映磁盘内容。
    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Relaxed)
    }

    /// 当前进程是否持有该缓冲块的睡眠锁。
    pub fn holding(&self) -> bool {
        self.data.as_ref().map_or(false, |guard| guard.holding())
    }

    /// 将缓冲块内容同步写回磁盘。
    ///
    /// 不改变引用计数与有效位，也不释放睡眠锁。
    ///
    /// # 可能的错误
    /// - 当前进程未持有睡眠锁时 panic（`"bwrite"`）；
    /// - 磁盘写入失败时返回 [`DiskError`]。
    pub fn bwrite(&mut self) -> Result<(), DiskError> {
        if !self.holding() {
            panic!("bwrite");
        }
        let disk = self.owner.disk();
        disk.rw(self, true)?;
        debug!("bwrite: ({}, {}) from buf {}", self.dev, self.blockno, self.index);
        Ok(())
    }

    /// 显式释放缓冲块，与直接丢弃等价，但会先检查当前进程持有睡眠锁。
    pub fn brelse(self) {
        if !self.holding() {
            panic!("brelse");
        }
        drop(self);
    }

    /// 将引用计数加一，“钉住”该块，防止其在释放后被回收。
    ///
    /// # 功能说明
    /// 钉住的缓冲块可以跨越多次独立的获取与释放而常驻缓存，
    /// 常用于日志层在事务提交前保留被修改的块。需与 `unpin` 配对使用。
    pub fn pin(&self) {
        self.owner.bpin(self.index, self.dev, self.blockno);
    }

    /// 将引用计数减一，解除一次钉住。
    ///
    /// 必须与 `pin` 配对调用，否则 panic（`"buf unpin not match"`）。
    pub fn unpin(&self) {
        self.owner.bunpin(self.index, self.dev, self.blockno);
    }

    pub fn data(&self) -> &[u8; BSIZE] {
        match self.data.as_ref() {
            Some(guard) => &guard.0,
            None => panic!("buf: data released"),
        }
    }

    pub fn data_mut(&mut self) -> &mut [u8; BSIZE] {
        match self.data.as_mut() {
            Some(guard) => &mut guard.0,
            None => panic!("buf: data released"),
        }
    }

    /// 提供指向缓冲区数据的原始常量指针，供上层按磁盘结构解释。
    pub fn raw_data(&self) -> *const BufData {
        match self.data.as_ref() {
            Some(guard) => &**guard as *const BufData,
            None => panic!("buf: data released"),
        }
    }

    /// 提供指向缓冲区数据的原始可变指针。
    pub fn raw_data_mut(&mut self) -> *mut BufData {
        match self.data.as_mut() {
            Some(guard) => &mut **guard as *mut BufData,
            None => panic!("buf: data released"),
        }
    }
}

impl<'a> Drop for Buf<'a> {
    fn drop(&mut self) {
        drop(self.data.take());
        self.owner.brelse(self.index, self.dev, self.blockno);
    }
}

/// 缓冲块的数据部分，包含实际的磁盘块内容及其有效性标志。
struct BufInner {
    /// 标志该缓冲块的数据是否有效。
    ///
    /// 由 `claim` 在持有目标桶锁、且无人引用该缓冲块时清除，
    /// 由 `bread` 在持有睡眠锁时设置。
    valid: AtomicBool,

    /// 缓冲块的实际数据，受睡眠锁保护。
    data: SleepLock<BufData>,
}

impl BufInner {
    const fn new() -> Self {
        Self {
            valid: AtomicBool::new(false),
            data: SleepLock::new(BufData::new(), "buffer"),
        }
    }
}

/// BufData 的对齐方式应足以满足可能由此结构体转换而来的其他结构体的需求。
#[repr(C, align(8))]
pub struct BufData([u8; BSIZE]);

impl BufData {
    const fn new() -> Self {
        Self([0; BSIZE])
    }
}

impl Deref for BufData {
    type Target = [u8; BSIZE];

    fn deref(&self) -> &[u8; BSIZE] {
        &self.0
    }
}

impl DerefMut for BufData {
    fn deref_mut(&mut self) -> &mut [u8; BSIZE] {
        &mut self.0
    }
}
