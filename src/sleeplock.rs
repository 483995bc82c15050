//! 睡眠锁模块
//! 提供基于进程休眠/唤醒机制的同步原语，适用于可能长时间持有的锁。
//!
//! 当锁被占用时，尝试获取锁的进程会进入休眠状态，避免忙等待。

use core::ops::{Deref, DerefMut, Drop};
use core::cell::{Cell, UnsafeCell};

use crate::process::{self, my_pid};
use crate::spinlock::SpinLock;

/// 睡眠锁结构，提供阻塞式同步机制
///
/// 与自旋锁不同，当锁被占用时，尝试获取的进程会进入休眠状态，
/// 直到锁被释放后被唤醒。这避免了忙等待，适用于可能长时间持有的锁，
/// 例如跨越一次磁盘 I/O 的缓冲块数据。
///
/// # 字段说明
/// - `lock`: 内部自旋锁，保护`locked`与`pid`
/// - `locked`: 表示锁是否已被占用
/// - `pid`: 持有者的进程标识，仅在`locked`为真时有意义
/// - `name`: 锁的标识名称，用于调试
/// - `data`: 被保护的数据，通过`UnsafeCell`实现内部可变性
pub struct SleepLock<T: ?Sized> {
    lock: SpinLock<()>,
    locked: Cell<bool>,
    pid: Cell<usize>,
    name: &'static str,
    data: UnsafeCell<T>,
}

// locked 与 pid 只在持有内部自旋锁时访问
unsafe impl<T: ?Sized + Send> Sync for SleepLock<T> {}

impl<T> SleepLock<T> {
    pub const fn new(data: T, name: &'static str) -> Self {
        Self {
            lock: SpinLock::new((), "sleeplock"),
            locked: Cell::new(false),
            pid: Cell::new(0),
            name,
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> SleepLock<T> {
    /// 获取睡眠锁（可能阻塞进程）
    ///
    /// # 流程解释
    /// 1. 获取内部自旋锁保护临界区
    /// 2. 检查`locked`状态：
    ///   - 如果已锁定：调用`sleep()`让当前进程休眠，醒来后重新获取内部锁并复查
    ///   - 如果未锁定：设置`locked=true`、记录持有者并返回守卫
    /// 3. 释放内部自旋锁（因已设置locked状态）
    ///
    /// # 注意
    /// 调用者不得持有任何自旋锁，否则睡眠期间其他 hart 可能永远拿不到那把自旋锁。
    pub fn lock(&self) -> SleepLockGuard<'_, T> {
        let mut guard = self.lock.lock();

        while self.locked.get() {
            process::sleep(self.channel(), guard);
            guard = self.lock.lock();
        }

        self.locked.set(true);
        self.pid.set(my_pid());
        drop(guard);

        SleepLockGuard {
            lock: self,
            data: unsafe { &mut *self.data.get() }
        }
    }

    /// 当前进程是否持有此睡眠锁。
    pub fn holding(&self) -> bool {
        let guard = self.lock.lock();
        let r = self.locked.get() && self.pid.get() == my_pid();
        drop(guard);
        r
    }

    fn unlock(&self) {
        let guard = self.lock.lock();
        self.locked.set(false);
        self.pid.set(0);
        process::wakeup(self.channel());
        drop(guard);
    }

    /// 睡眠与唤醒使用的通道：`locked` 字段的地址。
    fn channel(&self) -> usize {
        self.locked.as_ptr() as usize
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// 睡眠锁守卫，提供对受保护数据的访问
///
/// 当守卫存在时，表示锁已被持有。
/// 守卫离开作用域时自动释放锁，并唤醒等待者。
pub struct SleepLockGuard<'a, T: ?Sized> {
    lock: &'a SleepLock<T>,
    data: &'a mut T,
}

impl<'a, T: ?Sized> SleepLockGuard<'a, T> {
    pub fn holding(&self) -> bool {
        self.lock.holding()
    }
}

impl<'a, T: ?Sized> Deref for SleepLockGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &*self.data
    }
}

impl<'a, T: ?Sized> DerefMut for SleepLockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut *self.data
    }
}

impl<'a, T: ?Sized> Drop for SleepLockGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use std::thread;
    use std::vec::Vec;

    use super::*;
    use crate::process::host;

    #[test]
    fn holder_is_recorded() {
        host::init();
        let l = SleepLock::new(7u8, "holder");
        assert!(!l.holding());
        let g = l.lock();
        assert!(g.holding());
        thread::scope(|s| {
            s.spawn(|| assert!(!l.holding()));
        });
        drop(g);
        assert!(!l.holding());
    }

    #[test]
    fn waiters_are_serialized() {
        host::init();
        let l = SleepLock::new(Vec::new(), "serial");
        thread::scope(|s| {
            for t in 0..4usize {
                let l = &l;
                s.spawn(move || {
                    for i in 0..50usize {
                        let mut g = l.lock();
                        // 持锁期间没有其他进程插入
                        let before = g.len();
                        g.push((t, i));
                        thread::yield_now();
                        assert_eq!(g.len(), before + 1);
                    }
                });
            }
        });
        assert_eq!(l.lock().len(), 200);
    }
}
