//! 自旋锁模块
//! 自旋锁将数据包裹在自身内部以保护这些数据。

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut, Drop};
use core::sync::atomic::{fence, AtomicBool, AtomicIsize, Ordering};

use crate::process::{cpu_id, pop_off, push_off};

/// 表示一个自旋锁结构，用于在多核环境下保护共享数据。
///
/// `SpinLock` 提供了互斥访问内部数据的能力，通过忙等待（busy-waiting）实现锁机制。
/// 当锁被占用时，尝试获取锁的CPU将在循环中等待，直到锁被释放。
/// 该锁还跟踪持有锁的CPU ID，用于检测重入。
///
/// # 字段说明
/// - `lock`: 原子布尔值，表示锁的状态（`false`=未锁定，`true`=已锁定）；
/// - `name`: 锁的名称，用于调试和标识；
/// - `cpuid`: 当前持有锁的CPU ID（-1表示无CPU持有）；
/// - `data`: 被保护的数据，通过`UnsafeCell`实现内部可变性。
#[derive(Debug)]
pub struct SpinLock<T: ?Sized> {
    lock: AtomicBool,
    name: &'static str,
    cpuid: AtomicIsize,
    data: UnsafeCell<T>,
}

// 为SpinLock实现Sync trait，允许跨线程共享（要求T是Send）
unsafe impl<T: ?Sized + Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// 创建一个新的自旋锁实例。
    pub const fn new(data: T, name: &'static str) -> Self {
        Self {
            lock: AtomicBool::new(false),
            name,
            cpuid: AtomicIsize::new(-1),
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> SpinLock<T> {
    /// 获取自旋锁并返回一个守卫对象。
    ///
    /// # 功能说明
    /// 通过忙等待获取锁的所有权，返回一个守卫对象。
    /// 守卫对象实现了`Deref`和`DerefMut`，允许直接访问被保护数据。
    /// 当守卫对象离开作用域时，自动释放锁。
    ///
    /// # 流程解释
    /// 1. 调用`push_off()`禁用中断（防止死锁）；
    /// 2. 检查是否已持有锁（重入即 panic）；
    /// 3. 通过原子操作忙等待直到获取锁；
    /// 4. 设置内存屏障确保操作顺序；
    /// 5. 记录当前CPU ID；
    /// 6. 返回守卫对象。
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        self.acquire();
        SpinLockGuard {
            lock: self,
            data: unsafe { &mut *self.data.get() },
        }
    }

    /// 尝试获取自旋锁，不等待。
    ///
    /// # 功能说明
    /// 与 [`lock`](Self::lock) 不同，锁已被任何 hart（包括当前 hart）持有时
    /// 立即返回 `None`，而不是自旋或 panic。
    /// 缓存层在跨桶扫描时依赖它避免锁顺序环路。
    ///
    /// # 返回值
    /// - `Some(guard)`：成功获取；
    /// - `None`：锁正被持有。
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        push_off();
        if self.holding() {
            pop_off();
            return None;
        }
        if self.lock.compare_exchange(false, true,
            Ordering::Acquire, Ordering::Relaxed).is_err() {
            pop_off();
            return None;
        }
        fence(Ordering::SeqCst);
        self.cpuid.store(cpu_id() as isize, Ordering::Relaxed);
        Some(SpinLockGuard {
            lock: self,
            data: unsafe { &mut *self.data.get() },
        })
    }

    /// 检查当前CPU是否持有此锁。
    ///
    /// # 前提条件
    /// - 中断必须已禁用（由`push_off`保证），否则结果可能随迁移失效。
    pub fn holding(&self) -> bool {
        self.lock.load(Ordering::Relaxed)
            && self.cpuid.load(Ordering::Relaxed) == cpu_id() as isize
    }

    fn acquire(&self) {
        push_off();
        if self.holding() {
            panic!("spinlock {} acquire", self.name);
        }
        while self.lock.compare_exchange(false, true,
            Ordering::Acquire, Ordering::Acquire).is_err() {
            core::hint::spin_loop();
        }
        fence(Ordering::SeqCst);
        self.cpuid.store(cpu_id() as isize, Ordering::Relaxed);
    }

    fn release(&self) {
        if !self.holding() {
            panic!("spinlock {} release", self.name);
        }
        self.cpuid.store(-1, Ordering::Relaxed);
        fence(Ordering::SeqCst);
        self.lock.store(false, Ordering::Release);
        pop_off();
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// 自旋锁守卫对象，提供对受保护数据的访问。
///
/// 当守卫对象存在时，表示锁已被持有。
/// 守卫离开作用域时自动释放锁，确保锁的释放。
pub struct SpinLockGuard<'a, T: ?Sized> {
    lock: &'a SpinLock<T>,
    data: &'a mut T,
}

impl<'a, T: ?Sized> Deref for SpinLockGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &*self.data
    }
}

impl<'a, T: ?Sized> DerefMut for SpinLockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut *self.data
    }
}

impl<'a, T: ?Sized> Drop for SpinLockGuard<'a, T> {
    /// 当守卫离开作用域时自动释放锁，
    /// 并恢复中断状态（通过`pop_off`）
    fn drop(&mut self) {
        self.lock.release();
    }
}

impl<'a, T: ?Sized> SpinLockGuard<'a, T> {
    /// 守卫存在时通常应持有锁，此方法用于调试验证。
    pub fn holding(&self) -> bool {
        self.lock.holding()
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use std::thread;

    use super::*;
    use crate::process::host;

    #[test]
    fn smoke() {
        host::init();
        let m = SpinLock::new((), "smoke");
        drop(m.lock());
        drop(m.lock());
        assert_eq!(host::noff(), 0);
    }

    #[test]
    #[should_panic(expected = "spinlock reentry acquire")]
    fn reentry_panics() {
        host::init();
        let m = SpinLock::new((), "reentry");
        let _g = m.lock();
        let _h = m.lock();
    }

    #[test]
    fn try_lock_skips_self_and_others() {
        host::init();
        let m = SpinLock::new(0u32, "try");
        let g = m.lock();
        assert!(g.holding());
        // 当前 hart 已持有
        assert!(m.try_lock().is_none());
        thread::scope(|s| {
            s.spawn(|| {
                host::init();
                assert!(m.try_lock().is_none());
            });
        });
        drop(g);
        let mut g = m.try_lock().expect("lock is free");
        *g += 1;
        drop(g);
        assert_eq!(*m.lock(), 1);
        assert_eq!(host::noff(), 0);
    }

    #[test]
    fn counter_across_harts() {
        host::init();
        let m = SpinLock::new(0usize, "counter");
        thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    for _ in 0..1000 {
                        *m.lock() += 1;
                    }
                });
            }
        });
        assert_eq!(*m.lock(), 4000);
    }
}
