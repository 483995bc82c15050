//! 调度器协作接口
//!
//! 缓存层本身不实现进程调度，只依赖调度器提供的几项能力：
//! 识别当前 hart 与进程、开关中断、在通道上睡眠与唤醒。
//! 内核在启动时通过 [`set_scheduler`] 注册一次具体实现，
//! 注册之前使用单 hart 的启动期实现 [`Boot`]。

use core::fmt;
use core::hint;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::spinlock::SpinLockGuard;

#[cfg(test)]
pub(crate) mod host;

/// 调度器需要向锁与缓存层提供的能力。
///
/// 实现者必须保证 `cpu_id` 在中断关闭期间保持不变，
/// 即持有自旋锁的执行流不会被迁移到其他 hart。
pub trait Scheduler: Sync {
    /// 当前 hart 的编号。
    fn cpu_id(&self) -> usize;

    /// 当前进程的标识，睡眠锁以此记录持有者。
    fn pid(&self) -> usize;

    /// 关闭中断，可嵌套。
    fn push_off(&self);

    /// 与 `push_off` 配对，嵌套计数归零时恢复中断。
    fn pop_off(&self);

    /// 原子地释放 `guard` 并在 `channel` 上睡眠。
    ///
    /// # 功能说明
    /// 实现必须在释放 `guard` 之前进入"即将睡眠"的状态，
    /// 保证 `guard` 释放后到真正睡眠之间发生的 `wakeup` 不会丢失。
    /// 返回时不再持有 `guard` 对应的锁，调用者需自行重新获取并复查条件。
    fn sleep(&self, channel: usize, guard: SpinLockGuard<'_, ()>);

    /// 唤醒所有在 `channel` 上睡眠的进程。
    fn wakeup(&self, channel: usize);
}

/// 启动期调度器：只有一个 hart、一个执行流，睡眠退化为让出处理器后重试。
pub struct Boot;

impl Scheduler for Boot {
    fn cpu_id(&self) -> usize {
        0
    }

    fn pid(&self) -> usize {
        0
    }

    fn push_off(&self) {}

    fn pop_off(&self) {}

    fn sleep(&self, _channel: usize, guard: SpinLockGuard<'_, ()>) {
        drop(guard);
        hint::spin_loop();
    }

    fn wakeup(&self, _channel: usize) {}
}

/// 重复注册调度器时返回的错误。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetSchedulerError;

impl fmt::Display for SetSchedulerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("scheduler already registered")
    }
}

const UNINIT: usize = 0;
const INITIALIZING: usize = 1;
const INITIALIZED: usize = 2;

static STATE: AtomicUsize = AtomicUsize::new(UNINIT);
static mut SCHEDULER: &dyn Scheduler = &Boot;

/// 注册全局调度器，只能成功一次。
///
/// # 可能的错误
/// - 已有调度器注册（或正在注册）时返回 `Err(SetSchedulerError)`，已注册的调度器保持不变。
pub fn set_scheduler(scheduler: &'static dyn Scheduler) -> Result<(), SetSchedulerError> {
    match STATE.compare_exchange(UNINIT, INITIALIZING, Ordering::AcqRel, Ordering::Acquire) {
        Ok(_) => {
            // 只有赢得 compare_exchange 的一方会写入
            unsafe { SCHEDULER = scheduler; }
            STATE.store(INITIALIZED, Ordering::Release);
            Ok(())
        }
        Err(_) => Err(SetSchedulerError),
    }
}

/// 是否已有调度器完成注册。
pub fn registered() -> bool {
    STATE.load(Ordering::Acquire) == INITIALIZED
}

/// 当前生效的调度器。
pub fn scheduler() -> &'static dyn Scheduler {
    if registered() {
        unsafe { SCHEDULER }
    } else {
        &Boot
    }
}

#[inline]
pub fn push_off() {
    scheduler().push_off();
}

#[inline]
pub fn pop_off() {
    scheduler().pop_off();
}

/// 必须在关闭中断的情况下调用，
/// 以防止执行流被迁移到另一个 hart 时读到过期的编号。
#[inline]
pub fn cpu_id() -> usize {
    scheduler().cpu_id()
}

#[inline]
pub fn my_pid() -> usize {
    scheduler().pid()
}

pub fn sleep(channel: usize, guard: SpinLockGuard<'_, ()>) {
    scheduler().sleep(channel, guard);
}

pub fn wakeup(channel: usize) {
    scheduler().wakeup(channel);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_registration_is_rejected() {
        host::init();
        assert!(registered());
        assert_eq!(set_scheduler(&Boot), Err(SetSchedulerError));
        // 宿主调度器的进程标识从 1 开始
        assert_ne!(my_pid(), 0);
    }
}
