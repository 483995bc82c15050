//! 测试用调度器：每个宿主线程视作一个独立的 hart 与进程。

extern crate std;

use core::cell::Cell;
use core::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use crate::spinlock::SpinLockGuard;
use super::{registered, set_scheduler, Scheduler};

static NEXT_ID: AtomicUsize = AtomicUsize::new(1);

std::thread_local! {
    static ID: usize = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    static NOFF: Cell<usize> = const { Cell::new(0) };
}

pub struct Host;

impl Scheduler for Host {
    fn cpu_id(&self) -> usize {
        ID.with(|id| *id)
    }

    fn pid(&self) -> usize {
        ID.with(|id| *id)
    }

    fn push_off(&self) {
        NOFF.with(|n| n.set(n.get() + 1));
    }

    fn pop_off(&self) {
        NOFF.with(|n| match n.get().checked_sub(1) {
            Some(v) => n.set(v),
            None => panic!("pop_off(): count not match"),
        });
    }

    fn sleep(&self, _channel: usize, guard: SpinLockGuard<'_, ()>) {
        // 唤醒方不做记录，醒来后由调用者复查条件
        drop(guard);
        thread::yield_now();
    }

    fn wakeup(&self, _channel: usize) {}
}

static HOST: Host = Host;

/// 注册宿主调度器，重复调用无副作用。
///
/// 返回时注册一定已经完成，即使注册是由另一个线程发起的。
pub fn init() {
    let _ = set_scheduler(&HOST);
    while !registered() {
        core::hint::spin_loop();
    }
}

/// 当前线程关闭中断的嵌套层数。
pub fn noff() -> usize {
    NOFF.with(|n| n.get())
}
