//! 哈希桶：缓冲块元数据的分片
//!
//! 每个桶都有一张覆盖全部缓冲块的控制表，但只有当前挂在本桶链表上的
//! 表项有意义。缓冲块在桶之间迁移时，元数据从旧桶的表项搬到新桶的表项，
//! 因此缓冲块的元数据始终只由它所在桶的锁保护。

use array_macro::array;

/// 链表空指针
const NIL: usize = usize::MAX;

/// 缓冲块控制结构，记录缓冲块的身份、引用计数与最近使用时间。
#[derive(Debug, Clone, Copy)]
pub(super) struct BufCtrl {
    /// 缓冲块当前代表的 `(dev, blockno)`；
    /// 从未被分配过的缓冲块为 `None`，不会被任何查找命中。
    pub key: Option<(u32, u32)>,
    /// 持有该缓冲块的 `Buf` 数量与钉住次数之和，为 0 时可被回收
    pub refcnt: usize,
    /// 最近一次获取或释放时的时钟值，回收时优先选最小者
    pub ticks: usize,
    prev: usize,
    next: usize,
    linked: bool,
}

impl BufCtrl {
    const fn new() -> Self {
        Self {
            key: None,
            refcnt: 0,
            ticks: 0,
            prev: NIL,
            next: NIL,
            linked: false,
        }
    }
}

/// 一个哈希桶：以缓冲块下标串成的双向链表，新加入者位于链表头部。
pub(super) struct Bucket<const NBUF: usize> {
    ctrl: [BufCtrl; NBUF],
    head: usize,
    len: usize,
}

impl<const NBUF: usize> Bucket<NBUF> {
    pub const fn new() -> Self {
        Self {
            ctrl: array![_ => BufCtrl::new(); NBUF],
            head: NIL,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// 按链表顺序遍历本桶中的缓冲块下标。
    pub fn iter(&self) -> Iter<'_, NBUF> {
        Iter { bucket: self, cur: self.head }
    }

    /// 查找代表 `(dev, blockno)` 的缓冲块。
    pub fn find(&self, dev: u32, blockno: u32) -> Option<usize> {
        self.iter().find(|&i| self.ctrl[i].key == Some((dev, blockno)))
    }

    /// 本桶中未被引用且最久未使用的缓冲块，返回 `(下标, 时钟值)`。
    pub fn lru_unused(&self) -> Option<(usize, usize)> {
        self.iter()
            .filter(|&i| self.ctrl[i].refcnt == 0)
            .map(|i| (i, self.ctrl[i].ticks))
            .min_by_key(|&(_, ticks)| ticks)
    }

    /// 下标为 `index` 的缓冲块是否仍在本桶且未被引用。
    pub fn is_unused(&self, index: usize) -> bool {
        let b = &self.ctrl[index];
        b.linked && b.refcnt == 0
    }

    pub fn get(&self, index: usize) -> &BufCtrl {
        let b = &self.ctrl[index];
        assert!(b.linked, "bucket: buf {} not linked", index);
        b
    }

    pub fn get_mut(&mut self, index: usize) -> &mut BufCtrl {
        let b = &mut self.ctrl[index];
        assert!(b.linked, "bucket: buf {} not linked", index);
        b
    }

    /// 让缓冲块代表 `(dev, blockno)`，并由调用者持有第一个引用。
    pub fn assign(&mut self, index: usize, dev: u32, blockno: u32, ticks: usize) {
        let b = self.get_mut(index);
        b.key = Some((dev, blockno));
        b.refcnt = 1;
        b.ticks = ticks;
    }

    /// 把缓冲块挂到链表头部，元数据取自 `ctrl`。
    pub fn push_front(&mut self, index: usize, ctrl: BufCtrl) {
        assert!(!self.ctrl[index].linked, "bucket: buf {} linked twice", index);
        let old_head = self.head;
        self.ctrl[index] = BufCtrl {
            prev: NIL,
            next: old_head,
            linked: true,
            ..ctrl
        };
        if old_head != NIL {
            self.ctrl[old_head].prev = index;
        }
        self.head = index;
        self.len += 1;
    }

    /// 把缓冲块从链表中摘下，返回它的元数据。
    pub fn unlink(&mut self, index: usize) -> BufCtrl {
        let b = *self.get(index);
        if b.prev != NIL {
            self.ctrl[b.prev].next = b.next;
        } else {
            self.head = b.next;
        }
        if b.next != NIL {
            self.ctrl[b.next].prev = b.prev;
        }
        self.ctrl[index] = BufCtrl::new();
        self.len -= 1;
        b
    }
}

pub(super) struct Iter<'a, const NBUF: usize> {
    bucket: &'a Bucket<NBUF>,
    cur: usize,
}

impl<'a, const NBUF: usize> Iterator for Iter<'a, NBUF> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.cur == NIL {
            return None;
        }
        let i = self.cur;
        self.cur = self.bucket.ctrl[i].next;
        Some(i)
    }
}

/// 尚未代表任何块的缓冲块元数据。
pub(super) fn blank() -> BufCtrl {
    BufCtrl::new()
}

#[cfg(test)]
mod tests {
    extern crate std;

    use std::vec::Vec;

    use super::*;

    fn order<const N: usize>(b: &Bucket<N>) -> Vec<usize> {
        b.iter().collect()
    }

    fn assigned<const N: usize>(b: &mut Bucket<N>, index: usize, dev: u32, blockno: u32, ticks: usize) {
        b.push_front(index, blank());
        b.assign(index, dev, blockno, ticks);
    }

    #[test]
    fn push_front_and_unlink_keep_links() {
        let mut b: Bucket<5> = Bucket::new();
        for i in 0..5 {
            b.push_front(i, blank());
        }
        assert_eq!(order(&b), [4, 3, 2, 1, 0]);
        assert_eq!(b.len(), 5);

        // 头、中、尾各摘一个
        b.unlink(4);
        b.unlink(2);
        b.unlink(0);
        assert_eq!(order(&b), [3, 1]);
        assert_eq!(b.len(), 2);
        assert!(!b.is_unused(2));

        b.push_front(2, blank());
        assert_eq!(order(&b), [2, 3, 1]);
    }

    #[test]
    fn unlink_returns_metadata() {
        let mut b: Bucket<3> = Bucket::new();
        assigned(&mut b, 1, 1, 9, 42);
        let c = b.unlink(1);
        assert_eq!(c.key, Some((1, 9)));
        assert_eq!(c.refcnt, 1);
        assert_eq!(c.ticks, 42);
        assert!(b.iter().next().is_none());
    }

    #[test]
    fn find_ignores_blank_slots() {
        let mut b: Bucket<4> = Bucket::new();
        b.push_front(0, blank());
        assigned(&mut b, 1, 0, 0, 1);
        assert_eq!(b.find(0, 0), Some(1));
        assert_eq!(b.find(0, 1), None);
    }

    #[test]
    fn lru_unused_skips_referenced() {
        let mut b: Bucket<4> = Bucket::new();
        assigned(&mut b, 0, 1, 1, 5);
        assigned(&mut b, 1, 1, 2, 3);
        assigned(&mut b, 2, 1, 3, 9);
        b.get_mut(0).refcnt = 0;
        b.get_mut(2).refcnt = 0;
        // 下标 1 最旧，但仍被引用
        assert_eq!(b.lru_unused(), Some((0, 5)));
        b.get_mut(0).refcnt = 2;
        assert_eq!(b.lru_unused(), Some((2, 9)));
        b.get_mut(2).refcnt = 1;
        assert_eq!(b.lru_unused(), None);
    }

    #[test]
    #[should_panic(expected = "not linked")]
    fn foreign_index_is_rejected() {
        let b: Bucket<2> = Bucket::new();
        b.get(1);
    }
}
