//! Lock-free Single-Producer Single-Consumer 队列
//!
//! 用于控制线程（生产者）向实时渲染线程（消费者）投递命令
//!
//! 设计目标：
//! - 零锁：生产者和消费者完全无锁操作
//! - 零分配：所有内存在初始化时预分配
//! - 缓存友好：读写位置用 CachePadded 隔开，避免 false sharing

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;

/// SPSC 无锁环形队列
///
/// 只允许一个线程 push、一个线程 pop
pub struct RingBuffer<T: Copy> {
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
    capacity: usize,
    mask: usize,

    write_pos: CachePadded<AtomicUsize>,
    read_pos: CachePadded<AtomicUsize>,
}

unsafe impl<T: Copy + Send> Send for RingBuffer<T> {}
unsafe impl<T: Copy + Send> Sync for RingBuffer<T> {}

impl<T: Copy> RingBuffer<T> {
    /// 创建指定容量的队列
    ///
    /// capacity 必须是 2 的幂
    pub fn new(capacity: usize) -> Self {
        assert!(capacity.is_power_of_two(), "capacity must be power of two");

        let slots: Vec<UnsafeCell<MaybeUninit<T>>> = (0..capacity)
            .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
            .collect();

        Self {
            slots: slots.into_boxed_slice(),
            capacity,
            mask: capacity - 1,
            write_pos: CachePadded::new(AtomicUsize::new(0)),
            read_pos: CachePadded::new(AtomicUsize::new(0)),
        }
    }

    /// 创建指定最小容量的队列（自动向上取整到 2 的幂）
    pub fn with_min_capacity(min_capacity: usize) -> Self {
        Self::new(min_capacity.max(1).next_power_of_two())
    }

    /// 投递一个元素（生产者调用）
    ///
    /// 队列满时返回 false，wait-free
    #[inline]
    pub fn push(&self, value: T) -> bool {
        let write = self.write_pos.load(Ordering::Relaxed);
        let read = self.read_pos.load(Ordering::Acquire);

        if write.wrapping_sub(read) >= self.capacity {
            return false;
        }

        unsafe {
            (*self.slots[write & self.mask].get()).write(value);
        }

        self.write_pos.store(write.wrapping_add(1), Ordering::Release);
        true
    }

    /// 取出一个元素（消费者调用）
    ///
    /// 队列空时返回 None，wait-free
    #[inline]
    pub fn pop(&self) -> Option<T> {
        let read = self.read_pos.load(Ordering::Relaxed);
        let write = self.write_pos.load(Ordering::Acquire);

        if write == read {
            return None;
        }

        // push 已经初始化了 [read, write) 区间内的槽位
        let value = unsafe { (*self.slots[read & self.mask].get()).assume_init_read() };

        self.read_pos.store(read.wrapping_add(1), Ordering::Release);
        Some(value)
    }

    /// 当前可读元素数
    #[inline]
    pub fn available(&self) -> usize {
        let write = self.write_pos.load(Ordering::Acquire);
        let read = self.read_pos.load(Ordering::Acquire);
        write.wrapping_sub(read)
    }

    /// 当前可写空间
    #[inline]
    pub fn free_space(&self) -> usize {
        self.capacity - self.available()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_pop_order() {
        let rb = RingBuffer::<i32>::new(8);

        for i in 0..5 {
            assert!(rb.push(i));
        }
        assert_eq!(rb.available(), 5);

        for i in 0..5 {
            assert_eq!(rb.pop(), Some(i));
        }
        assert_eq!(rb.pop(), None);
    }

    #[test]
    fn test_full() {
        let rb = RingBuffer::<u8>::new(4);

        for i in 0..4 {
            assert!(rb.push(i));
        }
        assert_eq!(rb.free_space(), 0);
        assert!(!rb.push(9));

        // 取出一个后又能写入
        assert_eq!(rb.pop(), Some(0));
        assert!(rb.push(9));
    }

    #[test]
    fn test_wrap() {
        let rb = RingBuffer::<u32>::new(2);

        // 多次绕圈，验证索引掩码
        for i in 0..10 {
            assert!(rb.push(i));
            assert_eq!(rb.pop(), Some(i));
        }
        assert_eq!(rb.available(), 0);
    }

    #[test]
    fn test_min_capacity_rounds_up() {
        assert_eq!(RingBuffer::<u8>::with_min_capacity(5).capacity(), 8);
        assert_eq!(RingBuffer::<u8>::with_min_capacity(0).capacity(), 1);
    }

    #[test]
    fn test_cross_thread() {
        use std::sync::Arc;

        let rb = Arc::new(RingBuffer::<u64>::new(16));
        let producer = Arc::clone(&rb);

        let handle = std::thread::spawn(move || {
            let mut i = 0;
            while i < 1000 {
                if producer.push(i) {
                    i += 1;
                } else {
                    std::thread::yield_now();
                }
            }
        });

        let mut expected = 0;
        while expected < 1000 {
            if let Some(v) = rb.pop() {
                assert_eq!(v, expected);
                expected += 1;
            } else {
                std::thread::yield_now();
            }
        }
        handle.join().unwrap();
    }
}
