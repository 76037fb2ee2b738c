//! 测试替身：脚本化信号源、内存 buffer 队列、记录 quit 次数的事件循环

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use super::producer::{BufferQueue, Chunk, DeviceBuffer};
use super::shutdown::LoopControl;
use crate::engine::SignalSource;

/// 确定性信号源：`P[ch*n+f] = ch*100+f`
///
/// `limit` 为成功渲染的次数，之后返回 sentinel
pub struct ScriptedSource {
    block: Vec<f32>,
    limit: Option<usize>,
    short_by: usize,
    calls: Rc<RefCell<Vec<(usize, usize, u32)>>>,
}

impl ScriptedSource {
    pub fn new(limit: Option<usize>) -> Self {
        Self {
            block: Vec::new(),
            limit,
            short_by: 0,
            calls: Rc::default(),
        }
    }

    /// 每次少返回 n 个样本
    pub fn short_by(mut self, n: usize) -> Self {
        self.short_by = n;
        self
    }

    /// 记录每次调用的 (channels, frames, rate)
    pub fn calls(&self) -> Rc<RefCell<Vec<(usize, usize, u32)>>> {
        Rc::clone(&self.calls)
    }
}

impl SignalSource for ScriptedSource {
    fn render(&mut self, channels: usize, frames: usize, rate: u32) -> Option<&[f32]> {
        self.calls.borrow_mut().push((channels, frames, rate));

        if let Some(limit) = self.limit {
            if self.calls.borrow().len() > limit {
                return None;
            }
        }

        self.block.clear();
        for ch in 0..channels {
            for f in 0..frames {
                self.block.push((ch * 100 + f) as f32);
            }
        }
        let len = self.block.len().saturating_sub(self.short_by);
        Some(&self.block[..len])
    }
}

/// 内存 buffer 队列，每次 dequeue 都交出同一块存储
#[derive(Debug, Default)]
pub struct MockQueue {
    pub storage: Option<Vec<u8>>,
    pub available: bool,
    pub chunk: Option<Chunk>,
    pub submitted: usize,
    pub discarded: usize,
}

impl MockQueue {
    pub fn with_capacity(bytes: usize) -> Self {
        Self {
            storage: Some(vec![0; bytes]),
            available: true,
            ..Default::default()
        }
    }

    /// 没有空闲 buffer
    pub fn empty() -> Self {
        Self::default()
    }

    /// buffer 存在但存储为空
    pub fn null_storage() -> Self {
        Self {
            available: true,
            ..Default::default()
        }
    }
}

pub struct MockBuffer<'a> {
    queue: &'a mut MockQueue,
}

impl DeviceBuffer for MockBuffer<'_> {
    fn data(&mut self) -> Option<&mut [u8]> {
        self.queue.storage.as_deref_mut()
    }

    fn set_chunk(&mut self, chunk: Chunk) {
        self.queue.chunk = Some(chunk);
    }

    fn submit(self) {
        self.queue.submitted += 1;
    }

    fn discard(self) {
        self.queue.discarded += 1;
    }
}

impl BufferQueue for MockQueue {
    type Buffer<'a> = MockBuffer<'a>
    where
        Self: 'a;

    fn dequeue(&mut self) -> Option<MockBuffer<'_>> {
        if self.available {
            Some(MockBuffer { queue: self })
        } else {
            None
        }
    }
}

/// 记录 quit 调用次数的事件循环
#[derive(Clone)]
pub struct RecordingLoop {
    quits: Rc<Cell<usize>>,
}

impl RecordingLoop {
    pub fn new() -> (Self, Rc<Cell<usize>>) {
        let quits = Rc::new(Cell::new(0));
        (
            Self {
                quits: Rc::clone(&quits),
            },
            quits,
        )
    }
}

impl LoopControl for RecordingLoop {
    fn quit(&self) {
        self.quits.set(self.quits.get() + 1);
    }
}
