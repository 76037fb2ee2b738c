//! Buffer 生产者（实时回调）
//!
//! 每次设备请求数据时执行一轮：
//! 取 buffer → 校验存储 → 计算帧数 → 调用引擎 → planar 转交织 → 写 chunk → 提交
//!
//! **绝对禁止：**
//! - 锁
//! - 分配
//! - 阻塞 I/O（包括 log，异常情况只记到 `StreamStats`）

use std::sync::Arc;

use super::format::StreamFormat;
use super::shutdown::{LoopControl, ShutdownController, StopReason};
use super::stats::StreamStats;
use crate::engine::SignalSource;

/// buffer 有效区域的描述
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Chunk {
    pub offset: u32,
    pub stride: u32,
    pub size: u32,
}

impl Chunk {
    /// 从 0 偏移开始的 `frames` 个完整帧
    #[inline]
    pub fn for_frames(frames: usize, stride: usize) -> Self {
        Self {
            offset: 0,
            stride: stride as u32,
            size: (frames * stride) as u32,
        }
    }
}

/// 一次回调内从音频子系统借来的 buffer
///
/// 必须以 `submit` 或 `discard` 结束，不能跨回调保留
pub trait DeviceBuffer {
    /// 目标存储（字节视图），None 表示存储指针为空
    fn data(&mut self) -> Option<&mut [u8]>;

    fn set_chunk(&mut self, chunk: Chunk);

    /// 交还给音频子系统播放
    fn submit(self);

    /// 不提交
    fn discard(self);
}

/// 音频子系统的 buffer 队列
pub trait BufferQueue {
    type Buffer<'a>: DeviceBuffer
    where
        Self: 'a;

    /// 取一个空闲 buffer，None 是常见情况而不是错误
    fn dequeue(&mut self) -> Option<Self::Buffer<'_>>;
}

/// 一轮回调的结果
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Cycle {
    /// 已提交 `frames` 帧
    Submitted { frames: usize },
    /// 没有空闲 buffer
    NoBuffer,
    /// buffer 存储为空
    NoData,
    /// 引擎返回的块长度不对，buffer 被丢弃
    Malformed,
    /// 引擎没有更多输出，已请求停止
    EndOfStream,
    /// 停止已经请求过，本轮不做任何事
    Stopping,
}

/// planar → 交织，写成 little-endian f32
///
/// `dest[f*channels + ch] = planar[ch*frames + f]`
///
/// 调用方保证 `planar.len() >= channels * frames`，
/// `dest.len() >= channels * frames * 4`
#[inline]
pub fn interleave(planar: &[f32], frames: usize, channels: usize, dest: &mut [u8]) {
    const SAMPLE: usize = std::mem::size_of::<f32>();

    let out = &mut dest[..frames * channels * SAMPLE];
    for (f, frame) in out.chunks_exact_mut(channels * SAMPLE).enumerate() {
        for (ch, sample) in frame.chunks_exact_mut(SAMPLE).enumerate() {
            sample.copy_from_slice(&planar[ch * frames + f].to_le_bytes());
        }
    }
}

/// Buffer 生产者
pub struct BufferProducer<S> {
    source: S,
    format: StreamFormat,
    stats: Arc<StreamStats>,
}

impl<S: SignalSource> BufferProducer<S> {
    pub fn new(source: S, format: StreamFormat, stats: Arc<StreamStats>) -> Self {
        Self {
            source,
            format,
            stats,
        }
    }

    /// 执行一轮回调
    pub fn process<Q, L>(&mut self, queue: &mut Q, shutdown: &ShutdownController<L>) -> Cycle
    where
        Q: BufferQueue,
        L: LoopControl,
    {
        self.stats.on_callback();

        // 已经在退出，不再取 buffer 也不再调用引擎
        if shutdown.is_requested() {
            return Cycle::Stopping;
        }

        let Some(mut buffer) = queue.dequeue() else {
            self.stats.record_no_buffer();
            return Cycle::NoBuffer;
        };

        let channels = self.format.samples_per_frame();
        let stride = self.format.bytes_per_frame();
        let rate = self.format.sample_rate;

        let frames = match buffer.data() {
            Some(dest) => {
                // buffer 容量可能每轮都不同
                let frames = self.format.frames_in(dest.len());

                let Some(planar) = self.source.render(channels, frames, rate) else {
                    buffer.discard();
                    shutdown.request(StopReason::EndOfStream);
                    return Cycle::EndOfStream;
                };

                if planar.len() != channels * frames {
                    self.stats.record_malformed();
                    buffer.discard();
                    return Cycle::Malformed;
                }

                interleave(planar, frames, channels, dest);
                frames
            }
            None => {
                self.stats.record_no_data();
                buffer.discard();
                return Cycle::NoData;
            }
        };

        buffer.set_chunk(Chunk::for_frames(frames, stride));
        buffer.submit();
        self.stats.record_submitted(frames);

        Cycle::Submitted { frames }
    }
}
