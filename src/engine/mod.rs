//! 合成引擎
//!
//! 多声道信号发生器，分为两半：
//! - `SignalEngine`：实时线程持有，每次设备回调渲染一块 planar 样本
//! - `EngineHandle`：控制线程持有，通过 lock-free 队列下发参数
//!
//! 控制端关闭（显式 close、Drop、Ctrl+C）或到达帧数上限后，
//! `render` 返回 sentinel（None），驱动据此结束会话。

pub mod wave;

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use crate::audio::RingBuffer;

pub use wave::{Channel, ChannelParams, ParamsError, WaveShape};

/// 合成引擎的调用约定
///
/// 返回 `channels * frames` 个 planar 样本（先是声道 0 的全部帧，再是声道 1 ...），
/// 或者 None 表示没有更多输出。实现必须在有界时间内返回，不能阻塞。
pub trait SignalSource {
    fn render(&mut self, channels: usize, frames: usize, rate: u32) -> Option<&[f32]>;
}

/// 控制命令
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Command {
    /// 设置某个声道（0 起始）的参数
    SetParams(usize, ChannelParams),
    /// 所有声道相位归零
    Reset,
}

/// 引擎配置
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// 声道数
    pub channels: u16,
    /// 预分配的最大帧数
    pub max_frames: usize,
    /// 命令队列容量（会被向上取整到 2 的幂）
    pub command_capacity: usize,
    /// 各声道初始参数，缺省的声道使用默认参数
    pub params: Vec<ChannelParams>,
    /// 最多渲染的帧数，None 表示不限
    pub frame_limit: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            channels: 2,
            // PipeWire 的 quantum 上限一般是 8192
            max_frames: 8192,
            command_capacity: 64,
            params: Vec::new(),
            frame_limit: None,
        }
    }
}

/// 引擎错误
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("command queue is full")]
    QueueFull,

    #[error("engine has been closed")]
    Closed,
}

/// 两端共享的状态，全部是原子量
#[derive(Debug, Default)]
struct Shared {
    closed: AtomicBool,
    /// 最近一次渲染使用的采样率，0 表示还没有渲染过
    rate: AtomicU32,
}

/// 实时端：信号发生器
pub struct SignalEngine {
    channels: Vec<Channel>,
    buffer: Vec<f32>,
    commands: Arc<RingBuffer<Command>>,
    shared: Arc<Shared>,
    frame_limit: Option<u64>,
    frames_rendered: u64,
    exhausted: bool,
    memory_locked: bool,
}

impl SignalEngine {
    /// 创建引擎，返回实时端和控制端
    pub fn new(config: EngineConfig) -> (Self, EngineHandle) {
        let n_channels = config.channels as usize;
        let mut channels: Vec<Channel> = Vec::with_capacity(n_channels);
        for i in 0..n_channels {
            let params = config.params.get(i).copied().unwrap_or_default();
            channels.push(params.into());
        }

        let commands = Arc::new(RingBuffer::with_min_capacity(config.command_capacity));
        let shared = Arc::new(Shared::default());

        let engine = Self {
            channels,
            buffer: vec![0.0; config.max_frames * n_channels],
            commands: Arc::clone(&commands),
            shared: Arc::clone(&shared),
            frame_limit: config.frame_limit,
            frames_rendered: 0,
            exhausted: false,
            memory_locked: false,
        };

        (engine, EngineHandle { commands, shared })
    }

    /// 当前各声道参数
    pub fn channel_params(&self) -> impl Iterator<Item = &ChannelParams> {
        self.channels.iter().map(Channel::params)
    }

    /// 已渲染的帧数
    pub fn frames_rendered(&self) -> u64 {
        self.frames_rendered
    }

    /// 锁定渲染缓冲区内存，防止 page fault
    ///
    /// 返回是否成功锁定
    pub fn lock_memory(&mut self) -> bool {
        if self.memory_locked {
            return true;
        }

        let ptr = self.buffer.as_ptr() as *const libc::c_void;
        let len = self.buffer.len() * std::mem::size_of::<f32>();

        let result = unsafe { libc::mlock(ptr, len) };
        if result == 0 {
            self.memory_locked = true;
            log::debug!("Render buffer locked: {} bytes", len);
            true
        } else {
            log::warn!(
                "Failed to lock render buffer memory: {}",
                std::io::Error::last_os_error()
            );
            false
        }
    }

    /// 解锁渲染缓冲区内存
    pub fn unlock_memory(&mut self) {
        if !self.memory_locked {
            return;
        }

        let ptr = self.buffer.as_ptr() as *const libc::c_void;
        let len = self.buffer.len() * std::mem::size_of::<f32>();
        unsafe {
            libc::munlock(ptr, len);
        }

        self.memory_locked = false;
        log::debug!("Render buffer unlocked");
    }

    fn apply(&mut self, command: Command) {
        match command {
            Command::SetParams(i, params) => match self.channels.get_mut(i) {
                Some(channel) => *channel = params.into(),
                None => log::debug!("Ignoring params for channel {} (have {})", i, self.channels.len()),
            },
            Command::Reset => self.channels.iter_mut().for_each(Channel::reset),
        }
    }

    /// 设备给出的 buffer 超出预分配时扩容
    ///
    /// 这是唯一会分配内存的路径
    #[cold]
    fn grow(&mut self, channels: usize, len: usize) {
        log::warn!(
            "Render request of {} samples exceeds preallocated {}, growing buffer",
            len,
            self.buffer.len()
        );

        let relock = self.memory_locked;
        self.unlock_memory();

        if self.channels.len() < channels {
            self.channels.resize_with(channels, Default::default);
        }
        if self.buffer.len() < len {
            self.buffer.resize(len, 0.0);
        }

        if relock {
            self.lock_memory();
        }
    }
}

impl SignalSource for SignalEngine {
    fn render(&mut self, channels: usize, frames: usize, rate: u32) -> Option<&[f32]> {
        if self.exhausted {
            return None;
        }

        if self.shared.closed.load(Ordering::Acquire) {
            self.exhausted = true;
            return None;
        }

        if let Some(limit) = self.frame_limit {
            if self.frames_rendered >= limit {
                self.exhausted = true;
                return None;
            }
        }

        while let Some(command) = self.commands.pop() {
            self.apply(command);
        }

        self.shared.rate.store(rate, Ordering::Relaxed);

        let len = channels * frames;
        if self.buffer.len() < len || self.channels.len() < channels {
            self.grow(channels, len);
        }
        if frames == 0 {
            return Some(&self.buffer[..0]);
        }

        let rate = rate as f64;
        self.channels[..channels]
            .iter_mut()
            .zip(self.buffer[..len].chunks_exact_mut(frames))
            .for_each(|(channel, block)| channel.process(block, rate));

        self.frames_rendered += frames as u64;
        Some(&self.buffer[..len])
    }
}

impl Drop for SignalEngine {
    fn drop(&mut self) {
        self.unlock_memory();
    }
}

/// 控制端
///
/// 只能有一个持有者（命令队列是 SPSC），Drop 时关闭引擎
pub struct EngineHandle {
    commands: Arc<RingBuffer<Command>>,
    shared: Arc<Shared>,
}

impl EngineHandle {
    /// 下发命令，下一次渲染时生效
    pub fn send(&mut self, command: Command) -> Result<(), EngineError> {
        if self.is_closed() {
            return Err(EngineError::Closed);
        }
        if !self.commands.push(command) {
            return Err(EngineError::QueueFull);
        }
        Ok(())
    }

    /// 最近一次渲染使用的采样率
    pub fn sample_rate(&self) -> Option<u32> {
        match self.shared.rate.load(Ordering::Relaxed) {
            0 => None,
            rate => Some(rate),
        }
    }

    /// 可以跨线程共享的停止标志（用于信号处理）
    pub fn stop_flag(&self) -> StopFlag {
        StopFlag(Arc::clone(&self.shared))
    }

    /// 关闭引擎，之后的渲染都返回 sentinel
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }
}

impl Drop for EngineHandle {
    fn drop(&mut self) {
        self.close();
    }
}

/// 停止标志
#[derive(Clone)]
pub struct StopFlag(Arc<Shared>);

impl StopFlag {
    pub fn stop(&self) {
        self.0.closed.store(true, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.closed.load(Ordering::Acquire)
    }
}
