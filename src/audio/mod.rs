//! 音频核心模块
//!
//! 包含：
//! - Ring Buffer: Lock-free 数据传递
//! - Format: 流格式和协商
//! - Producer: 实时回调里的 buffer 生产
//! - Shutdown: 事件循环停止控制
//! - Session: 播放会话生命周期
//! - Stats: 回调统计
//! - Output: PipeWire 输出

pub mod format;
#[cfg(feature = "pipewire")]
pub mod output;
pub mod producer;
pub mod ring_buffer;
pub mod session;
pub mod shutdown;
pub mod stats;

#[cfg(test)]
pub(crate) mod testing;

pub use format::{FormatNegotiator, FormatParams, SampleFormat, StreamFormat};
#[cfg(feature = "pipewire")]
pub use output::{OutputConfig, OutputError, PipeWireBackend};
pub use producer::{BufferProducer, BufferQueue, Chunk, Cycle, DeviceBuffer};
pub use ring_buffer::RingBuffer;
pub use session::{Backend, LoopWatch, SessionError, SessionReport, SessionState, StreamSession};
pub use shutdown::{LoopControl, ShutdownController, StopReason};
pub use stats::{SkipCounts, SkipMonitor, StatsReport, StreamStats};
