//! 流格式协商
//!
//! 本层的格式是固定的：F32 / 2 声道 / 44100 Hz
//! 但格式描述在会话创建时只生成一次，作为显式的配置值传递，
//! 这样协商逻辑是纯函数，可以脱离音频子系统单独测试。

/// 样本格式
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SampleFormat {
    /// 32-bit float, little-endian
    F32,
}

impl SampleFormat {
    /// 每样本的字节数
    #[inline]
    pub fn bytes_per_sample(&self) -> usize {
        match self {
            Self::F32 => std::mem::size_of::<f32>(),
        }
    }
}

impl Default for SampleFormat {
    fn default() -> Self {
        Self::F32
    }
}

/// 流方向（本驱动只做输出）
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Output,
}

/// 流格式
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamFormat {
    pub format: SampleFormat,
    pub channels: u16,
    pub sample_rate: u32,
}

impl StreamFormat {
    pub const DEFAULT_CHANNELS: u16 = 2;
    pub const DEFAULT_RATE: u32 = 44100;

    /// 每帧的样本数（= 声道数）
    #[inline]
    pub fn samples_per_frame(&self) -> usize {
        self.channels as usize
    }

    /// 每样本的字节数
    #[inline]
    pub fn bytes_per_sample(&self) -> usize {
        self.format.bytes_per_sample()
    }

    /// 每帧的字节数，也就是 chunk 的 stride
    #[inline]
    pub fn bytes_per_frame(&self) -> usize {
        self.bytes_per_sample() * self.channels as usize
    }

    /// 给定字节容量能放下的完整帧数（余数丢弃）
    #[inline]
    pub fn frames_in(&self, capacity_bytes: usize) -> usize {
        match self.bytes_per_frame() {
            0 => 0,
            stride => capacity_bytes / stride,
        }
    }
}

impl Default for StreamFormat {
    fn default() -> Self {
        Self {
            format: SampleFormat::F32,
            channels: Self::DEFAULT_CHANNELS,
            sample_rate: Self::DEFAULT_RATE,
        }
    }
}

/// 提交给音频子系统的参数描述
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FormatParams {
    pub direction: Direction,
    pub format: StreamFormat,
}

/// 格式协商器
///
/// 没有失败路径，也不分配内存
#[derive(Clone, Copy, Debug, Default)]
pub struct FormatNegotiator {
    format: StreamFormat,
}

impl FormatNegotiator {
    pub fn new(format: StreamFormat) -> Self {
        Self { format }
    }

    /// 生成输出方向的参数描述
    pub fn negotiate(&self) -> FormatParams {
        FormatParams {
            direction: Direction::Output,
            format: self.format,
        }
    }
}
