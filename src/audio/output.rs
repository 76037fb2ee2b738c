//! PipeWire 输出
//!
//! `Backend` 的 PipeWire 实现：
//! - 事件循环：MainLoop + Context + Core
//! - 输出流：F32LE 交织，AUTOCONNECT | MAP_BUFFERS | RT_PROCESS
//! - process 回调里执行 `BufferProducer::process`
//! - 流进入 Error 状态时按设备错误请求停止
//!
//! process 在数据线程运行，state_changed 和定时器在事件循环线程运行。
//! 停止请求只置位一个原子标志，由事件循环线程上的定时器调用 `quit`，
//! 所以 `MainLoopRc` 不会离开事件循环线程。
//! 引擎随 producer 一起移交给回调，流销毁时释放

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use pipewire as pw;
use pw::spa;
use pw::spa::pod::Pod;
use pw::stream::{StreamListener, StreamRc, StreamState};

use super::format::{FormatParams, SampleFormat};
use super::producer::{BufferProducer, BufferQueue, Chunk, DeviceBuffer};
use super::session::{Backend, LoopWatch};
use super::shutdown::{LoopControl, ShutdownController, StopReason};
use crate::engine::SignalSource;

/// 输出配置
#[derive(Debug, Clone)]
pub struct OutputConfig {
    /// 节点名称
    pub name: String,
    /// media.role
    pub media_role: String,
    /// 请求的周期大小（帧），None 由服务端决定
    pub latency_frames: Option<u32>,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            name: "multisig".to_string(),
            media_role: "Music".to_string(),
            latency_frames: None,
        }
    }
}

impl OutputConfig {
    /// node.latency 取值："frames/rate"
    pub fn latency_property(&self, sample_rate: u32) -> Option<String> {
        self.latency_frames
            .filter(|&frames| frames > 0)
            .map(|frames| format!("{}/{}", frames, sample_rate))
    }
}

/// 输出错误
#[derive(Debug, thiserror::Error)]
pub enum OutputError {
    #[error("Failed to initialize PipeWire: {0}")]
    Init(String),

    #[error("Failed to build stream format: {0}")]
    Format(String),

    #[error("Failed to connect stream: {0}")]
    Connect(String),
}

/// 定时器周期：停止请求最多延迟这么久生效
const WATCH_INTERVAL: Duration = Duration::from_millis(50);

/// 事件循环退出句柄
///
/// 可以在任何线程调用，实际的 quit 由事件循环线程上的定时器执行
#[derive(Clone)]
pub struct PwLoopControl(Arc<AtomicBool>);

impl LoopControl for PwLoopControl {
    fn quit(&self) {
        self.0.store(true, Ordering::Release);
    }
}

/// 事件循环及其连接
pub struct PwLoop {
    mainloop: pw::main_loop::MainLoopRc,
    context: pw::context::ContextRc,
    core: pw::core::CoreRc,
    quit: Arc<AtomicBool>,
}

/// 回调用户数据，擦除信号源类型
trait StreamHandler {
    fn process(&mut self, stream: &pw::stream::Stream);
}

struct ProducerHandler<S> {
    producer: BufferProducer<S>,
    shutdown: ShutdownController<PwLoopControl>,
}

impl<S: SignalSource> StreamHandler for ProducerHandler<S> {
    fn process(&mut self, stream: &pw::stream::Stream) {
        let mut queue = StreamQueue(stream);
        self.producer.process(&mut queue, &self.shutdown);
    }
}

/// 已连接的输出流
pub struct PwStream {
    stream: StreamRc,
    listener: StreamListener<Box<dyn StreamHandler>>,
}

/// 一次回调内的 buffer 队列视图
struct StreamQueue<'s>(&'s pw::stream::Stream);

impl BufferQueue for StreamQueue<'_> {
    type Buffer<'a> = PwBuffer<'a>
    where
        Self: 'a;

    fn dequeue(&mut self) -> Option<PwBuffer<'_>> {
        self.0.dequeue_buffer().map(PwBuffer)
    }
}

/// drop 时 buffer 被放回队列
struct PwBuffer<'s>(pw::buffer::Buffer<'s>);

impl DeviceBuffer for PwBuffer<'_> {
    fn data(&mut self) -> Option<&mut [u8]> {
        self.0.datas_mut().first_mut()?.data()
    }

    fn set_chunk(&mut self, chunk: Chunk) {
        if let Some(data) = self.0.datas_mut().first_mut() {
            let target = data.chunk_mut();
            *target.offset_mut() = chunk.offset;
            *target.stride_mut() = chunk.stride as i32;
            *target.size_mut() = chunk.size;
        }
    }

    fn submit(self) {
        drop(self.0);
    }

    fn discard(self) {
        // 不调用 queue_buffer
        std::mem::forget(self.0);
    }
}

/// 把协商结果序列化成 EnumFormat pod
fn format_pod(params: &FormatParams) -> Result<Vec<u8>, OutputError> {
    let format = match params.format.format {
        SampleFormat::F32 => spa::param::audio::AudioFormat::F32LE,
    };
    let channels = u32::from(params.format.channels);

    let mut audio_info = spa::param::audio::AudioInfoRaw::new();
    audio_info.set_format(format);
    audio_info.set_rate(params.format.sample_rate);
    audio_info.set_channels(channels);

    let mut position = [0u32; spa::param::audio::MAX_CHANNELS];
    if channels >= 1 {
        position[0] = spa::sys::SPA_AUDIO_CHANNEL_FL;
    }
    if channels >= 2 {
        position[1] = spa::sys::SPA_AUDIO_CHANNEL_FR;
    }
    audio_info.set_position(position);

    let (cursor, _) = spa::pod::serialize::PodSerializer::serialize(
        std::io::Cursor::new(Vec::new()),
        &spa::pod::Value::Object(spa::pod::Object {
            type_: spa::sys::SPA_TYPE_OBJECT_Format,
            id: spa::sys::SPA_PARAM_EnumFormat,
            properties: audio_info.into(),
        }),
    )
    .map_err(|e| OutputError::Format(e.to_string()))?;

    Ok(cursor.into_inner())
}

/// PipeWire 后端
pub struct PipeWireBackend {
    config: OutputConfig,
}

impl PipeWireBackend {
    pub fn new(config: OutputConfig) -> Self {
        Self { config }
    }
}

impl Backend for PipeWireBackend {
    type Error = OutputError;
    type Loop = PwLoop;
    type Stream = PwStream;
    type Control = PwLoopControl;

    fn init(&mut self) {
        pw::init();
    }

    fn create_loop(&mut self) -> Result<PwLoop, OutputError> {
        let mainloop = pw::main_loop::MainLoopRc::new(None)
            .map_err(|e| OutputError::Init(format!("Failed to create main loop: {}", e)))?;

        let context = pw::context::ContextRc::new(&mainloop, None)
            .map_err(|e| OutputError::Init(format!("Failed to create context: {}", e)))?;

        let core = context
            .connect_rc(None)
            .map_err(|e| OutputError::Init(format!("Failed to connect to PipeWire: {}", e)))?;

        Ok(PwLoop {
            mainloop,
            context,
            core,
            quit: Arc::new(AtomicBool::new(false)),
        })
    }

    fn loop_control(&self, main_loop: &PwLoop) -> PwLoopControl {
        PwLoopControl(Arc::clone(&main_loop.quit))
    }

    fn connect<S: SignalSource + 'static>(
        &mut self,
        main_loop: &PwLoop,
        params: &FormatParams,
        producer: BufferProducer<S>,
        shutdown: ShutdownController<PwLoopControl>,
    ) -> Result<PwStream, OutputError> {
        let format = params.format;

        let mut props = pw::properties::properties! {
            *pw::keys::MEDIA_TYPE => "Audio",
            *pw::keys::MEDIA_ROLE => self.config.media_role.as_str(),
            *pw::keys::MEDIA_CATEGORY => "Playback",
            *pw::keys::AUDIO_CHANNELS => format.channels.to_string(),
        };
        if let Some(latency) = self.config.latency_property(format.sample_rate) {
            log::debug!("Requesting latency: {}", latency);
            props.insert("node.latency", latency.as_str());
        }

        let stream = StreamRc::new(main_loop.core.clone(), &self.config.name, props)
            .map_err(|e| OutputError::Connect(format!("Failed to create stream: {}", e)))?;

        // state_changed 和 process 不在同一线程，各自持有自己的停止控制器
        let errors = shutdown.clone();
        let handler: Box<dyn StreamHandler> = Box::new(ProducerHandler { producer, shutdown });
        let listener = stream
            .add_local_listener_with_user_data(handler)
            .state_changed(move |_stream, _handler, old, new| {
                log::debug!("Stream state: {:?} -> {:?}", old, new);
                if let StreamState::Error(message) = new {
                    log::error!("Stream error: {}", message);
                    errors.request(StopReason::DeviceError);
                }
            })
            .process(|stream, handler| handler.process(stream))
            .register()
            .map_err(|e| OutputError::Connect(format!("Failed to register listener: {}", e)))?;

        let values = format_pod(params)?;
        let mut pod_params = [Pod::from_bytes(&values)
            .ok_or_else(|| OutputError::Format("Failed to create Pod from bytes".to_string()))?];

        stream
            .connect(
                spa::utils::Direction::Output,
                None,
                pw::stream::StreamFlags::AUTOCONNECT
                    | pw::stream::StreamFlags::MAP_BUFFERS
                    | pw::stream::StreamFlags::RT_PROCESS,
                &mut pod_params,
            )
            .map_err(|e| OutputError::Connect(e.to_string()))?;

        log::info!(
            "PipeWire stream '{}' connected: {}ch @ {}Hz",
            self.config.name,
            format.channels,
            format.sample_rate
        );

        Ok(PwStream { stream, listener })
    }

    fn run(&mut self, main_loop: &PwLoop, watch: LoopWatch) {
        let quit = Arc::clone(&main_loop.quit);
        let mainloop_weak = main_loop.mainloop.downgrade();
        let timer = main_loop.mainloop.loop_().add_timer(move |_| {
            watch();
            if quit.load(Ordering::Acquire) {
                if let Some(mainloop) = mainloop_weak.upgrade() {
                    mainloop.quit();
                }
            }
        });

        if let Err(e) = timer
            .update_timer(Some(WATCH_INTERVAL), Some(WATCH_INTERVAL))
            .into_result()
        {
            // 没有定时器就无法退出循环
            log::error!("Failed to arm loop timer: {}", e);
            return;
        }

        main_loop.mainloop.run();
        log::info!("PipeWire main loop exited");
    }

    fn destroy_stream(&mut self, stream: PwStream) {
        let PwStream { stream, listener } = stream;
        if let Err(e) = stream.disconnect() {
            log::warn!("Failed to disconnect stream: {}", e);
        }
        // 先注销回调（连同引擎），再销毁流
        drop(listener);
        drop(stream);
    }

    fn destroy_loop(&mut self, main_loop: PwLoop) {
        let PwLoop {
            mainloop,
            context,
            core,
            quit: _,
        } = main_loop;
        drop(core);
        drop(context);
        drop(mainloop);
    }

    fn deinit(&mut self) {
        // 流、监听器、定时器和循环控制句柄都已在 destroy_stream / run / destroy_loop 之前释放，
        // MainLoopRc 的唯一引用在 destroy_loop 中释放
        unsafe { pw::deinit() };
    }
}
