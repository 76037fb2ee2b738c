//! 播放会话
//!
//! 状态机：`Uninitialized → Negotiating → Running → Terminated`
//!
//! - Negotiating：初始化音频子系统、创建事件循环、协商格式、连接流
//! - Running：事件循环阻塞调用线程，回调由音频子系统驱动
//! - Terminated：只能由 ShutdownController 触发；依次销毁流、销毁循环、释放子系统
//!
//! 音频子系统通过 `Backend` trait 接入，PipeWire 实现在 `output` 模块
//!
//! 事件循环运行期间，会话在循环线程上定期执行一个 watch：
//! 输出回调里累积的跳过计数，并把外部停止标志（Ctrl+C、控制端关闭）转成停止请求

use std::sync::Arc;

use super::format::{FormatNegotiator, FormatParams, StreamFormat};
use super::producer::BufferProducer;
use super::shutdown::{LoopControl, ShutdownController, StopReason};
use super::stats::{SkipMonitor, StatsReport, StreamStats};
use crate::engine::{SignalSource, StopFlag};

/// 事件循环线程上定期调用的检查
pub type LoopWatch = Box<dyn Fn()>;

/// 音频子系统接口
///
/// 会话按固定顺序调用：
/// `init → create_loop → connect → run → destroy_stream → destroy_loop → deinit`
pub trait Backend {
    type Error: std::error::Error + Send + Sync + 'static;
    /// 事件循环
    type Loop;
    /// 已连接的流（连同回调一起持有）
    type Stream;
    /// 回调里用来退出事件循环的句柄
    type Control: LoopControl + Clone + 'static;

    fn init(&mut self);

    fn create_loop(&mut self) -> Result<Self::Loop, Self::Error>;

    fn loop_control(&self, main_loop: &Self::Loop) -> Self::Control;

    /// 以给定参数打开输出流，并把 producer 绑定为 process 回调
    fn connect<S: SignalSource + 'static>(
        &mut self,
        main_loop: &Self::Loop,
        params: &FormatParams,
        producer: BufferProducer<S>,
        shutdown: ShutdownController<Self::Control>,
    ) -> Result<Self::Stream, Self::Error>;

    /// 阻塞直到事件循环退出
    ///
    /// 运行期间定期调用 `watch`，返回前释放它
    fn run(&mut self, main_loop: &Self::Loop, watch: LoopWatch);

    fn destroy_stream(&mut self, stream: Self::Stream);

    fn destroy_loop(&mut self, main_loop: Self::Loop);

    fn deinit(&mut self);
}

/// 会话状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Negotiating,
    Running,
    Terminated,
}

/// 会话错误
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("audio backend error: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("invalid session state: {0}")]
    InvalidState(&'static str),
}

impl SessionError {
    fn backend<E: std::error::Error + Send + Sync + 'static>(e: E) -> Self {
        Self::Backend(Box::new(e))
    }
}

/// 会话结束报告
#[derive(Debug, Clone)]
pub struct SessionReport {
    /// 停止原因；事件循环在没有停止请求的情况下退出时为 None
    pub reason: Option<StopReason>,
    pub stats: StatsReport,
}

/// 播放会话
pub struct StreamSession<B: Backend, S> {
    backend: B,
    source: Option<S>,
    negotiator: FormatNegotiator,
    format: StreamFormat,
    stats: Arc<StreamStats>,
    stop: Option<StopFlag>,
    state: SessionState,
}

impl<B: Backend, S: SignalSource + 'static> StreamSession<B, S> {
    /// 创建会话
    ///
    /// 引擎在 connect 时移交给 process 回调，和流一起在 teardown 时释放
    pub fn new(backend: B, source: S, format: StreamFormat) -> Self {
        Self {
            backend,
            source: Some(source),
            negotiator: FormatNegotiator::new(format),
            format,
            stats: Arc::new(StreamStats::new()),
            stop: None,
            state: SessionState::Uninitialized,
        }
    }

    /// 停止标志被置位后，即使设备不再调度回调，会话也会结束
    pub fn with_stop_flag(mut self, stop: StopFlag) -> Self {
        self.stop = Some(stop);
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// 回调统计（运行期间可以从其他线程读取）
    pub fn stats(&self) -> Arc<StreamStats> {
        Arc::clone(&self.stats)
    }

    /// 运行会话，阻塞直到结束
    pub fn run(&mut self) -> Result<SessionReport, SessionError> {
        if self.state != SessionState::Uninitialized {
            return Err(SessionError::InvalidState("session can only run once"));
        }
        let source = self
            .source
            .take()
            .ok_or(SessionError::InvalidState("signal source already taken"))?;

        self.state = SessionState::Negotiating;
        self.backend.init();

        let main_loop = match self.backend.create_loop() {
            Ok(main_loop) => main_loop,
            Err(e) => {
                log::error!("Failed to create event loop: {}", e);
                self.backend.deinit();
                self.state = SessionState::Terminated;
                return Err(SessionError::backend(e));
            }
        };

        let params = self.negotiator.negotiate();
        log::info!(
            "Negotiating stream: {:?} {}ch @ {}Hz",
            params.format.format,
            params.format.channels,
            params.format.sample_rate
        );

        let shutdown = ShutdownController::new(self.backend.loop_control(&main_loop));
        let producer = BufferProducer::new(source, params.format, Arc::clone(&self.stats));

        let stream = match self
            .backend
            .connect(&main_loop, &params, producer, shutdown.clone())
        {
            Ok(stream) => stream,
            Err(e) => {
                log::error!("Failed to connect stream: {}", e);
                drop(shutdown);
                self.backend.destroy_loop(main_loop);
                self.backend.deinit();
                self.state = SessionState::Terminated;
                return Err(SessionError::backend(e));
            }
        };

        self.state = SessionState::Running;
        log::info!("Stream connected, entering event loop");

        let watch = self.watch(shutdown.clone());
        self.backend.run(&main_loop, watch);

        self.state = SessionState::Terminated;
        let reason = shutdown.reason();
        match reason {
            Some(reason) => log::info!("Event loop exited: {:?}", reason),
            None => log::warn!("Event loop exited without a stop request"),
        }
        // 循环控制句柄必须在 destroy_loop 之前释放
        drop(shutdown);

        self.backend.destroy_stream(stream);
        self.backend.destroy_loop(main_loop);
        self.backend.deinit();

        let stats = self.stats.report(self.format.sample_rate);
        log::info!("Session terminated\n{}", stats);

        Ok(SessionReport { reason, stats })
    }

    fn watch(&self, shutdown: ShutdownController<B::Control>) -> LoopWatch {
        let stats = Arc::clone(&self.stats);
        let stop = self.stop.clone();
        let monitor = SkipMonitor::new();

        Box::new(move || {
            monitor.log_new_skips(&stats);
            if stop.as_ref().is_some_and(StopFlag::is_stopped)
                && shutdown.request(StopReason::EndOfStream)
            {
                log::info!("Stop flag set, leaving event loop");
            }
        })
    }
}
