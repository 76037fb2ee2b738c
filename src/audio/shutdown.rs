//! 停止控制
//!
//! 引擎返回 sentinel 或设备报错时请求事件循环退出。
//! 请求可以在实时回调线程里发起，只做一次 CAS 和一次 quit 调用；
//! 重复请求不会再次触发 quit，也就不会重复 teardown。

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

/// 事件循环的退出接口
pub trait LoopControl {
    /// 请求事件循环在当前回调返回后停止
    fn quit(&self);
}

/// 停止原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StopReason {
    /// 引擎没有更多输出（正常结束）
    EndOfStream = 1,
    /// 音频子系统异步报告的流错误
    DeviceError = 2,
}

impl StopReason {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::EndOfStream),
            2 => Some(Self::DeviceError),
            _ => None,
        }
    }
}

const NOT_REQUESTED: u8 = 0;

/// 停止控制器
///
/// clone 出来的实例共享同一个请求状态
#[derive(Clone)]
pub struct ShutdownController<L> {
    control: L,
    reason: Arc<AtomicU8>,
}

impl<L: LoopControl> ShutdownController<L> {
    pub fn new(control: L) -> Self {
        Self {
            control,
            reason: Arc::new(AtomicU8::new(NOT_REQUESTED)),
        }
    }

    /// 请求停止
    ///
    /// 只有第一次请求生效并调用 quit，返回 true；之后的请求返回 false
    pub fn request(&self, reason: StopReason) -> bool {
        match self.reason.compare_exchange(
            NOT_REQUESTED,
            reason as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                self.control.quit();
                true
            }
            Err(_) => false,
        }
    }

    #[inline]
    pub fn is_requested(&self) -> bool {
        self.reason.load(Ordering::Acquire) != NOT_REQUESTED
    }

    /// 第一次请求的原因
    pub fn reason(&self) -> Option<StopReason> {
        StopReason::from_u8(self.reason.load(Ordering::Acquire))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Clone, Default)]
    struct CountingLoop(Arc<AtomicUsize>);

    impl LoopControl for CountingLoop {
        fn quit(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_request_is_idempotent() {
        let quits = CountingLoop::default();
        let shutdown = ShutdownController::new(quits.clone());

        assert!(!shutdown.is_requested());
        assert_eq!(shutdown.reason(), None);

        assert!(shutdown.request(StopReason::EndOfStream));
        assert!(!shutdown.request(StopReason::EndOfStream));
        assert_eq!(quits.0.load(Ordering::SeqCst), 1);
        assert!(shutdown.is_requested());
    }

    #[test]
    fn test_first_reason_wins() {
        let quits = CountingLoop::default();
        let shutdown = ShutdownController::new(quits.clone());
        let other = shutdown.clone();

        assert!(other.request(StopReason::DeviceError));
        assert!(!shutdown.request(StopReason::EndOfStream));
        assert_eq!(shutdown.reason(), Some(StopReason::DeviceError));
        assert_eq!(quits.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_concurrent_requests_quit_once() {
        let quits = CountingLoop::default();
        let shutdown = ShutdownController::new(quits.clone());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let s = shutdown.clone();
                std::thread::spawn(move || s.request(StopReason::EndOfStream))
            })
            .collect();

        let granted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|&won| won)
            .count();

        assert_eq!(granted, 1);
        assert_eq!(quits.0.load(Ordering::SeqCst), 1);
    }
}
