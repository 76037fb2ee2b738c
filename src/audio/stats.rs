//! 流统计模块
//!
//! 在 process 回调中收集计数，所有操作都是 lock-free 的

use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};

/// 流统计收集器
#[derive(Debug, Default)]
pub struct StreamStats {
    callbacks: AtomicU64,
    no_buffer: AtomicU64,
    no_data: AtomicU64,
    malformed: AtomicU64,
    submitted: AtomicU64,
    frames_written: AtomicU64,
}

impl StreamStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// 在每次 process 回调入口调用
    #[inline]
    pub fn on_callback(&self) {
        self.callbacks.fetch_add(1, Ordering::Relaxed);
    }

    /// 记录一次 out-of-buffers 跳过
    #[inline]
    pub fn record_no_buffer(&self) {
        self.no_buffer.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_no_data(&self) {
        self.no_data.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_malformed(&self) {
        self.malformed.fetch_add(1, Ordering::Relaxed);
    }

    /// 记录一次成功提交
    #[inline]
    pub fn record_submitted(&self, frames: usize) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
        self.frames_written.fetch_add(frames as u64, Ordering::Relaxed);
    }

    /// 当前的跳过计数
    pub fn skip_counts(&self) -> SkipCounts {
        SkipCounts {
            no_buffer: self.no_buffer.load(Ordering::Relaxed),
            no_data: self.no_data.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
        }
    }

    /// 生成报告
    pub fn report(&self, sample_rate: u32) -> StatsReport {
        StatsReport {
            callbacks: self.callbacks.load(Ordering::Relaxed),
            no_buffer: self.no_buffer.load(Ordering::Relaxed),
            no_data: self.no_data.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            submitted: self.submitted.load(Ordering::Relaxed),
            frames_written: self.frames_written.load(Ordering::Relaxed),
            sample_rate,
        }
    }
}

/// 各类跳过周期的计数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SkipCounts {
    pub no_buffer: u64,
    pub no_data: u64,
    pub malformed: u64,
}

impl SkipCounts {
    fn since(&self, earlier: &SkipCounts) -> SkipCounts {
        SkipCounts {
            no_buffer: self.no_buffer.saturating_sub(earlier.no_buffer),
            no_data: self.no_data.saturating_sub(earlier.no_data),
            malformed: self.malformed.saturating_sub(earlier.malformed),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.no_buffer == 0 && self.no_data == 0 && self.malformed == 0
    }
}

/// 跳过计数的观察者
///
/// 实时回调只累加计数，日志由事件循环线程定期调用 `poll` 输出
#[derive(Debug, Default)]
pub struct SkipMonitor {
    seen: Cell<SkipCounts>,
}

impl SkipMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// 返回上次调用以来新增的跳过计数，没有新增时返回 None
    pub fn poll(&self, stats: &StreamStats) -> Option<SkipCounts> {
        let now = stats.skip_counts();
        let delta = now.since(&self.seen.get());
        self.seen.set(now);
        (!delta.is_empty()).then_some(delta)
    }

    /// 有新增跳过时打一条警告
    pub fn log_new_skips(&self, stats: &StreamStats) {
        if let Some(delta) = self.poll(stats) {
            log::warn!(
                "Skipped cycles: {} out of buffers, {} null storage, {} malformed blocks",
                delta.no_buffer,
                delta.no_data,
                delta.malformed
            );
        }
    }
}

/// 统计报告
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatsReport {
    pub callbacks: u64,
    pub no_buffer: u64,
    pub no_data: u64,
    pub malformed: u64,
    pub submitted: u64,
    pub frames_written: u64,
    pub sample_rate: u32,
}

impl StatsReport {
    /// 已输出时长（秒）
    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frames_written as f64 / self.sample_rate as f64
    }

    /// 被跳过的周期总数
    pub fn skipped(&self) -> u64 {
        self.no_buffer + self.no_data + self.malformed
    }
}

impl std::fmt::Display for StatsReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Stream Statistics")?;
        writeln!(f, "=================")?;
        writeln!(f, "Total callbacks: {}", self.callbacks)?;
        writeln!(f, "Submitted cycles: {}", self.submitted)?;
        writeln!(f)?;

        writeln!(f, "Skipped cycles: {}", self.skipped())?;
        writeln!(f, "  Out of buffers: {}", self.no_buffer)?;
        writeln!(f, "  Null storage: {}", self.no_data)?;
        writeln!(f, "  Malformed blocks: {}", self.malformed)?;
        writeln!(f)?;

        writeln!(
            f,
            "Frames written: {} ({:.2} s @ {} Hz)",
            self.frames_written,
            self.duration_secs(),
            self.sample_rate
        )?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let stats = StreamStats::new();
        stats.on_callback();
        stats.on_callback();
        stats.record_submitted(512);
        stats.record_no_data();

        let report = stats.report(44100);
        assert_eq!(report.callbacks, 2);
        assert_eq!(report.submitted, 1);
        assert_eq!(report.frames_written, 512);
        assert_eq!(report.skipped(), 1);
    }

    #[test]
    fn test_skip_monitor_reports_deltas() {
        let stats = StreamStats::new();
        let monitor = SkipMonitor::new();
        assert_eq!(monitor.poll(&stats), None);

        stats.record_no_buffer();
        stats.record_no_buffer();
        stats.record_malformed();
        assert_eq!(
            monitor.poll(&stats),
            Some(SkipCounts {
                no_buffer: 2,
                no_data: 0,
                malformed: 1,
            })
        );
        assert_eq!(monitor.poll(&stats), None);

        stats.record_no_data();
        assert_eq!(monitor.poll(&stats).map(|d| d.no_data), Some(1));
    }

    #[test]
    fn test_report_duration() {
        let stats = StreamStats::new();
        stats.record_submitted(44100);
        let report = stats.report(44100);
        assert!((report.duration_secs() - 1.0).abs() < f64::EPSILON);
        assert_eq!(StreamStats::new().report(0).duration_secs(), 0.0);

        let text = report.to_string();
        assert!(text.contains("Frames written: 44100"));
    }
}
