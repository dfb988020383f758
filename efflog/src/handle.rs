//! 日志入口
//!
//! 按动态级别阈值过滤，逐个分发到挂载的 sink

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use crate::common::{LogLevel, LogMsg, SourceLocation};
use crate::sink::Sink;

/// 应用侧日志句柄，可被多线程共享
pub struct LogHandle {
    level: AtomicI32,
    sinks: Vec<Arc<dyn Sink>>,
}

impl LogHandle {
    /// 默认级别 Info
    pub fn new(sinks: Vec<Arc<dyn Sink>>) -> Self {
        Self {
            level: AtomicI32::new(LogLevel::Info as i32),
            sinks,
        }
    }

    pub fn with_sink(sink: Arc<dyn Sink>) -> Self {
        Self::new(vec![sink])
    }

    pub fn set_level(&self, level: LogLevel) {
        self.level.store(level as i32, Ordering::Relaxed);
    }

    pub fn get_level(&self) -> LogLevel {
        LogLevel::from_i32(self.level.load(Ordering::Relaxed)).unwrap_or(LogLevel::Info)
    }

    fn should_log(&self, level: LogLevel) -> bool {
        level < LogLevel::Off && level as i32 >= self.level.load(Ordering::Relaxed)
    }

    /// 低于阈值直接短路返回
    pub fn log(&self, level: LogLevel, location: SourceLocation<'_>, message: &str) {
        if !self.should_log(level) {
            return;
        }
        let msg = LogMsg::new(location, level, message);
        for sink in &self.sinks {
            sink.log(&msg);
        }
    }

    /// 逐个 sink 同步刷新
    pub fn flush(&self) {
        for sink in &self.sinks {
            sink.flush();
        }
    }
}
