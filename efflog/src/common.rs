//! 日志事件公共类型
//!
//! 级别、调用位置和事件结构

use std::sync::atomic::{AtomicI32, Ordering};

/// 日志级别，数值与落盘格式一致
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(i32)]
pub enum LogLevel {
    Trace = 0,
    Debug = 1,
    Info = 2,
    Warn = 3,
    Error = 4,
    Critical = 5,
    Off = 6,
}

impl LogLevel {
    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            0 => Some(Self::Trace),
            1 => Some(Self::Debug),
            2 => Some(Self::Info),
            3 => Some(Self::Warn),
            4 => Some(Self::Error),
            5 => Some(Self::Critical),
            6 => Some(Self::Off),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trace => "TRACE",
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
            Self::Critical => "CRITICAL",
            Self::Off => "OFF",
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 调用位置，构造时剥离目录前缀只留文件名
#[derive(Debug, Clone, Copy, Default)]
pub struct SourceLocation<'a> {
    pub file_name: &'a str,
    pub line: u32,
    pub func_name: &'a str,
}

impl<'a> SourceLocation<'a> {
    pub fn new(file_name: &'a str, line: u32, func_name: &'a str) -> Self {
        // 同时处理 / 和 \ 分隔符
        let base = file_name
            .rfind(['/', '\\'])
            .map(|pos| &file_name[pos + 1..])
            .unwrap_or(file_name);
        Self {
            file_name: base,
            line,
            func_name,
        }
    }
}

/// 获取当前调用位置
#[macro_export]
macro_rules! src_loc {
    () => {
        $crate::SourceLocation::new(file!(), line!(), module_path!())
    };
}

/// 一次日志调用的事件
#[derive(Debug, Clone, Copy)]
pub struct LogMsg<'a> {
    pub location: SourceLocation<'a>,
    pub level: LogLevel,
    pub message: &'a str,
}

impl<'a> LogMsg<'a> {
    pub fn new(location: SourceLocation<'a>, level: LogLevel, message: &'a str) -> Self {
        Self {
            location,
            level,
            message,
        }
    }
}

pub fn process_id() -> i32 {
    std::process::id() as i32
}

static NEXT_THREAD_ID: AtomicI32 = AtomicI32::new(1);

thread_local! {
    static THREAD_ID: i32 = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
}

/// 进程内线程编号，每个线程首次调用时分配
pub fn thread_id() -> i32 {
    THREAD_ID.with(|id| *id)
}
