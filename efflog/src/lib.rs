//! efflog - 客户端加密压缩日志引擎
//!
//! 特性：
//! - 紧凑存储：记录 TLV 编码后走流式压缩
//! - 内容保密：每个 sink 会话 ECDH 协商密钥，AES-128-CBC 加密
//! - 断电安全：mmap 双缓冲暂存，崩溃残留下次启动自动落盘
//! - 低延迟写入：落盘、淘汰全部在后台 runner 上异步执行
//!
//! 数据通路：
//! ```text
//! log() -> 级别过滤 -> TLV 编码 -> 压缩(SYNC 刷新) -> AES-CBC
//!       -> 主暂存区 {ItemFrame}
//!          占用率 > 0.8 时主从交换，从暂存区异步序列化成文件块
//! ```
//!
//! 日志文件格式（块的串联）：
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │ ChunkHeader: magic(8B) │ size(8B) │ pub_key(128B)    │
//! ├──────────────────────────────────────────────────────┤
//! │ ItemFrame: magic(4B) │ size(4B) │ ciphertext(N)      │
//! │ ItemFrame ...                                        │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! 解码方用块头公钥和服务端私钥重建共享密钥，逐条解密解压。

pub mod common;
pub mod compress;
pub mod constants;
pub mod context;
pub mod crypt;
pub mod decode;
pub mod error;
pub mod executor;
pub mod handle;
pub mod mmap;
pub mod record;
pub mod sink;

#[cfg(test)]
mod tests;

pub use common::{LogLevel, LogMsg, SourceLocation};
pub use compress::CompressionKind;
pub use context::Context;
pub use error::{Error, Result};
pub use executor::{Executor, RepeatedTaskId, TaskFuture, TaskRunnerTag};
pub use handle::LogHandle;
pub use mmap::MmapRegion;
pub use record::LogRecord;
pub use sink::{Sink, SinkConfig, StagingSink};
