//! 落盘 sink
//!
//! 写入路径：编码 -> 压缩 -> 加密 -> 追加到主暂存区。主暂存区占用率
//! 超过阈值后与空闲的从暂存区原子交换，从暂存区由专属 runner 异步
//! 序列化成日志文件块。启动时回收上次进程残留的暂存数据，定时任务
//! 按总大小上限淘汰最旧的日志文件。

use std::cell::RefCell;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, SystemTime};

use chrono::Utc;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::common::LogMsg;
use crate::compress::{Compression, CompressionKind};
use crate::constants::{
    CHUNK_HEADER_SIZE, CHUNK_KEY_SLOT, CHUNK_MAGIC, DEFAULT_SINGLE_SIZE,
    DEFAULT_SWEEP_INTERVAL_SECS, DEFAULT_TOTAL_SIZE, ITEM_HEADER_SIZE, ITEM_MAGIC, SWAP_RATIO,
};
use crate::context::Context;
use crate::crypt::{self, AesCrypt, Crypt};
use crate::error::Result;
use crate::executor::TaskRunnerTag;
use crate::mmap::MmapRegion;
use crate::record;

/// 日志输出端
pub trait Sink: Send + Sync {
    /// 不抛错，单条失败内部告警后丢弃
    fn log(&self, msg: &LogMsg<'_>);

    /// 同步屏障，返回时已受理的记录都进入了日志文件
    /// （主从都可清的前提下）
    fn flush(&self);
}

/// sink 配置
#[derive(Debug, Clone)]
pub struct SinkConfig {
    /// 日志文件与暂存区所在目录
    pub dir: PathBuf,
    /// 文件名前缀，命名 {prefix}_{YYYY-MM-DD HH:MM:SS}[_{n}].log
    pub prefix: String,
    /// 对端（服务侧）公钥，十六进制
    pub pub_key: String,
    /// 压缩后端，解码端按流签名自动识别
    pub compression: CompressionKind,
    /// 淘汰查询间隔
    pub interval: Duration,
    /// 单个日志文件分片阈值
    pub single_size: u64,
    /// 日志总大小上限
    pub total_size: u64,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("logs"),
            prefix: "efflog".to_string(),
            pub_key: String::new(),
            compression: CompressionKind::default(),
            interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
            single_size: DEFAULT_SINGLE_SIZE,
            total_size: DEFAULT_TOTAL_SIZE,
        }
    }
}

/// 主暂存区及写入路径的易变部件，同一把锁保护
struct ActiveState {
    active: MmapRegion,
    compressor: Box<dyn Compression>,
    compress_buf: Vec<u8>,
}

/// 双缓冲加密暂存 sink
pub struct StagingSink {
    conf: SinkConfig,
    inner: Mutex<ActiveState>,
    standby: Mutex<MmapRegion>,
    standby_free: AtomicBool,
    crypt: AesCrypt,
    session_pub_key: Vec<u8>,
    runner: TaskRunnerTag,
    current_file: Mutex<Option<PathBuf>>,
    sweep_task: AtomicU64,
    self_ref: OnceLock<Weak<StagingSink>>,
}

impl StagingSink {
    /// 建 sink：协商会话密钥、打开暂存区、回收残留数据、挂定时淘汰
    pub fn new(conf: SinkConfig) -> Result<Arc<Self>> {
        info!(
            "StagingSink: dir={}, prefix={}, interval={:?}, single_size={}, total_size={}",
            conf.dir.display(),
            conf.prefix,
            conf.interval,
            conf.single_size,
            conf.total_size
        );

        if !conf.dir.exists() {
            fs::create_dir_all(&conf.dir)?;
        }

        let (private_key, public_key) = crypt::generate_key_pair();
        let peer_key = crypt::hex_to_key(&conf.pub_key)?;
        let shared_secret = crypt::compute_shared_secret(&private_key, &peer_key)?;
        let cipher = AesCrypt::new(&shared_secret)?;

        let runner = Context::instance().create_task_runner();

        let active = MmapRegion::open(conf.dir.join("master_cache"))?;
        let standby = MmapRegion::open(conf.dir.join("slave_cache"))?;

        let interval = conf.interval;
        let compressor_backend = conf.compression.build();
        let sink = Arc::new(Self {
            conf,
            inner: Mutex::new(ActiveState {
                active,
                compressor: compressor_backend,
                compress_buf: Vec::new(),
            }),
            standby: Mutex::new(standby),
            standby_free: AtomicBool::new(true),
            crypt: cipher,
            session_pub_key: public_key,
            runner,
            current_file: Mutex::new(None),
            sweep_task: AtomicU64::new(0),
            self_ref: OnceLock::new(),
        });
        let _ = sink.self_ref.set(Arc::downgrade(&sink));

        // 崩溃恢复：从暂存区有残留先落盘，等它清空后再处理主暂存区
        if !sink.standby.lock().is_empty() {
            sink.standby_free.store(false, Ordering::Release);
            sink.schedule_drain();
            Context::instance().executor().post_and_wait_idle(sink.runner);
        }

        if !sink.inner.lock().active.is_empty() {
            sink.try_swap_to_standby();
        }

        let weak = Arc::downgrade(&sink);
        let sweep_task = Context::instance().executor().post_repeated(
            sink.runner,
            move || {
                if let Some(sink) = weak.upgrade() {
                    sink.remove_old_files();
                }
            },
            interval,
            u64::MAX,
        );
        sink.sweep_task.store(sweep_task, Ordering::Relaxed);

        Ok(sink)
    }

    /// 本会话的临时公钥（SEC1 未压缩）
    pub fn session_public_key(&self) -> &[u8] {
        &self.session_pub_key
    }

    /// 从暂存区空闲时主从交换，成败都再挂一次落盘任务
    ///
    /// 空检查、占用标记和交换在 standby 锁内一体完成，锁序固定
    /// inner -> standby，避免交换与落盘任务交错后把满的从暂存区
    /// 标成空闲
    fn try_swap_to_standby(&self) {
        // 落盘进行中（非空闲）时不碰锁，写入线程不等磁盘
        if self.standby_free.load(Ordering::Acquire) {
            let mut inner = self.inner.lock();
            let mut standby = self.standby.lock();
            if standby.is_empty()
                && self
                    .standby_free
                    .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
            {
                std::mem::swap(&mut inner.active, &mut *standby);
            }
        }
        self.schedule_drain();
    }

    fn schedule_drain(&self) {
        let weak = self.self_ref.get().cloned().unwrap_or_default();
        Context::instance().executor().post(self.runner, move || {
            if let Some(sink) = weak.upgrade() {
                sink.drain_standby();
            }
        });
    }

    /// 从暂存区落盘，专属 runner 串行执行，同一 sink 同时至多一个
    fn drain_standby(&self) {
        let mut standby = self.standby.lock();
        if self.standby_free.load(Ordering::Acquire) {
            return;
        }
        if standby.is_empty() {
            self.standby_free.store(true, Ordering::Release);
            return;
        }

        let path = self.current_file_path();

        // 块头公钥取暂存区记录的写入方会话公钥，
        // 上个进程残留的数据才能用它对应的共享密钥解开
        let session_key: Vec<u8> = standby
            .session_key()
            .map(|key| key.to_vec())
            .unwrap_or_else(|| self.session_pub_key.clone());

        let chunk_size = standby.size();
        let mut header = [0u8; CHUNK_HEADER_SIZE];
        header[..8].copy_from_slice(&CHUNK_MAGIC.to_le_bytes());
        header[8..16].copy_from_slice(&(chunk_size as u64).to_le_bytes());
        let key_len = session_key.len().min(CHUNK_KEY_SLOT);
        header[16..16 + key_len].copy_from_slice(&session_key[..key_len]);

        // 系统调用集中在这里，一次 drain 一次追加
        let write_result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .and_then(|mut file| {
                file.write_all(&header)?;
                file.write_all(standby.data())
            });

        match write_result {
            Ok(()) => debug!(
                "StagingSink::drain_standby: {} bytes -> {}",
                chunk_size,
                path.display()
            ),
            // 已出队的数据放弃，换取暂存不无限膨胀
            Err(err) => error!(
                "StagingSink::drain_standby: append {} failed: {}, staged chunk dropped",
                path.display(),
                err
            ),
        }

        standby.clear();
        self.standby_free.store(true, Ordering::Release);
    }

    /// 当前写入目标，超过分片阈值换新文件
    fn current_file_path(&self) -> PathBuf {
        let mut current = self.current_file.lock();
        let path = match current.as_ref() {
            None => self.timestamp_file_path(),
            Some(path) => {
                let file_size = fs::metadata(path).map(|meta| meta.len()).unwrap_or(0);
                if file_size > self.conf.single_size {
                    self.timestamp_file_path()
                } else {
                    path.clone()
                }
            }
        };
        *current = Some(path.clone());
        path
    }

    /// 以当前 UTC 时间命名；颗粒度到秒，同秒分片追加序号
    fn timestamp_file_path(&self) -> PathBuf {
        let stem = format!(
            "{}_{}",
            self.conf.prefix,
            Utc::now().format("%Y-%m-%d %H:%M:%S")
        );
        let candidate = self.conf.dir.join(format!("{stem}.log"));
        if !candidate.exists() {
            return candidate;
        }

        let mut index = 0usize;
        if let Ok(entries) = fs::read_dir(&self.conf.dir) {
            for entry in entries.flatten() {
                if entry.file_name().to_string_lossy().starts_with(&stem) {
                    index += 1;
                }
            }
        }
        self.conf.dir.join(format!("{stem}_{index}.log"))
    }

    /// 淘汰旧日志，从新到旧累计大小，超过上限的都删掉
    fn remove_old_files(&self) {
        debug!("StagingSink::remove_old_files: start");
        let entries = match fs::read_dir(&self.conf.dir) {
            Ok(entries) => entries,
            Err(err) => {
                warn!(
                    "StagingSink::remove_old_files: read_dir {} failed: {}",
                    self.conf.dir.display(),
                    err
                );
                return;
            }
        };

        let mut files: Vec<(PathBuf, SystemTime, u64)> = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().map(|ext| ext == "log").unwrap_or(false) {
                if let Ok(meta) = entry.metadata() {
                    let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
                    files.push((path, modified, meta.len()));
                }
            }
        }
        files.sort_by(|lhs, rhs| rhs.1.cmp(&lhs.1));

        let current = self.current_file.lock().clone();
        let mut used_bytes = 0u64;
        for (path, _, len) in files {
            used_bytes += len;
            if used_bytes > self.conf.total_size {
                if current.as_ref() == Some(&path) {
                    // 当前写入目标不删
                    continue;
                }
                info!("StagingSink::remove_old_files: remove {}", path.display());
                if let Err(err) = fs::remove_file(&path) {
                    warn!(
                        "StagingSink::remove_old_files: remove {} failed: {}",
                        path.display(),
                        err
                    );
                }
            }
        }
    }
}

impl Sink for StagingSink {
    fn log(&self, msg: &LogMsg<'_>) {
        thread_local! {
            static FMT_BUF: RefCell<Vec<u8>> = const { RefCell::new(Vec::new()) };
        }

        let need_swap = FMT_BUF.with(|cell| {
            let mut fmt_buf = cell.borrow_mut();
            record::encode_msg(msg, &mut fmt_buf);

            let mut inner = self.inner.lock();
            if inner.active.is_empty() {
                // 每个落盘块是一段独立压缩流，开流时盖上本会话公钥
                inner.compressor.reset_compress_stream();
                inner.active.set_session_key(&self.session_pub_key);
            }

            let ActiveState {
                active,
                compressor,
                compress_buf,
            } = &mut *inner;

            let compressed_size = match compressor.compress(&fmt_buf, compress_buf) {
                Ok(size) if size > 0 => size,
                Ok(_) | Err(_) => {
                    warn!("StagingSink::log: compress failed, record dropped");
                    return false;
                }
            };

            let ciphertext = self.crypt.encrypt(&compress_buf[..compressed_size]);

            let mut frame = [0u8; ITEM_HEADER_SIZE];
            frame[..4].copy_from_slice(&ITEM_MAGIC.to_le_bytes());
            frame[4..].copy_from_slice(&(ciphertext.len() as u32).to_le_bytes());

            let staged = active.size();
            if let Err(err) = active
                .push(&frame)
                .and_then(|_| active.push(&ciphertext))
            {
                // 帧保持完整，回滚到追加前
                let _ = active.resize(staged);
                warn!("StagingSink::log: stage append failed: {}, record dropped", err);
                return false;
            }

            active.ratio() > SWAP_RATIO
        });

        if need_swap {
            // 从暂存区非空闲时主暂存区继续承接写入，满了走扩容
            self.try_swap_to_standby();
        }
    }

    fn flush(&self) {
        self.schedule_drain();
        Context::instance().executor().post_and_wait_idle(self.runner);

        self.try_swap_to_standby();
        Context::instance().executor().post_and_wait_idle(self.runner);
    }
}

impl Drop for StagingSink {
    fn drop(&mut self) {
        let sweep_task = self.sweep_task.load(Ordering::Relaxed);
        if sweep_task != 0 {
            Context::instance().executor().cancel_repeated(sweep_task);
        }
    }
}
