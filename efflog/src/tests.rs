//! 单元测试模块

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::common::{LogLevel, LogMsg, SourceLocation};
use crate::compress::{detect_stream, Compression, CompressionKind, ZlibCompression, ZstdCompression};
use crate::constants::{AES_BLOCK_LEN, DEFAULT_REGION_CAPACITY, PUBLIC_KEY_LEN};
use crate::context::Context;
use crate::crypt::{self, AesCrypt, Crypt};
use crate::handle::LogHandle;
use crate::mmap::MmapRegion;
use crate::record::{decode_record, encode_msg};
use crate::sink::Sink;

// ---------- MmapRegion ----------

#[test]
fn test_mmap_open_fresh() {
    let dir = tempfile::tempdir().unwrap();
    let region = MmapRegion::open(dir.path().join("cache")).unwrap();

    assert!(region.is_empty());
    assert_eq!(region.size(), 0);
    assert!(region.capacity() >= DEFAULT_REGION_CAPACITY);
    assert!(region.data().is_empty());
    assert!(region.session_key().is_none());
}

#[test]
fn test_mmap_push_concat() {
    let dir = tempfile::tempdir().unwrap();
    let mut region = MmapRegion::open(dir.path().join("cache")).unwrap();

    region.push(b"hello ").unwrap();
    region.push(b"mmap!").unwrap();

    assert_eq!(region.size(), 11);
    assert_eq!(region.data(), b"hello mmap!");
}

#[test]
fn test_mmap_push_empty_is_noop() {
    let dir = tempfile::tempdir().unwrap();
    let mut region = MmapRegion::open(dir.path().join("cache")).unwrap();

    region.push(b"x").unwrap();
    region.push(&[]).unwrap();

    assert_eq!(region.size(), 1);
}

#[test]
fn test_mmap_growth_preserves_payload() {
    let dir = tempfile::tempdir().unwrap();
    let mut region = MmapRegion::open(dir.path().join("cache")).unwrap();

    let prefix: Vec<u8> = (0..255u8).collect();
    region.push(&prefix).unwrap();

    let old_capacity = region.capacity();
    // 一笔超过当前容量的写入触发扩容
    let big = vec![0xA5u8; old_capacity];
    region.push(&big).unwrap();

    assert!(region.capacity() > old_capacity);
    assert_eq!(region.capacity() % page_size::get(), 0);
    assert_eq!(&region.data()[..prefix.len()], prefix.as_slice());
    assert_eq!(region.size(), prefix.len() + big.len());
}

#[test]
fn test_mmap_clear_keeps_capacity() {
    let dir = tempfile::tempdir().unwrap();
    let mut region = MmapRegion::open(dir.path().join("cache")).unwrap();

    region.push(b"data").unwrap();
    let capacity = region.capacity();
    region.clear();

    assert_eq!(region.size(), 0);
    assert!(region.is_empty());
    assert_eq!(region.capacity(), capacity);
    // 清空后依然可写
    region.push(b"again").unwrap();
    assert_eq!(region.data(), b"again");
}

#[test]
fn test_mmap_resize_sets_size_both_ways() {
    let dir = tempfile::tempdir().unwrap();
    let mut region = MmapRegion::open(dir.path().join("cache")).unwrap();

    region.push(&[10, 20, 30]).unwrap();

    // 不扩容分支
    region.resize(2).unwrap();
    assert_eq!(region.size(), 2);
    assert_eq!(region.data(), &[10, 20]);

    // 扩容分支
    let grow_to = region.capacity() + 128;
    region.resize(grow_to).unwrap();
    assert_eq!(region.size(), grow_to);
    assert_eq!(&region.data()[..2], &[10, 20]);
}

#[test]
fn test_mmap_reopen_persists() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cache");

    {
        let mut region = MmapRegion::open(&path).unwrap();
        region.push(b"survive").unwrap();
        region.set_session_key(b"key-bytes");
    }

    let region = MmapRegion::open(&path).unwrap();
    assert_eq!(region.data(), b"survive");
    assert_eq!(region.session_key(), Some(&b"key-bytes"[..]));
}

#[test]
fn test_mmap_ratio() {
    let dir = tempfile::tempdir().unwrap();
    let mut region = MmapRegion::open(dir.path().join("cache")).unwrap();

    assert_eq!(region.ratio(), 0.0);
    region.push(&vec![0u8; 1024]).unwrap();
    let ratio = region.ratio();
    assert!(ratio > 0.0 && ratio < 1.0);
}

// ---------- ZlibCompression ----------

#[test]
fn test_compress_roundtrip() {
    let mut codec = ZlibCompression::new();
    let input = b"compress me compress me compress me".to_vec();

    let mut compressed = Vec::new();
    let written = codec.compress(&input, &mut compressed).unwrap();
    assert!(written > 0);
    assert!(written <= codec.bound(input.len()));

    let output = codec.decompress(&compressed);
    assert_eq!(output, input);
}

#[test]
fn test_compress_stream_prefix_decodable() {
    let mut codec = ZlibCompression::new();
    let parts: Vec<Vec<u8>> = (0..20)
        .map(|i| format!("log line number {i} with some repetition").into_bytes())
        .collect();

    // 每次调用的产出都立即可解，解码器按到达顺序消费
    let mut decoder = ZlibCompression::new();
    let mut restored = Vec::new();
    for part in &parts {
        let mut compressed = Vec::new();
        codec.compress(part, &mut compressed).unwrap();
        restored.extend_from_slice(&decoder.decompress(&compressed));
    }

    let expected: Vec<u8> = parts.concat();
    assert_eq!(restored, expected);
}

#[test]
fn test_compress_reset_makes_independent_streams() {
    let mut codec = ZlibCompression::new();

    let mut first = Vec::new();
    codec.compress(b"stream one payload", &mut first).unwrap();

    codec.reset_compress_stream();
    let mut second = Vec::new();
    codec.compress(b"stream two payload", &mut second).unwrap();

    // 同一个解码器靠 zlib 头识别新流
    let mut decoder = ZlibCompression::new();
    assert_eq!(decoder.decompress(&first), b"stream one payload");
    assert_eq!(decoder.decompress(&second), b"stream two payload");
}

#[test]
fn test_decompress_garbage_returns_empty() {
    let mut decoder = ZlibCompression::new();
    assert!(decoder.decompress(b"definitely not zlib data").is_empty());

    // 后续合法输入不受影响
    let mut codec = ZlibCompression::new();
    let mut compressed = Vec::new();
    codec.compress(b"still fine", &mut compressed).unwrap();
    assert_eq!(decoder.decompress(&compressed), b"still fine");
}

#[test]
fn test_compress_incompressible_within_bound() {
    let mut codec = ZlibCompression::new();
    // 伪随机序列，压不动
    let input: Vec<u8> = (0..4096u32)
        .map(|i| (i.wrapping_mul(2654435761) >> 7) as u8)
        .collect();

    let mut compressed = Vec::new();
    let written = codec.compress(&input, &mut compressed).unwrap();
    assert!(written <= codec.bound(input.len()));

    assert_eq!(codec.decompress(&compressed), input);
}

#[test]
fn test_zstd_roundtrip() {
    let mut codec = ZstdCompression::new();
    let input = b"zstd payload zstd payload zstd payload".to_vec();

    let mut compressed = Vec::new();
    let written = codec.compress(&input, &mut compressed).unwrap();
    assert!(written > 0);

    assert_eq!(codec.decompress(&compressed), input);
}

#[test]
fn test_zstd_stream_prefix_decodable() {
    let mut codec = ZstdCompression::new();
    let parts: Vec<Vec<u8>> = (0..20)
        .map(|i| format!("zstd line {i} with some repetition repetition").into_bytes())
        .collect();

    let mut decoder = ZstdCompression::new();
    let mut restored = Vec::new();
    for part in &parts {
        let mut compressed = Vec::new();
        codec.compress(part, &mut compressed).unwrap();
        restored.extend_from_slice(&decoder.decompress(&compressed));
    }

    assert_eq!(restored, parts.concat());
}

#[test]
fn test_zstd_reset_makes_independent_streams() {
    let mut codec = ZstdCompression::new();

    let mut first = Vec::new();
    codec.compress(b"frame one payload", &mut first).unwrap();

    codec.reset_compress_stream();
    let mut second = Vec::new();
    codec.compress(b"frame two payload", &mut second).unwrap();

    let mut decoder = ZstdCompression::new();
    assert_eq!(decoder.decompress(&first), b"frame one payload");
    assert_eq!(decoder.decompress(&second), b"frame two payload");
}

#[test]
fn test_zstd_garbage_returns_empty() {
    let mut decoder = ZstdCompression::new();
    assert!(decoder.decompress(b"definitely not zstd data").is_empty());

    let mut codec = ZstdCompression::new();
    let mut compressed = Vec::new();
    codec.compress(b"still fine", &mut compressed).unwrap();
    assert_eq!(decoder.decompress(&compressed), b"still fine");
}

#[test]
fn test_detect_stream_kind() {
    let mut zlib = ZlibCompression::new();
    let mut zstd = ZstdCompression::new();

    let mut zlib_out = Vec::new();
    zlib.compress(b"sample", &mut zlib_out).unwrap();
    let mut zstd_out = Vec::new();
    zstd.compress(b"sample", &mut zstd_out).unwrap();

    assert_eq!(detect_stream(&zlib_out), Some(CompressionKind::Zlib));
    assert_eq!(detect_stream(&zstd_out), Some(CompressionKind::Zstd));
    assert_eq!(detect_stream(b"plain text"), None);
    assert_eq!(detect_stream(&[]), None);
}

// ---------- AesCrypt / 密钥协商 ----------

#[test]
fn test_aes_roundtrip() {
    let cipher = AesCrypt::new(&[7u8; 32]).unwrap();
    let plain = b"secret record payload";

    let encrypted = cipher.encrypt(plain);
    assert_eq!(encrypted.len(), (plain.len() + 1).div_ceil(16) * 16);

    let decrypted = cipher.decrypt(&encrypted).unwrap();
    assert_eq!(decrypted, plain);
}

#[test]
fn test_aes_empty_is_one_block() {
    let cipher = AesCrypt::new(&[9u8; 16]).unwrap();

    let encrypted = cipher.encrypt(b"");
    assert_eq!(encrypted.len(), AES_BLOCK_LEN);
    assert!(cipher.decrypt(&encrypted).unwrap().is_empty());
}

#[test]
fn test_aes_bad_padding_is_error() {
    let cipher = AesCrypt::new(&[3u8; 16]).unwrap();
    let mut encrypted = cipher.encrypt(b"tamper target");
    let last = encrypted.len() - 1;
    encrypted[last] ^= 0xFF;

    assert!(cipher.decrypt(&encrypted).is_err());
    // 长度不是块倍数同样报错
    assert!(cipher.decrypt(&encrypted[..encrypted.len() - 1]).is_err());
}

#[test]
fn test_aes_short_secret_rejected() {
    assert!(AesCrypt::new(&[1u8; 8]).is_err());
}

#[test]
fn test_ecdh_shared_secret_symmetric() {
    let (priv_a, pub_a) = crypt::generate_key_pair();
    let (priv_b, pub_b) = crypt::generate_key_pair();

    assert_eq!(pub_a.len(), PUBLIC_KEY_LEN);
    assert_eq!(pub_a[0], 0x04);

    let shared_ab = crypt::compute_shared_secret(&priv_a, &pub_b).unwrap();
    let shared_ba = crypt::compute_shared_secret(&priv_b, &pub_a).unwrap();

    assert_eq!(shared_ab, shared_ba);
    assert_eq!(shared_ab.len(), 32);
}

#[test]
fn test_ecdh_bad_peer_key() {
    let (priv_a, _) = crypt::generate_key_pair();
    assert!(crypt::compute_shared_secret(&priv_a, &[0u8; 65]).is_err());
    assert!(crypt::compute_shared_secret(&priv_a, b"short").is_err());
}

#[test]
fn test_hex_roundtrip() {
    let (_, pub_key) = crypt::generate_key_pair();

    let hex_key = crypt::key_to_hex(&pub_key);
    assert_eq!(hex_key, hex_key.to_uppercase());
    assert_eq!(crypt::hex_to_key(&hex_key).unwrap(), pub_key);

    assert_eq!(crypt::key_to_hex(&[]), "");
    assert!(crypt::hex_to_key("").unwrap().is_empty());
    assert!(crypt::hex_to_key("zz").is_err());
}

// ---------- 记录编码 ----------

#[test]
fn test_record_roundtrip() {
    let location = SourceLocation::new("src/deep/path/module.rs", 42, "module::run");
    let msg = LogMsg::new(location, LogLevel::Warn, "something happened");

    let mut buf = Vec::new();
    encode_msg(&msg, &mut buf);
    let record = decode_record(&buf).unwrap();

    assert_eq!(record.level, LogLevel::Warn as i32);
    assert!(record.timestamp_ms > 0);
    assert_eq!(record.pid, std::process::id() as i32);
    assert!(record.tid > 0);
    assert_eq!(record.line, 42);
    assert_eq!(record.file_name, "module.rs");
    assert_eq!(record.func_name, "module::run");
    assert_eq!(record.content_text(), "something happened");
}

#[test]
fn test_source_location_basename() {
    assert_eq!(SourceLocation::new("a/b/c.rs", 1, "f").file_name, "c.rs");
    assert_eq!(
        SourceLocation::new("C:\\proj\\main.rs", 1, "f").file_name,
        "main.rs"
    );
    assert_eq!(SourceLocation::new("plain.rs", 1, "f").file_name, "plain.rs");
}

#[test]
fn test_record_decode_garbage() {
    assert!(decode_record(&[0xFF, 0xFF, 0xFF, 0xFF]).is_none());
    // 空输入解出全默认值记录
    let empty = decode_record(&[]).unwrap();
    assert_eq!(empty.level, 0);
    assert!(empty.content.is_empty());
}

// ---------- 执行器 ----------

#[test]
fn test_executor_post_basic() {
    let executor = Context::instance().executor();
    let tag = executor.create_task_runner();

    let counter = Arc::new(AtomicUsize::new(0));
    let task_counter = Arc::clone(&counter);
    executor.post(tag, move || {
        task_counter.fetch_add(1, Ordering::SeqCst);
    });
    executor.post_and_wait_idle(tag);

    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

#[test]
fn test_executor_fifo_order() {
    let executor = Context::instance().executor();
    let tag = executor.create_task_runner();

    let order = Arc::new(Mutex::new(Vec::new()));
    for i in 0..100 {
        let order = Arc::clone(&order);
        executor.post(tag, move || order.lock().unwrap().push(i));
    }
    executor.post_and_wait_idle(tag);

    let observed = order.lock().unwrap();
    assert_eq!(*observed, (0..100).collect::<Vec<_>>());
}

#[test]
fn test_executor_post_with_result() {
    let executor = Context::instance().executor();
    let tag = executor.create_task_runner();

    let result = executor.post_with_result(tag, || 123);
    assert_eq!(result.wait(), Some(123));
}

#[test]
fn test_executor_delayed_task() {
    let executor = Context::instance().executor();
    let tag = executor.create_task_runner();

    let counter = Arc::new(AtomicUsize::new(0));
    let task_counter = Arc::clone(&counter);
    let start = Instant::now();
    executor.post_delayed(
        tag,
        move || {
            task_counter.fetch_add(1, Ordering::SeqCst);
        },
        Duration::from_millis(200),
    );

    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(counter.load(Ordering::SeqCst), 0);

    std::thread::sleep(Duration::from_millis(600));
    assert_eq!(counter.load(Ordering::SeqCst), 1);
    assert!(start.elapsed() >= Duration::from_millis(200));
}

#[test]
fn test_executor_repeated_task_count() {
    let executor = Context::instance().executor();
    let tag = executor.create_task_runner();

    let counter = Arc::new(AtomicUsize::new(0));
    let task_counter = Arc::clone(&counter);
    executor.post_repeated(
        tag,
        move || {
            task_counter.fetch_add(1, Ordering::SeqCst);
        },
        Duration::from_millis(20),
        5,
    );

    std::thread::sleep(Duration::from_millis(600));
    assert_eq!(counter.load(Ordering::SeqCst), 5);
}

#[test]
fn test_executor_cancel_repeated() {
    let executor = Context::instance().executor();
    let tag = executor.create_task_runner();

    let counter = Arc::new(AtomicUsize::new(0));
    let task_counter = Arc::clone(&counter);
    let id = executor.post_repeated(
        tag,
        move || {
            task_counter.fetch_add(1, Ordering::SeqCst);
        },
        Duration::from_millis(50),
        100,
    );

    // 等它触发几次再取消
    while counter.load(Ordering::SeqCst) < 3 {
        std::thread::sleep(Duration::from_millis(10));
    }
    executor.cancel_repeated(id);

    // 至多再触发已入队的一次
    std::thread::sleep(Duration::from_millis(60));
    let settled = counter.load(Ordering::SeqCst);
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(counter.load(Ordering::SeqCst), settled);
}

// ---------- LogHandle ----------

struct CountingSink {
    count: AtomicUsize,
}

impl Sink for CountingSink {
    fn log(&self, _msg: &LogMsg<'_>) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }

    fn flush(&self) {}
}

#[test]
fn test_handle_level_gate() {
    let sink = Arc::new(CountingSink {
        count: AtomicUsize::new(0),
    });
    let handle = LogHandle::with_sink(Arc::clone(&sink) as Arc<dyn Sink>);

    assert_eq!(handle.get_level(), LogLevel::Info);

    let loc = SourceLocation::new("gate.rs", 1, "gate");
    handle.log(LogLevel::Debug, loc, "filtered");
    handle.log(LogLevel::Info, loc, "passes");
    handle.log(LogLevel::Error, loc, "passes");
    assert_eq!(sink.count.load(Ordering::SeqCst), 2);

    handle.set_level(LogLevel::Error);
    handle.log(LogLevel::Warn, loc, "filtered");
    handle.log(LogLevel::Critical, loc, "passes");
    assert_eq!(sink.count.load(Ordering::SeqCst), 3);

    handle.set_level(LogLevel::Off);
    handle.log(LogLevel::Critical, loc, "filtered");
    assert_eq!(sink.count.load(Ordering::SeqCst), 3);
}
