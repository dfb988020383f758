//! 常量定义
//!
//! 日志引擎的各种魔数、头部大小和默认参数

/// 暂存区文件头魔数
pub const REGION_MAGIC: u32 = 0xDEAD_BEEF;
/// 暂存区文件头大小
/// ```text
/// offset  0: u32  magic
/// offset  4: u32  session_key_len
/// offset  8: u64  payload_size
/// offset 16: [u8; 80] session_key (零填充)
/// offset 96: payload ...
/// ```
pub const REGION_HEADER_SIZE: usize = 96;
/// 文件头中会话公钥槽大小
pub const REGION_KEY_SLOT: usize = 80;
/// 暂存区默认容量 512K
pub const DEFAULT_REGION_CAPACITY: usize = 512 * 1024;

/// 条目帧魔数 - 界定暂存区内单条密文边界
pub const ITEM_MAGIC: u32 = 0xBE5F_BA11;
/// 条目帧头大小 (magic + size)
pub const ITEM_HEADER_SIZE: usize = 4 + 4;

/// 落盘块魔数
pub const CHUNK_MAGIC: u64 = 0xDEAD_BEEF_DADA_1100;
/// 落盘块中公钥槽大小（零填充）
pub const CHUNK_KEY_SLOT: usize = 128;
/// 落盘块头大小 (magic + size + pub_key)
pub const CHUNK_HEADER_SIZE: usize = 8 + 8 + CHUNK_KEY_SLOT;

/// secp256r1 未压缩公钥长度 (0x04 || X || Y)
pub const PUBLIC_KEY_LEN: usize = 65;
/// AES-128 密钥长度，共享密钥取前 16 字节
pub const AES_KEY_LEN: usize = 16;
/// AES 块大小
pub const AES_BLOCK_LEN: usize = 16;
/// 会话固定 IV
pub const AES_IV: [u8; AES_BLOCK_LEN] = *b"dad0c0012340080a";

/// 主缓存占用率超过该阈值触发主从交换
pub const SWAP_RATIO: f64 = 0.8;

/// 默认淘汰查询间隔
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 5 * 60;
/// 默认单个日志文件分片阈值 4M
pub const DEFAULT_SINGLE_SIZE: u64 = 4 * 1024 * 1024;
/// 默认日志总大小上限 100M
pub const DEFAULT_TOTAL_SIZE: u64 = 100 * 1024 * 1024;
