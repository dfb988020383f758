//! 流式压缩
//!
//! 两个后端：zlib 方言（flate2）和 zstd，每次调用以 flush 收尾，
//! 保证已产出的前缀可独立解码。流首部的格式签名兼作解码器重置
//! 标记，解码端据此区分相互独立的流，也据此识别块用的是哪个后端。

use std::io::Write;

use flate2::{Compress, Decompress, FlushCompress, FlushDecompress, Status};
use tracing::warn;

use crate::error::{Error, Result};

/// 压缩能力接口
pub trait Compression: Send {
    /// 压缩 input 追加到 output（output 先清空），返回产出字节数
    fn compress(&mut self, input: &[u8], output: &mut Vec<u8>) -> Result<usize>;

    /// 最坏情况产出大小
    fn bound(&self, input_size: usize) -> usize;

    /// 解压，输入损坏返回空且不影响后续调用
    fn decompress(&mut self, input: &[u8]) -> Vec<u8>;

    /// 重置压缩流，下一次 compress 产出独立新流
    fn reset_compress_stream(&mut self);

    /// 重置解压流
    fn reset_decompress_stream(&mut self);
}

/// 压缩后端选择
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressionKind {
    #[default]
    Zlib,
    Zstd,
}

impl CompressionKind {
    pub fn build(self) -> Box<dyn Compression> {
        match self {
            Self::Zlib => Box::new(ZlibCompression::new()),
            Self::Zstd => Box::new(ZstdCompression::new()),
        }
    }
}

/// 从流首部签名识别后端
pub fn detect_stream(data: &[u8]) -> Option<CompressionKind> {
    if is_zstd_stream_head(data) {
        Some(CompressionKind::Zstd)
    } else if is_zlib_stream_head(data) {
        Some(CompressionKind::Zlib)
    } else {
        None
    }
}

/// 判断 zlib 流头: CMF 低 4 位为 8 (DEFLATE)，CMF<<8|FLG 能被 31 整除
/// https://www.rfc-editor.org/rfc/rfc1950
fn is_zlib_stream_head(data: &[u8]) -> bool {
    if data.len() < 2 {
        return false;
    }
    let cmf = u16::from(data[0]);
    let flg = u16::from(data[1]);
    (cmf & 0x0F) == 8 && ((cmf << 8) | flg) % 31 == 0
}

/// 判断 zstd 帧头，逐字节比较不依赖主机字节序
fn is_zstd_stream_head(data: &[u8]) -> bool {
    data.len() >= 4 && data[0] == 0x28 && data[1] == 0xB5 && data[2] == 0x2F && data[3] == 0xFD
}

/// 基于 flate2 的 zlib 流压缩
pub struct ZlibCompression {
    deflater: Compress,
    inflater: Decompress,
}

impl ZlibCompression {
    pub fn new() -> Self {
        Self {
            deflater: Compress::new(flate2::Compression::best(), true),
            inflater: Decompress::new(true),
        }
    }
}

impl Default for ZlibCompression {
    fn default() -> Self {
        Self::new()
    }
}

impl Compression for ZlibCompression {
    fn compress(&mut self, input: &[u8], output: &mut Vec<u8>) -> Result<usize> {
        output.clear();
        output.reserve(self.bound(input.len()));

        let mut consumed = 0usize;
        loop {
            let before_in = self.deflater.total_in();
            let status = self
                .deflater
                .compress_vec(&input[consumed..], output, FlushCompress::Sync)
                .map_err(|_| Error::Compress)?;
            consumed += (self.deflater.total_in() - before_in) as usize;

            if matches!(status, Status::StreamEnd) {
                break;
            }
            // SYNC 刷新完成的判据：输入耗尽且输出区仍有剩余空间
            if consumed >= input.len() && output.len() < output.capacity() {
                break;
            }
            if output.len() == output.capacity() {
                output.reserve(4096);
            }
        }
        Ok(output.len())
    }

    fn bound(&self, input_size: usize) -> usize {
        // 存储块上限 + zlib 头 + SYNC 刷新尾
        input_size + input_size / 1000 + 64
    }

    fn decompress(&mut self, input: &[u8]) -> Vec<u8> {
        if input.is_empty() {
            return Vec::new();
        }
        if is_zlib_stream_head(input) {
            self.reset_decompress_stream();
        }

        let mut output: Vec<u8> = Vec::new();
        let mut consumed = 0usize;
        while consumed < input.len() {
            if output.len() == output.capacity() {
                output.reserve(4096);
            }
            let before_in = self.inflater.total_in();
            let before_out = self.inflater.total_out();
            let status = match self.inflater.decompress_vec(
                &input[consumed..],
                &mut output,
                FlushDecompress::Sync,
            ) {
                Ok(status) => status,
                Err(_) => return Vec::new(),
            };
            consumed += (self.inflater.total_in() - before_in) as usize;

            if matches!(status, Status::StreamEnd) {
                break;
            }
            let progressed = self.inflater.total_in() > before_in
                || self.inflater.total_out() > before_out;
            if !progressed && output.len() < output.capacity() {
                // 剩余输入不属于当前压缩流
                break;
            }
        }
        output
    }

    fn reset_compress_stream(&mut self) {
        self.deflater.reset();
    }

    fn reset_decompress_stream(&mut self) {
        self.inflater.reset(true);
    }
}

/// zstd 压缩级别
const ZSTD_LEVEL: i32 = 5;

/// 基于 zstd 的流压缩，flush 语义与 zlib 后端一致
pub struct ZstdCompression {
    encoder: Option<zstd::stream::write::Encoder<'static, Vec<u8>>>,
    decoder: Option<zstd::stream::write::Decoder<'static, Vec<u8>>>,
}

impl ZstdCompression {
    pub fn new() -> Self {
        Self {
            encoder: new_zstd_encoder(),
            decoder: new_zstd_decoder(),
        }
    }
}

impl Default for ZstdCompression {
    fn default() -> Self {
        Self::new()
    }
}

fn new_zstd_encoder() -> Option<zstd::stream::write::Encoder<'static, Vec<u8>>> {
    match zstd::stream::write::Encoder::new(Vec::new(), ZSTD_LEVEL) {
        Ok(encoder) => Some(encoder),
        Err(err) => {
            warn!("ZstdCompression: create encoder failed: {}", err);
            None
        }
    }
}

fn new_zstd_decoder() -> Option<zstd::stream::write::Decoder<'static, Vec<u8>>> {
    match zstd::stream::write::Decoder::new(Vec::new()) {
        Ok(decoder) => Some(decoder),
        Err(err) => {
            warn!("ZstdCompression: create decoder failed: {}", err);
            None
        }
    }
}

impl Compression for ZstdCompression {
    fn compress(&mut self, input: &[u8], output: &mut Vec<u8>) -> Result<usize> {
        output.clear();
        let Some(encoder) = self.encoder.as_mut() else {
            return Err(Error::Compress);
        };

        // flush 对应 ZSTD_e_flush，产出的前缀立即可解
        if encoder.write_all(input).is_err() || encoder.flush().is_err() {
            return Err(Error::Compress);
        }

        let produced = encoder.get_mut();
        output.extend_from_slice(produced);
        produced.clear();
        Ok(output.len())
    }

    fn bound(&self, input_size: usize) -> usize {
        // 不可压缩数据的块开销 + 帧头 + flush 尾
        input_size + (input_size >> 8) + 64
    }

    fn decompress(&mut self, input: &[u8]) -> Vec<u8> {
        if input.is_empty() {
            return Vec::new();
        }
        if is_zstd_stream_head(input) {
            self.reset_decompress_stream();
        }
        let Some(decoder) = self.decoder.as_mut() else {
            return Vec::new();
        };

        if decoder.write_all(input).is_err() || decoder.flush().is_err() {
            // 半截产物不能留给下一次调用
            decoder.get_mut().clear();
            return Vec::new();
        }

        let produced = decoder.get_mut();
        let out = produced.clone();
        produced.clear();
        out
    }

    fn reset_compress_stream(&mut self) {
        // 换新编码器开新帧，丢掉旧的历史窗口
        self.encoder = new_zstd_encoder();
    }

    fn reset_decompress_stream(&mut self) {
        self.decoder = new_zstd_decoder();
    }
}
