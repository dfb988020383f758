//! 日志文件离线解码
//!
//! 持服务端私钥的一方读回流程：块头公钥 + 私钥重建共享密钥，
//! 逐条目帧解密，再喂给流式解压器（块首条目自带 zlib 头触发
//! 解码器重置），最后按 TLV 还原记录。

use std::fs;
use std::path::Path;

use tracing::warn;

use crate::compress::{self, Compression};
use crate::constants::{
    CHUNK_HEADER_SIZE, CHUNK_MAGIC, ITEM_HEADER_SIZE, ITEM_MAGIC, PUBLIC_KEY_LEN,
};
use crate::crypt::{self, AesCrypt, Crypt};
use crate::error::{Error, Result};
use crate::record::{decode_record, LogRecord};

/// 单个块的概要，不需要密钥即可统计
#[derive(Debug, Clone)]
pub struct ChunkInfo {
    pub offset: u64,
    pub payload_size: u64,
    pub item_count: usize,
    pub session_key_hex: String,
}

/// 严格解码：任何损坏都报错
pub fn read_file<P: AsRef<Path>>(path: P, server_private_key: &[u8]) -> Result<Vec<LogRecord>> {
    let data = fs::read(path.as_ref())?;
    let (records, errors) = decode_bytes(&data, server_private_key);
    if errors > 0 {
        return Err(Error::Format(format!(
            "{}: {} undecodable chunks/items",
            path.as_ref().display(),
            errors
        )));
    }
    Ok(records)
}

/// 容错解码：跳过损坏部分，返回 (记录, 错误数)
pub fn read_file_tolerant<P: AsRef<Path>>(
    path: P,
    server_private_key: &[u8],
) -> (Vec<LogRecord>, usize) {
    let data = match fs::read(path.as_ref()) {
        Ok(data) => data,
        Err(err) => {
            warn!("decode: read {} failed: {}", path.as_ref().display(), err);
            return (Vec::new(), 1);
        }
    };
    decode_bytes(&data, server_private_key)
}

/// 不解密，只走块框架统计条目
pub fn scan_file<P: AsRef<Path>>(path: P) -> Result<Vec<ChunkInfo>> {
    let data = fs::read(path.as_ref())?;
    let mut chunks = Vec::new();
    let mut pos = 0usize;
    while pos + CHUNK_HEADER_SIZE <= data.len() {
        let magic = read_u64(&data, pos);
        if magic != CHUNK_MAGIC {
            return Err(Error::Format(format!("bad chunk magic at offset {pos}")));
        }
        let payload_size = read_u64(&data, pos + 8) as usize;
        let session_key = &data[pos + 16..pos + 16 + PUBLIC_KEY_LEN];
        let offset = pos as u64;
        pos += CHUNK_HEADER_SIZE;
        if pos + payload_size > data.len() {
            return Err(Error::Format(format!("truncated chunk at offset {offset}")));
        }

        let payload = &data[pos..pos + payload_size];
        pos += payload_size;

        let mut item_count = 0usize;
        let mut item_pos = 0usize;
        while item_pos + ITEM_HEADER_SIZE <= payload.len() {
            if read_u32(payload, item_pos) != ITEM_MAGIC {
                break;
            }
            let item_size = read_u32(payload, item_pos + 4) as usize;
            item_pos += ITEM_HEADER_SIZE + item_size;
            item_count += 1;
        }

        chunks.push(ChunkInfo {
            offset,
            payload_size: payload_size as u64,
            item_count,
            session_key_hex: crypt::key_to_hex(session_key),
        });
    }
    Ok(chunks)
}

fn decode_bytes(data: &[u8], server_private_key: &[u8]) -> (Vec<LogRecord>, usize) {
    let mut records = Vec::new();
    let mut errors = 0usize;
    let mut pos = 0usize;

    while pos + CHUNK_HEADER_SIZE <= data.len() {
        if read_u64(data, pos) != CHUNK_MAGIC {
            warn!("decode: bad chunk magic at offset {}", pos);
            errors += 1;
            break;
        }
        let payload_size = read_u64(data, pos + 8) as usize;
        let chunk_key = &data[pos + 16..pos + 16 + PUBLIC_KEY_LEN];
        pos += CHUNK_HEADER_SIZE;
        if pos + payload_size > data.len() {
            warn!("decode: truncated chunk, want {} bytes", payload_size);
            errors += 1;
            break;
        }
        let payload = &data[pos..pos + payload_size];
        pos += payload_size;

        match decode_chunk(payload, chunk_key, server_private_key) {
            Ok((mut chunk_records, chunk_errors)) => {
                records.append(&mut chunk_records);
                errors += chunk_errors;
            }
            Err(err) => {
                warn!("decode: chunk skipped: {}", err);
                errors += 1;
            }
        }
    }

    (records, errors)
}

fn decode_chunk(
    payload: &[u8],
    chunk_public_key: &[u8],
    server_private_key: &[u8],
) -> Result<(Vec<LogRecord>, usize)> {
    let shared_secret = crypt::compute_shared_secret(server_private_key, chunk_public_key)?;
    let cipher = AesCrypt::new(&shared_secret)?;
    // 每块是一段独立压缩流，后端看首条明文的流签名
    let mut decompressor: Option<Box<dyn Compression>> = None;

    let mut records = Vec::new();
    let mut errors = 0usize;
    let mut pos = 0usize;

    while pos + ITEM_HEADER_SIZE <= payload.len() {
        if read_u32(payload, pos) != ITEM_MAGIC {
            errors += 1;
            break;
        }
        let item_size = read_u32(payload, pos + 4) as usize;
        pos += ITEM_HEADER_SIZE;
        if pos + item_size > payload.len() {
            errors += 1;
            break;
        }
        let ciphertext = &payload[pos..pos + item_size];
        pos += item_size;

        let plain = match cipher.decrypt(ciphertext) {
            Ok(plain) => plain,
            Err(_) => {
                errors += 1;
                continue;
            }
        };
        if decompressor.is_none() {
            match compress::detect_stream(&plain) {
                Some(kind) => decompressor = Some(kind.build()),
                None => {
                    errors += 1;
                    continue;
                }
            }
        }
        let codec = match decompressor.as_mut() {
            Some(codec) => codec,
            None => {
                errors += 1;
                continue;
            }
        };
        let raw = codec.decompress(&plain);
        if raw.is_empty() {
            errors += 1;
            continue;
        }
        match decode_record(&raw) {
            Some(record) => records.push(record),
            None => errors += 1,
        }
    }

    Ok((records, errors))
}

fn read_u32(data: &[u8], offset: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&data[offset..offset + 4]);
    u32::from_le_bytes(bytes)
}

fn read_u64(data: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&data[offset..offset + 8]);
    u64::from_le_bytes(bytes)
}
