//! 日志记录二进制编码
//!
//! TLV 线格式（与 protobuf 线格式兼容），编码端与解码端共用同一张字段表：
//!
//! | 字段 | tag | 线类型 |
//! |------|-----|--------|
//! | level | 1 | varint |
//! | timestamp_ms | 2 | varint |
//! | pid | 3 | varint |
//! | tid | 4 | varint |
//! | line | 5 | varint |
//! | file_name | 6 | length-delimited |
//! | func_name | 7 | length-delimited |
//! | content | 8 | length-delimited |
//!
//! key = (tag << 3) | wire_type，字段按 tag 升序写出。

use chrono::Utc;

use crate::common::{process_id, thread_id, LogMsg};

const WIRE_VARINT: u64 = 0;
const WIRE_LEN: u64 = 2;

const TAG_LEVEL: u64 = 1;
const TAG_TIMESTAMP: u64 = 2;
const TAG_PID: u64 = 3;
const TAG_TID: u64 = 4;
const TAG_LINE: u64 = 5;
const TAG_FILE_NAME: u64 = 6;
const TAG_FUNC_NAME: u64 = 7;
const TAG_CONTENT: u64 = 8;

/// 解码后的完整记录
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogRecord {
    pub level: i32,
    pub timestamp_ms: i64,
    pub pid: i32,
    pub tid: i32,
    pub line: u32,
    pub file_name: String,
    pub func_name: String,
    pub content: Vec<u8>,
}

impl LogRecord {
    /// 消息内容按 UTF-8 解释
    pub fn content_text(&self) -> String {
        String::from_utf8_lossy(&self.content).into_owned()
    }
}

impl std::fmt::Display for LogRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let level = crate::LogLevel::from_i32(self.level)
            .map(|l| l.as_str())
            .unwrap_or("?");
        write!(
            f,
            "[{}][{}][{}:{}][{}:{} {}] {}",
            self.timestamp_ms,
            level,
            self.pid,
            self.tid,
            self.file_name,
            self.line,
            self.func_name,
            self.content_text()
        )
    }
}

fn put_varint(buf: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            buf.push(byte);
            break;
        }
        buf.push(byte | 0x80);
    }
}

fn put_field_varint(buf: &mut Vec<u8>, tag: u64, value: u64) {
    put_varint(buf, (tag << 3) | WIRE_VARINT);
    put_varint(buf, value);
}

fn put_field_bytes(buf: &mut Vec<u8>, tag: u64, value: &[u8]) {
    put_varint(buf, (tag << 3) | WIRE_LEN);
    put_varint(buf, value.len() as u64);
    buf.extend_from_slice(value);
}

fn get_varint(data: &[u8], pos: &mut usize) -> Option<u64> {
    let mut value = 0u64;
    let mut shift = 0u32;
    loop {
        let byte = *data.get(*pos)?;
        *pos += 1;
        if shift >= 64 {
            return None;
        }
        value |= u64::from(byte & 0x7F) << shift;
        if byte & 0x80 == 0 {
            return Some(value);
        }
        shift += 7;
    }
}

/// 将事件编码到 buf（buf 先清空）
///
/// 时间戳、pid、tid 在编码时采样，与调用线程绑定。
pub fn encode_msg(msg: &LogMsg<'_>, buf: &mut Vec<u8>) {
    buf.clear();
    put_field_varint(buf, TAG_LEVEL, msg.level as i32 as u64);
    put_field_varint(buf, TAG_TIMESTAMP, Utc::now().timestamp_millis() as u64);
    put_field_varint(buf, TAG_PID, process_id() as u64);
    put_field_varint(buf, TAG_TID, thread_id() as u64);
    put_field_varint(buf, TAG_LINE, u64::from(msg.location.line));
    put_field_bytes(buf, TAG_FILE_NAME, msg.location.file_name.as_bytes());
    put_field_bytes(buf, TAG_FUNC_NAME, msg.location.func_name.as_bytes());
    put_field_bytes(buf, TAG_CONTENT, msg.message.as_bytes());
}

/// 从字节解码一条记录，格式损坏返回 None
///
/// 未知 tag 按线类型跳过，保持前向兼容。
pub fn decode_record(data: &[u8]) -> Option<LogRecord> {
    let mut record = LogRecord::default();
    let mut pos = 0usize;

    while pos < data.len() {
        let key = get_varint(data, &mut pos)?;
        let tag = key >> 3;
        let wire = key & 0x07;
        match wire {
            WIRE_VARINT => {
                let value = get_varint(data, &mut pos)?;
                match tag {
                    TAG_LEVEL => record.level = value as i32,
                    TAG_TIMESTAMP => record.timestamp_ms = value as i64,
                    TAG_PID => record.pid = value as i32,
                    TAG_TID => record.tid = value as i32,
                    TAG_LINE => record.line = value as u32,
                    _ => {}
                }
            }
            WIRE_LEN => {
                let len = get_varint(data, &mut pos)? as usize;
                let end = pos.checked_add(len)?;
                if end > data.len() {
                    return None;
                }
                let bytes = &data[pos..end];
                pos = end;
                match tag {
                    TAG_FILE_NAME => record.file_name = String::from_utf8_lossy(bytes).into_owned(),
                    TAG_FUNC_NAME => record.func_name = String::from_utf8_lossy(bytes).into_owned(),
                    TAG_CONTENT => record.content = bytes.to_vec(),
                    _ => {}
                }
            }
            _ => return None,
        }
    }

    Some(record)
}
