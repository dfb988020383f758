//! 内存映射暂存区
//!
//! 文件映射为共享可写内存，进程崩溃后由操作系统负责回写，
//! 下次打开时依靠头部魔数识别残留数据。
//!
//! 文件布局见 [`crate::constants::REGION_HEADER_SIZE`]，所有多字节字段小端。

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use memmap2::{MmapMut, MmapOptions};

use crate::constants::{
    DEFAULT_REGION_CAPACITY, REGION_HEADER_SIZE, REGION_KEY_SLOT, REGION_MAGIC,
};
use crate::error::{Error, Result};

const MAGIC_OFFSET: usize = 0;
const KEY_LEN_OFFSET: usize = 4;
const SIZE_OFFSET: usize = 8;
const KEY_OFFSET: usize = 16;

/// 文件背书的字节暂存区
pub struct MmapRegion {
    path: PathBuf,
    file: File,
    map: MmapMut,
    capacity: usize,
}

impl MmapRegion {
    /// 打开或创建暂存区文件
    ///
    /// 容量取 max(文件大小, 512K) 并向上取页倍数。魔数缺失视为
    /// 新文件，初始化 size = 0。
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        let file_size = file.metadata()?.len() as usize;
        let capacity = round_to_page(file_size.max(DEFAULT_REGION_CAPACITY));
        if file_size != capacity {
            file.set_len(capacity as u64)?;
        }

        let map = map_file(&file, capacity)?;

        let mut region = Self {
            path,
            file,
            map,
            capacity,
        };
        if region.read_u32(MAGIC_OFFSET) != REGION_MAGIC {
            region.write_u32(MAGIC_OFFSET, REGION_MAGIC);
            region.write_u32(KEY_LEN_OFFSET, 0);
            region.write_u64(SIZE_OFFSET, 0);
        }
        Ok(region)
    }

    /// 当前负载大小
    pub fn size(&self) -> usize {
        let size = self.read_u64(SIZE_OFFSET) as usize;
        // 头部损坏时避免越界
        size.min(self.capacity - REGION_HEADER_SIZE)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// 负载占可用空间的比例
    pub fn ratio(&self) -> f64 {
        let avail = (self.capacity - REGION_HEADER_SIZE) as f64;
        if avail > 0.0 {
            self.size() as f64 / avail
        } else {
            0.0
        }
    }

    /// 负载字节，扩容后之前取得的切片失效
    pub fn data(&self) -> &[u8] {
        let size = self.size();
        &self.map[REGION_HEADER_SIZE..REGION_HEADER_SIZE + size]
    }

    /// 末尾追加，容量不足先扩容
    pub fn push(&mut self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let size = self.size();
        self.reserve(REGION_HEADER_SIZE + size + data.len())?;
        let start = REGION_HEADER_SIZE + size;
        self.map[start..start + data.len()].copy_from_slice(data);
        self.write_u64(SIZE_OFFSET, (size + data.len()) as u64);
        Ok(())
    }

    /// 调整负载大小，扩容与否都更新 size
    pub fn resize(&mut self, new_size: usize) -> Result<()> {
        self.reserve(REGION_HEADER_SIZE + new_size)?;
        self.write_u64(SIZE_OFFSET, new_size as u64);
        Ok(())
    }

    /// 清空负载，容量不回收
    pub fn clear(&mut self) {
        self.write_u64(SIZE_OFFSET, 0);
    }

    /// 记录写入方的会话公钥，随数据一起持久化
    pub fn set_session_key(&mut self, key: &[u8]) {
        let len = key.len().min(REGION_KEY_SLOT);
        self.write_u32(KEY_LEN_OFFSET, len as u32);
        self.map[KEY_OFFSET..KEY_OFFSET + len].copy_from_slice(&key[..len]);
        for byte in &mut self.map[KEY_OFFSET + len..KEY_OFFSET + REGION_KEY_SLOT] {
            *byte = 0;
        }
    }

    /// 数据写入方的会话公钥，未记录时返回 None
    pub fn session_key(&self) -> Option<&[u8]> {
        let len = self.read_u32(KEY_LEN_OFFSET) as usize;
        if len == 0 || len > REGION_KEY_SLOT {
            return None;
        }
        Some(&self.map[KEY_OFFSET..KEY_OFFSET + len])
    }

    /// 确保总容量不小于 target，扩容策略 follow vector：
    /// new = old + max(old, target取页倍数)
    fn reserve(&mut self, target: usize) -> Result<()> {
        let target = round_to_page(target);
        if target <= self.capacity {
            return Ok(());
        }

        let new_capacity = self.capacity + self.capacity.max(target);
        self.file.set_len(new_capacity as u64)?;
        let map = map_file(&self.file, new_capacity).map_err(|err| {
            tracing::warn!(
                "MmapRegion::reserve: remap {} to {} bytes failed: {}",
                self.path.display(),
                new_capacity,
                err
            );
            Error::Saturation { requested: target }
        })?;
        // 旧映射在赋值时解除
        self.map = map;
        self.capacity = new_capacity;
        Ok(())
    }

    fn read_u32(&self, offset: usize) -> u32 {
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&self.map[offset..offset + 4]);
        u32::from_le_bytes(bytes)
    }

    fn write_u32(&mut self, offset: usize, value: u32) {
        self.map[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn read_u64(&self, offset: usize) -> u64 {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&self.map[offset..offset + 8]);
        u64::from_le_bytes(bytes)
    }

    fn write_u64(&mut self, offset: usize, value: u64) {
        self.map[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
    }
}

fn round_to_page(size: usize) -> usize {
    let page = page_size::get();
    size.div_ceil(page) * page
}

fn map_file(file: &File, capacity: usize) -> Result<MmapMut> {
    // 共享映射，内核负责落盘
    let map = unsafe { MmapOptions::new().len(capacity).map_mut(file)? };
    Ok(map)
}
