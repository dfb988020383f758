//! 错误类型

use thiserror::Error;

/// 引擎错误
#[derive(Error, Debug)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("compress stream failed")]
    Compress,
    #[error("cipher error: {0}")]
    Cipher(String),
    #[error("key agreement failed: {0}")]
    KeyAgreement(String),
    #[error("mmap region cannot grow to {requested} bytes")]
    Saturation { requested: usize },
    #[error("bad file format: {0}")]
    Format(String),
}

pub type Result<T> = std::result::Result<T, Error>;
