//! 会话加密
//!
//! 对称部分为 AES-128-CBC + PKCS7 填充，IV 为会话固定值；每次
//! encrypt 调用把输入当作一条完整消息独立成链。密钥来自 secp256r1
//! ECDH 协商的共享密钥前 16 字节，公钥使用 SEC1 未压缩编码。

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::{ecdh, PublicKey, SecretKey};
use rand_core::OsRng;

use crate::constants::{AES_BLOCK_LEN, AES_IV, AES_KEY_LEN};
use crate::error::{Error, Result};

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;

/// 对称加密能力接口
pub trait Crypt: Send + Sync {
    /// 输出长度恒为 align_up(len + 1, 16)
    fn encrypt(&self, plain: &[u8]) -> Vec<u8>;

    /// 填充非法时报错，不吞成空串
    fn decrypt(&self, cipher: &[u8]) -> Result<Vec<u8>>;
}

/// AES-128-CBC 会话加密器
pub struct AesCrypt {
    key: [u8; AES_KEY_LEN],
    iv: [u8; AES_BLOCK_LEN],
}

impl AesCrypt {
    /// 共享密钥长于 16 字节时取前 16 字节
    pub fn new(shared_secret: &[u8]) -> Result<Self> {
        if shared_secret.len() < AES_KEY_LEN {
            return Err(Error::Cipher(format!(
                "shared secret too short: {} bytes",
                shared_secret.len()
            )));
        }
        let mut key = [0u8; AES_KEY_LEN];
        key.copy_from_slice(&shared_secret[..AES_KEY_LEN]);
        Ok(Self { key, iv: AES_IV })
    }
}

impl Crypt for AesCrypt {
    fn encrypt(&self, plain: &[u8]) -> Vec<u8> {
        Aes128CbcEnc::new(&self.key.into(), &self.iv.into())
            .encrypt_padded_vec_mut::<Pkcs7>(plain)
    }

    fn decrypt(&self, cipher: &[u8]) -> Result<Vec<u8>> {
        Aes128CbcDec::new(&self.key.into(), &self.iv.into())
            .decrypt_padded_vec_mut::<Pkcs7>(cipher)
            .map_err(|_| Error::Cipher("invalid padding".into()))
    }
}

/// 生成临时密钥对，返回 (私钥标量, SEC1 未压缩公钥)
pub fn generate_key_pair() -> (Vec<u8>, Vec<u8>) {
    let secret = SecretKey::random(&mut OsRng);
    let public = secret.public_key();
    (
        secret.to_bytes().to_vec(),
        public.to_encoded_point(false).as_bytes().to_vec(),
    )
}

/// ECDH 共享密钥（曲线点 x 坐标, 32 字节）
pub fn compute_shared_secret(private_key: &[u8], peer_public_key: &[u8]) -> Result<Vec<u8>> {
    let secret = SecretKey::from_slice(private_key)
        .map_err(|err| Error::KeyAgreement(format!("bad private key: {err}")))?;
    let public = PublicKey::from_sec1_bytes(peer_public_key)
        .map_err(|err| Error::KeyAgreement(format!("bad peer public key: {err}")))?;
    let shared = ecdh::diffie_hellman(secret.to_nonzero_scalar(), public.as_affine());
    Ok(shared.raw_secret_bytes().to_vec())
}

/// 密钥二进制转大写十六进制
pub fn key_to_hex(key: &[u8]) -> String {
    hex::encode_upper(key)
}

/// 十六进制转密钥二进制，大小写均接受
pub fn hex_to_key(hex_key: &str) -> Result<Vec<u8>> {
    hex::decode(hex_key.trim())
        .map_err(|err| Error::KeyAgreement(format!("bad hex key: {err}")))
}
