//! 摘要计算
//!
//! 文件完整性校验与代理 / 共享标识都使用十六进制摘要（默认 SHA-512，128 个字符）。

use crate::agent::ShareType;
use crate::config::HashAlgorithm;
use sha2::{Digest, Sha256, Sha512};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::io::AsyncReadExt;

const READ_CHUNK: usize = 64 * 1024;

enum Hasher {
    Sha512(Sha512),
    Sha256(Sha256),
}

impl Hasher {
    fn new(algorithm: HashAlgorithm) -> Self {
        match algorithm {
            HashAlgorithm::Sha512 => Hasher::Sha512(Sha512::new()),
            HashAlgorithm::Sha256 => Hasher::Sha256(Sha256::new()),
        }
    }

    fn update(&mut self, data: &[u8]) {
        match self {
            Hasher::Sha512(h) => h.update(data),
            Hasher::Sha256(h) => h.update(data),
        }
    }

    fn finish(self) -> String {
        match self {
            Hasher::Sha512(h) => to_hex(&h.finalize()),
            Hasher::Sha256(h) => to_hex(&h.finalize()),
        }
    }
}

fn to_hex(bytes: &[u8]) -> String {
    use std::fmt::Write;
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut s, b| {
        let _ = write!(s, "{b:02x}");
        s
    })
}

/// 计算内存数据的摘要
pub fn digest(algorithm: HashAlgorithm, data: &[u8]) -> String {
    let mut hasher = Hasher::new(algorithm);
    hasher.update(data);
    hasher.finish()
}

/// 分块读取并计算文件摘要
pub async fn digest_file(algorithm: HashAlgorithm, path: &Path) -> std::io::Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Hasher::new(algorithm);
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finish())
}

/// 本机用户与设备的标识哈希
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct IdentityHashes {
    pub device: String,
    pub user: String,
}

/// 由用户名、主机名、系统类型与高精度时钟派生本机标识
///
/// 用户哈希先生成，设备哈希再由用户哈希与设备名派生。
pub fn identity_hashes(name_user: &str, name_device: &str) -> IdentityHashes {
    let host = crate::config::get_default_device_name();
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    let seed = format!(
        "{name_user}{host}{}{}{nanos}",
        std::env::consts::OS,
        std::env::consts::ARCH
    );
    let user = digest(HashAlgorithm::Sha512, seed.as_bytes());
    let device = digest(HashAlgorithm::Sha512, format!("{user}{name_device}").as_bytes());
    IdentityHashes { device, user }
}

/// 共享标识：用户哈希 + 设备哈希 + 类型 + 路径
pub fn share_hash(hash_user: &str, hash_device: &str, share_type: ShareType, path: &str) -> String {
    digest(
        HashAlgorithm::Sha512,
        format!("{hash_user}{hash_device}{}{path}", share_type.name()).as_bytes(),
    )
}
