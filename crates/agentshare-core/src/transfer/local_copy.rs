//! 同一代理上的复制

use super::manifest::{EntryKind, TransferManifest};
use super::status::{CompleteStatus, copy_message};
use log::{debug, warn};
use std::path::{Path, PathBuf};

/// 同代理复制的结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalCopyOutcome {
    pub count_file: u64,
    pub written_size: u64,
    pub failures: Vec<String>,
}

impl LocalCopyOutcome {
    pub fn message(&self) -> String {
        copy_message(&CompleteStatus {
            count_file: self.count_file,
            failures: self.failures.len(),
            percent: 100.0,
            written_size: self.written_size,
        })
    }
}

/// 解析路径的真实位置；尚不存在的尾部各段按原样接在最近的已存在祖先之后
async fn resolve(path: &Path) -> PathBuf {
    let mut existing = path.to_path_buf();
    let mut missing = Vec::new();
    loop {
        if let Ok(real) = tokio::fs::canonicalize(&existing).await {
            return missing.iter().rev().fold(real, |acc, part| acc.join(part));
        }
        match (existing.file_name(), existing.parent()) {
            (Some(name), Some(parent)) => {
                missing.push(name.to_os_string());
                existing = parent.to_path_buf();
            }
            _ => return path.to_path_buf(),
        }
    }
}

/// 目标目录就是源所在目录（会覆盖源自身），或位于源目录之内
async fn overlaps(location: &str, destination: &Path) -> bool {
    let Ok(source) = tokio::fs::canonicalize(location).await else {
        return false;
    };
    destination.starts_with(&source) || source.parent() == Some(destination)
}

/// 将每个源路径复制到目标目录下
///
/// 清单先于写入生成。与目标目录重叠的源整体拒绝并记为失败，不会写入任何条目。
pub async fn copy_same_agent(locations: &[String], destination: &Path) -> LocalCopyOutcome {
    let resolved = resolve(destination).await;
    let mut outcome = LocalCopyOutcome::default();
    let mut accepted = Vec::with_capacity(locations.len());
    for location in locations {
        if overlaps(location, &resolved).await {
            warn!("Refusing to copy {} into {:?}", location, destination);
            outcome.failures.push(location.clone());
        } else {
            accepted.push(location.clone());
        }
    }

    let manifest = TransferManifest::build(&accepted, String::new()).await;
    let mut failed_dirs: Vec<String> = Vec::new();

    for entry in &manifest.list {
        if failed_dirs
            .iter()
            .any(|dir| entry.relative.starts_with(&format!("{dir}/")))
        {
            outcome.failures.push(entry.relative.clone());
            continue;
        }
        let target = destination.join(&entry.relative);
        match entry.kind {
            EntryKind::Directory => {
                if let Err(e) = tokio::fs::create_dir_all(&target).await {
                    warn!("Failed to create directory {:?}: {}", target, e);
                    failed_dirs.push(entry.relative.clone());
                    outcome.failures.push(entry.relative.clone());
                }
            }
            EntryKind::File => match tokio::fs::copy(&entry.path, &target).await {
                Ok(written) => {
                    outcome.count_file += 1;
                    outcome.written_size += written;
                }
                Err(e) => {
                    warn!("Failed to copy {} to {:?}: {}", entry.path, target, e);
                    outcome.failures.push(entry.relative.clone());
                }
            },
        }
    }
    debug!(
        "Local copy wrote {} file(s) into {:?}",
        outcome.count_file, destination
    );
    outcome
}
