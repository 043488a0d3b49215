//! 递归删除与剪切后的源端清理
//!
//! 删除基于目录枚举得到的 arena：每个节点记录父下标与剩余子节点数，
//! 叶子先删，父节点在计数归零时入队，根节点最后删除。

use super::manifest::{EntryKind, ManifestEntry};
use crate::directory::{self, DirectoryList, ItemKind, ListOptions};
use log::{debug, warn};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// 删除统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemoveSummary {
    pub directories: u64,
    pub files: u64,
    pub links: u64,
    pub size: u64,
}

/// 类似 `rm -rf`，路径不存在视为成功
pub async fn remove(path: PathBuf) -> std::io::Result<RemoveSummary> {
    match tokio::task::spawn_blocking(move || remove_blocking(&path)).await {
        Ok(result) => result,
        Err(e) => Err(std::io::Error::other(e)),
    }
}

pub fn remove_blocking(path: &Path) -> std::io::Result<RemoveSummary> {
    let list = directory::list_blocking(path, &ListOptions::default());
    remove_list(&list)
}

fn remove_list(list: &DirectoryList) -> std::io::Result<RemoveSummary> {
    let mut summary = RemoveSummary::default();
    if list.items.is_empty() {
        return Ok(summary);
    }
    let mut remaining: Vec<usize> = list.items.iter().map(|i| i.children).collect();
    let mut ready: Vec<usize> = list
        .items
        .iter()
        .enumerate()
        .filter(|(_, item)| item.kind != ItemKind::Directory || item.children == 0)
        .map(|(index, _)| index)
        .collect();

    while let Some(index) = ready.pop() {
        let item = &list.items[index];
        match item.kind {
            ItemKind::Directory => {
                remove_dir_retry(&item.path)?;
                summary.directories += 1;
            }
            ItemKind::File | ItemKind::Link => {
                ignore_missing(std::fs::remove_file(&item.path))?;
                if item.kind == ItemKind::File {
                    summary.files += 1;
                    summary.size += item.size();
                } else {
                    summary.links += 1;
                }
            }
        }
        if index == 0 {
            break;
        }
        let parent = item.parent;
        remaining[parent] = remaining[parent].saturating_sub(1);
        if remaining[parent] == 0 {
            ready.push(parent);
        }
    }
    Ok(summary)
}

/// 目录非空时立即重试一次该目录（可能有并发写入刚刚完成）
fn remove_dir_retry(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_dir(path) {
        Err(e) if e.kind() == ErrorKind::DirectoryNotEmpty => {
            debug!("Directory {:?} not empty, retrying removal", path);
            ignore_missing(std::fs::remove_dir(path))
        }
        other => ignore_missing(other),
    }
}

fn ignore_missing(result: std::io::Result<()>) -> std::io::Result<()> {
    match result {
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// 剪切清理：逐条顺序删除，目录仅在已为空时删除
///
/// 返回未能删除的路径。
pub async fn remove_cut_entries(entries: &[ManifestEntry]) -> Vec<String> {
    let mut failed = Vec::new();
    for entry in entries {
        let path = PathBuf::from(&entry.path);
        let result = match entry.kind {
            EntryKind::File => remove(path).await.map(|_| ()),
            EntryKind::Directory => match is_empty_dir(&path).await {
                Ok(true) => remove(path).await.map(|_| ()),
                Ok(false) => {
                    debug!("Skipping non-empty directory {}", entry.path);
                    continue;
                }
                Err(e) => Err(e),
            },
        };
        if let Err(e) = result {
            warn!("Failed to remove {}: {}", entry.path, e);
            failed.push(entry.path.clone());
        }
    }
    failed
}

async fn is_empty_dir(path: &Path) -> std::io::Result<bool> {
    let mut entries = tokio::fs::read_dir(path).await?;
    Ok(entries.next_entry().await?.is_none())
}
