//! 传输清单
//!
//! 清单条目按"目录在前、较短的目录在前、文件按相对路径"排序，
//! 保证逐条创建时父目录总是先于子条目落地。

use crate::directory::{self, ItemKind, ListOptions};
use log::warn;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// 单个文件超过该大小即切换为流式传输（12 GiB）
pub const STREAM_LARGEST: u64 = 12_884_901_888;
/// "大文件"阈值（4 GiB）
pub const LARGE_FILE: u64 = 4_294_967_296;
/// 大文件数量超过该值即切换为流式传输
pub const STREAM_LARGE_COUNT: u64 = 3;

/// 条目类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Directory,
    File,
}

/// 清单条目，线上格式为 `[absolutePath, kind, relativePath, byteSize]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "EntryTuple", into = "EntryTuple")]
pub struct ManifestEntry {
    pub path: String,
    pub kind: EntryKind,
    pub relative: String,
    pub size: u64,
}

#[derive(Serialize, Deserialize)]
struct EntryTuple(String, EntryKind, String, u64);

impl From<EntryTuple> for ManifestEntry {
    fn from(t: EntryTuple) -> Self {
        Self {
            path: t.0,
            kind: t.1,
            relative: t.2,
            size: t.3,
        }
    }
}

impl From<ManifestEntry> for EntryTuple {
    fn from(e: ManifestEntry) -> Self {
        EntryTuple(e.path, e.kind, e.relative, e.size)
    }
}

impl ManifestEntry {
    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }
}

/// 传输清单
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferManifest {
    pub directories: u64,
    pub file_count: u64,
    pub file_size: u64,
    pub id: String,
    pub list: Vec<ManifestEntry>,
    pub stream: bool,
}

impl TransferManifest {
    /// 由条目计算汇总字段并排序
    pub fn from_entries(id: impl Into<String>, mut list: Vec<ManifestEntry>) -> Self {
        let mut directories = 0;
        let mut file_count = 0;
        let mut file_size = 0u64;
        let mut largest = 0;
        let mut large_files = 0;
        for entry in &list {
            match entry.kind {
                EntryKind::Directory => directories += 1,
                EntryKind::File => {
                    file_count += 1;
                    file_size += entry.size;
                    largest = largest.max(entry.size);
                    if entry.size > LARGE_FILE {
                        large_files += 1;
                    }
                }
            }
        }
        sort_entries(&mut list);
        let stream = largest > STREAM_LARGEST
            || large_files > STREAM_LARGE_COUNT
            || (file_count > 0 && file_size / file_count > LARGE_FILE);
        Self {
            directories,
            file_count,
            file_size,
            id: id.into(),
            list,
            stream,
        }
    }

    /// 递归枚举所选路径生成清单
    ///
    /// 不跟随符号链接，链接本身不进入清单。
    pub async fn build(locations: &[String], id: impl Into<String>) -> Self {
        let mut entries = Vec::new();
        for location in locations {
            let root = PathBuf::from(location);
            let base = root.parent().map(Path::to_path_buf).unwrap_or_default();
            let listing = directory::list(root, ListOptions::default()).await;
            for failure in &listing.failures {
                warn!("Unable to read {} while building a transfer list", failure);
            }
            for item in listing.items {
                let kind = match item.kind {
                    ItemKind::Directory => EntryKind::Directory,
                    ItemKind::File => EntryKind::File,
                    ItemKind::Link => continue,
                };
                let relative = item
                    .path
                    .strip_prefix(&base)
                    .map(|p| p.to_string_lossy().to_string())
                    .unwrap_or_else(|_| item.relative.clone());
                entries.push(ManifestEntry {
                    path: item.path.to_string_lossy().to_string(),
                    kind,
                    size: if kind == EntryKind::File { item.size() } else { 0 },
                    relative,
                });
            }
        }
        Self::from_entries(id, entries)
    }

    /// 源端所选条目的公共父目录（剪切后重新挂载监听用）
    pub fn origin_root(&self) -> Option<String> {
        let first = self.list.first()?;
        let root = first.path.strip_suffix(&first.relative)?;
        Some(root.trim_end_matches(['/', '\\']).to_string())
    }
}

/// 目录在前；目录之间较短的相对路径在前；文件之间按相对路径排序
pub fn sort_entries(list: &mut [ManifestEntry]) {
    list.sort_by(|a, b| match (a.is_dir(), b.is_dir()) {
        (true, false) => std::cmp::Ordering::Less,
        (false, true) => std::cmp::Ordering::Greater,
        (true, true) => a
            .relative
            .len()
            .cmp(&b.relative.len())
            .then_with(|| a.relative.cmp(&b.relative)),
        (false, false) => a.relative.cmp(&b.relative),
    });
}
