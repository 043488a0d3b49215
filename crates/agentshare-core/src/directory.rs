//! 目录枚举
//!
//! 将一棵路径树展开为扁平的条目数组。每个条目记录父条目下标与直接子条目数，
//! 整个列表即一个以下标相连的 arena，复制（自顶向下）与删除（自底向上）都基于它。
//!
//! 序列化格式为元组：
//! `[absolutePath, kind, relativePathOrSearchMatch, parentIndex, childCount, stat|null]`

use serde::ser::SerializeTuple;
use serde::{Serialize, Serializer};
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

/// 条目类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemKind {
    Directory,
    File,
    Link,
}

/// 精简的 stat 信息
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemStat {
    pub size: u64,
    pub mtime_ms: u64,
    pub mode: u32,
}

/// 单个条目
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryItem {
    pub path: PathBuf,
    pub kind: ItemKind,
    /// 相对根的路径；搜索模式下为匹配到的文件名
    pub relative: String,
    /// 父条目下标，根条目指向自身
    pub parent: usize,
    /// 已列出的直接子条目数
    pub children: usize,
    pub stat: Option<ItemStat>,
}

impl DirectoryItem {
    pub fn size(&self) -> u64 {
        self.stat.as_ref().map_or(0, |s| s.size)
    }
}

impl Serialize for DirectoryItem {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut tuple = serializer.serialize_tuple(6)?;
        tuple.serialize_element(&self.path.to_string_lossy())?;
        tuple.serialize_element(&self.kind)?;
        tuple.serialize_element(&self.relative)?;
        tuple.serialize_element(&self.parent)?;
        tuple.serialize_element(&self.children)?;
        tuple.serialize_element(&self.stat)?;
        tuple.end()
    }
}

/// 列表模式
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListMode {
    Read,
    /// 仅保留文件名包含该字符串（忽略大小写）的条目
    Search(String),
}

/// 列表参数
#[derive(Debug, Clone)]
pub struct ListOptions {
    /// 层数，根为第 1 层；0 表示不限
    pub depth: u64,
    pub mode: ListMode,
    /// 为 true 时不跟随符号链接
    pub symbolic: bool,
}

impl Default for ListOptions {
    fn default() -> Self {
        Self {
            depth: 0,
            mode: ListMode::Read,
            symbolic: true,
        }
    }
}

/// 列表结果
#[derive(Debug, Clone, Default, Serialize)]
pub struct DirectoryList {
    pub items: Vec<DirectoryItem>,
    /// 无法读取的路径
    pub failures: Vec<String>,
}

impl DirectoryList {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// 在阻塞线程池中枚举
pub async fn list(root: PathBuf, options: ListOptions) -> DirectoryList {
    let fallback = root.to_string_lossy().to_string();
    match tokio::task::spawn_blocking(move || list_blocking(&root, &options)).await {
        Ok(list) => list,
        Err(e) => {
            log::error!("Directory listing task failed: {}", e);
            DirectoryList {
                items: Vec::new(),
                failures: vec![fallback],
            }
        }
    }
}

/// 同步枚举（广度优先，父条目总在子条目之前）
pub fn list_blocking(root: &Path, options: &ListOptions) -> DirectoryList {
    let mut result = DirectoryList::default();
    let Some(root_item) = stat_item(root, String::new(), 0, options.symbolic) else {
        result.failures.push(root.to_string_lossy().to_string());
        return result;
    };
    result.items.push(root_item);

    // (条目下标, 层数)
    let mut queue = VecDeque::from([(0usize, 1u64)]);
    while let Some((index, level)) = queue.pop_front() {
        if result.items[index].kind != ItemKind::Directory {
            continue;
        }
        if options.depth != 0 && level >= options.depth {
            continue;
        }
        let dir = result.items[index].path.clone();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(_) => {
                result.failures.push(dir.to_string_lossy().to_string());
                continue;
            }
        };
        let mut paths: Vec<PathBuf> = entries.filter_map(|e| e.ok().map(|e| e.path())).collect();
        paths.sort();

        let mut count = 0;
        for path in paths {
            let relative = path
                .strip_prefix(root)
                .map(|p| p.to_string_lossy().to_string())
                .unwrap_or_default();
            match stat_item(&path, relative, index, options.symbolic) {
                Some(item) => {
                    queue.push_back((result.items.len(), level + 1));
                    result.items.push(item);
                    count += 1;
                }
                None => result.failures.push(path.to_string_lossy().to_string()),
            }
        }
        result.items[index].children = count;
    }

    if let ListMode::Search(term) = &options.mode {
        result.items = search_filter(result.items, term);
    }
    result
}

fn stat_item(path: &Path, relative: String, parent: usize, symbolic: bool) -> Option<DirectoryItem> {
    let meta = if symbolic {
        fs::symlink_metadata(path)
    } else {
        fs::metadata(path)
    }
    .ok()?;
    let kind = if meta.file_type().is_symlink() {
        ItemKind::Link
    } else if meta.is_dir() {
        ItemKind::Directory
    } else {
        ItemKind::File
    };
    let mtime_ms = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX));
    Some(DirectoryItem {
        path: path.to_path_buf(),
        kind,
        relative,
        parent,
        children: 0,
        stat: Some(ItemStat {
            size: if kind == ItemKind::File { meta.len() } else { 0 },
            mtime_ms,
            mode: mode_of(&meta),
        }),
    })
}

#[cfg(unix)]
fn mode_of(meta: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode()
}

#[cfg(not(unix))]
fn mode_of(meta: &fs::Metadata) -> u32 {
    if meta.permissions().readonly() { 0o444 } else { 0o666 }
}

/// 搜索模式下的结果不再构成树，父下标与子计数清零
fn search_filter(items: Vec<DirectoryItem>, term: &str) -> Vec<DirectoryItem> {
    let needle = term.to_lowercase();
    items
        .into_iter()
        .skip(1)
        .filter_map(|mut item| {
            let name = item.path.file_name()?.to_string_lossy().to_string();
            if !name.to_lowercase().contains(&needle) {
                return None;
            }
            item.relative = name;
            item.parent = 0;
            item.children = 0;
            Some(item)
        })
        .collect()
}
