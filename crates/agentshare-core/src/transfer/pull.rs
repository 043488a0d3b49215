//! 文件拉取循环
//!
//! 目标端按清单顺序先创建目录，再向源端逐个请求文件：
//!
//! - 缓冲模式：最多 [`MAX_IN_FLIGHT`] 个请求同时在途，每完成一个补一个；
//!   收到完整响应后解压、计算摘要并与源端预先计算的 `hash` 头比较，不一致则记为失败并继续。
//! - 流式模式：严格串行，边解压边写盘，写完后重新读取文件计算摘要。

use super::manifest::{EntryKind, ManifestEntry, TransferManifest};
use super::status::{CompleteStatus, CopyStatus, copy_message, stream_start_message};
use super::task::{FileServiceTask, TransferStep};
use crate::broadcast::{BroadcastKind, Broadcaster};
use crate::config::HashAlgorithm;
use crate::error::TransferError;
use crate::hash;
use async_trait::async_trait;
use axum::body::Bytes;
use futures_util::stream::{BoxStream, FuturesUnordered, StreamExt};
use log::{debug, warn};
use std::collections::HashSet;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

/// 缓冲模式下单个清单的在途请求上限
pub const MAX_IN_FLIGHT: usize = 8;

/// 源端随文件返回的元数据（响应头）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMeta {
    pub hash: String,
    pub file_name: String,
    pub file_size: u64,
    pub cut_path: String,
    pub compressed: bool,
}

/// 单个文件的响应
pub struct FileResponse {
    pub meta: FileMeta,
    pub body: BoxStream<'static, Result<Bytes, TransferError>>,
}

/// 向源端请求单个文件
#[async_trait]
pub trait FileFetcher: Send + Sync {
    async fn fetch(&self, task: FileServiceTask) -> Result<FileResponse, TransferError>;
}

/// 拉取结果
#[derive(Debug, Default)]
pub struct PullOutcome {
    pub count_file: u64,
    pub count_dir: u64,
    pub written_size: u64,
    pub failures: Vec<String>,
    succeeded: HashSet<String>,
}

impl PullOutcome {
    pub fn status(&self) -> CompleteStatus {
        CompleteStatus {
            count_file: self.count_file,
            failures: self.failures.len(),
            percent: 100.0,
            written_size: self.written_size,
        }
    }

    /// 剪切时需要在源端删除的条目：清单逆序，剔除失败项
    pub fn cut_list(&self, manifest: &TransferManifest) -> Vec<ManifestEntry> {
        manifest
            .list
            .iter()
            .rev()
            .filter(|e| self.succeeded.contains(&e.relative))
            .cloned()
            .collect()
    }

    fn record_failure(&mut self, relative: &str) {
        self.failures.push(relative.to_string());
    }
}

/// 一次拉取的上下文
pub struct Puller<'a> {
    pub fetcher: &'a dyn FileFetcher,
    pub broadcaster: &'a Broadcaster,
    pub algorithm: HashAlgorithm,
    /// 源端代理，用于日志
    pub origin: String,
    pub destination: PathBuf,
    /// 为 true 时把进度写入请求 id，由源端转发给它的界面
    pub relay_progress: bool,
}

impl Puller<'_> {
    /// 界面上的目标标识
    pub fn target(&self) -> String {
        format!("local-{}", self.destination.display())
    }

    pub async fn pull(
        &self,
        manifest: &TransferManifest,
        template: &FileServiceTask,
    ) -> PullOutcome {
        let mut outcome = PullOutcome::default();
        if manifest.stream {
            self.broadcast(stream_start_message(
                manifest.file_count,
                manifest.file_size,
            ));
        }

        let mut failed_dirs: Vec<String> = Vec::new();
        let mut files = Vec::new();
        for entry in &manifest.list {
            if failed_dirs
                .iter()
                .any(|dir| entry.relative.starts_with(&format!("{dir}/")))
            {
                outcome.record_failure(&entry.relative);
                continue;
            }
            match entry.kind {
                EntryKind::Directory => {
                    let path = self.destination.join(&entry.relative);
                    match tokio::fs::create_dir_all(&path).await {
                        Ok(()) => {
                            outcome.count_dir += 1;
                            outcome.succeeded.insert(entry.relative.clone());
                        }
                        Err(e) => {
                            warn!("Failed to create directory {:?}: {}", path, e);
                            failed_dirs.push(entry.relative.clone());
                            outcome.record_failure(&entry.relative);
                        }
                    }
                }
                EntryKind::File => files.push(entry),
            }
        }

        if manifest.stream {
            for entry in files {
                let task = self.file_task(template, entry, &outcome, manifest.file_size);
                let result = self.fetch_streamed(task, entry, &outcome, manifest.file_size).await;
                self.complete(&mut outcome, entry, result, manifest.file_size);
            }
        } else {
            let mut pending = files.into_iter();
            let mut in_flight = FuturesUnordered::new();
            loop {
                while in_flight.len() < MAX_IN_FLIGHT {
                    let Some(entry) = pending.next() else { break };
                    let task = self.file_task(template, entry, &outcome, manifest.file_size);
                    in_flight.push(async move { (entry, self.fetch_buffered(task, entry).await) });
                }
                let Some((entry, result)) = in_flight.next().await else {
                    break;
                };
                self.complete(&mut outcome, entry, result, manifest.file_size);
            }
        }
        outcome
    }

    fn file_task(
        &self,
        template: &FileServiceTask,
        entry: &ManifestEntry,
        outcome: &PullOutcome,
        total: u64,
    ) -> FileServiceTask {
        let mut task = template.clone();
        task.action = template.action.step(TransferStep::File);
        task.location = vec![entry.path.clone()];
        task.file_name = Some(entry.relative.clone());
        task.depth = entry.size;
        task.manifest = None;
        if self.relay_progress {
            let status = self.progress(outcome, outcome.written_size, total);
            task.id = format!("{}|{}", self.target(), copy_message(&status));
        }
        task
    }

    fn progress(&self, outcome: &PullOutcome, written: u64, total: u64) -> CompleteStatus {
        CompleteStatus {
            count_file: outcome.count_file,
            failures: outcome.failures.len(),
            percent: CompleteStatus::percent_of(written, total),
            written_size: written,
        }
    }

    fn complete(
        &self,
        outcome: &mut PullOutcome,
        entry: &ManifestEntry,
        result: Result<u64, TransferError>,
        total: u64,
    ) {
        match result {
            Ok(written) => {
                outcome.count_file += 1;
                outcome.written_size += written;
                outcome.succeeded.insert(entry.relative.clone());
                let status = self.progress(outcome, outcome.written_size, total);
                self.broadcast(copy_message(&status));
            }
            Err(e) => {
                warn!("{}", e);
                if matches!(e, TransferError::Io { .. }) {
                    self.broadcaster.error(format!(
                        "Error writing file {} from remote agent {}",
                        entry.relative, self.origin
                    ));
                }
                outcome.record_failure(&entry.relative);
            }
        }
    }

    fn broadcast(&self, message: String) {
        self.broadcaster.send(
            BroadcastKind::FileListStatus,
            &CopyStatus::new(message, self.target()),
        );
    }

    fn mismatch(&self, entry: &ManifestEntry) -> TransferError {
        TransferError::HashMismatch {
            file: entry.relative.clone(),
            agent: self.origin.clone(),
        }
    }

    async fn fetch_buffered(
        &self,
        task: FileServiceTask,
        entry: &ManifestEntry,
    ) -> Result<u64, TransferError> {
        let FileResponse { meta, mut body } = self.fetcher.fetch(task).await?;
        let mut data = Vec::with_capacity(usize::try_from(entry.size).unwrap_or(0));
        while let Some(chunk) = body.next().await {
            data.extend_from_slice(&chunk?);
        }
        if meta.compressed {
            let mut plain = Vec::with_capacity(data.len());
            flate2::read::GzDecoder::new(&data[..])
                .read_to_end(&mut plain)
                .map_err(|e| TransferError::Protocol(format!("gzip: {e}")))?;
            data = plain;
        }
        if hash::digest(self.algorithm, &data) != meta.hash {
            return Err(self.mismatch(entry));
        }
        let path = self.destination.join(&entry.relative);
        tokio::fs::write(&path, &data)
            .await
            .map_err(|e| TransferError::io(&path, e))?;
        Ok(data.len() as u64)
    }

    async fn fetch_streamed(
        &self,
        task: FileServiceTask,
        entry: &ManifestEntry,
        outcome: &PullOutcome,
        total: u64,
    ) -> Result<u64, TransferError> {
        let path = self.destination.join(&entry.relative);
        let result = self.write_stream(task, &path, outcome, total).await;
        let verified = match result {
            Ok((written, expected)) => match hash::digest_file(self.algorithm, &path).await {
                Ok(actual) if actual == expected => Ok(written),
                Ok(_) => Err(self.mismatch(entry)),
                Err(e) => Err(TransferError::io(&path, e)),
            },
            Err(e) => Err(e),
        };
        if verified.is_err()
            && let Err(e) = tokio::fs::remove_file(&path).await
        {
            debug!("Unable to unlink rejected file {:?}: {}", path, e);
        }
        verified
    }

    /// 写入单个流式文件，返回写入字节数与期望摘要
    async fn write_stream(
        &self,
        task: FileServiceTask,
        path: &Path,
        outcome: &PullOutcome,
        total: u64,
    ) -> Result<(u64, String), TransferError> {
        let FileResponse { meta, mut body } = self.fetcher.fetch(task).await?;
        let mut file = tokio::fs::File::create(path)
            .await
            .map_err(|e| TransferError::io(path, e))?;
        let mut decoder = meta
            .compressed
            .then(|| flate2::write::GzDecoder::new(Vec::new()));
        let mut written = 0u64;
        let mut last_percent = 0u64;

        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            let plain = match decoder.as_mut() {
                Some(decoder) => {
                    decoder
                        .write_all(&chunk)
                        .map_err(|e| TransferError::Protocol(format!("gzip: {e}")))?;
                    std::mem::take(decoder.get_mut())
                }
                None => chunk.to_vec(),
            };
            file.write_all(&plain)
                .await
                .map_err(|e| TransferError::io(path, e))?;
            written += plain.len() as u64;

            let status = self.progress(outcome, outcome.written_size + written, total);
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let percent = status.percent as u64;
            if percent > last_percent {
                last_percent = percent;
                self.broadcast(copy_message(&status));
            }
        }
        if let Some(mut decoder) = decoder {
            decoder
                .try_finish()
                .map_err(|e| TransferError::Protocol(format!("gzip: {e}")))?;
            let rest = std::mem::take(decoder.get_mut());
            file.write_all(&rest)
                .await
                .map_err(|e| TransferError::io(path, e))?;
            written += rest.len() as u64;
        }
        file.flush().await.map_err(|e| TransferError::io(path, e))?;
        Ok((written, meta.hash))
    }
}
