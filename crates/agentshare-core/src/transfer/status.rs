//! 复制状态与消息格式

use serde::{Deserialize, Serialize};

/// 推送给界面的复制状态
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopyStatus {
    pub failures: Vec<String>,
    pub message: String,
    pub target: String,
}

impl CopyStatus {
    pub fn new(message: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            failures: Vec::new(),
            message: message.into(),
            target: target.into(),
        }
    }

    /// `{"file-list-status": {...}}`
    pub fn envelope(&self) -> serde_json::Value {
        serde_json::json!({ "file-list-status": self })
    }
}

/// 复制计数
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CompleteStatus {
    pub count_file: u64,
    pub failures: usize,
    pub percent: f64,
    pub written_size: u64,
}

impl CompleteStatus {
    pub fn percent_of(written: u64, total: u64) -> f64 {
        if total == 0 {
            100.0
        } else {
            #[allow(clippy::cast_precision_loss)]
            let percent = (written as f64 / total as f64) * 100.0;
            percent
        }
    }
}

fn plural(n: u64) -> &'static str {
    if n == 1 { "" } else { "s" }
}

/// 生成复制进度 / 完成消息
pub fn copy_message(status: &CompleteStatus) -> String {
    let verb = if status.percent >= 100.0 {
        "Copy".to_string()
    } else {
        format!("Copying {:.2}%", status.percent)
    };
    format!(
        "{verb} complete. {} file{} written at size {} ({} bytes) with {} integrity failure{}.",
        status.count_file,
        plural(status.count_file),
        pretty_bytes(status.written_size),
        status.written_size,
        status.failures,
        plural(status.failures as u64)
    )
}

/// 流式拉取开始时的提示
pub fn stream_start_message(file_count: u64, file_size: u64) -> String {
    format!(
        "Copy started for {file_count} file{} at {} ({file_size} bytes).",
        plural(file_count),
        pretty_bytes(file_size)
    )
}

const UNITS: [&str; 7] = ["B", "kB", "MB", "GB", "TB", "PB", "EB"];

/// 十进制单位，三位有效数字
pub fn pretty_bytes(bytes: u64) -> String {
    if bytes < 1000 {
        return format!("{bytes} B");
    }
    #[allow(clippy::cast_precision_loss)]
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1000.0 && unit < UNITS.len() - 1 {
        value /= 1000.0;
        unit += 1;
    }
    let text = if value >= 100.0 {
        format!("{value:.0}")
    } else if value >= 10.0 {
        format!("{value:.1}")
    } else {
        format!("{value:.2}")
    };
    format!("{text} {}", UNITS[unit])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pretty_bytes() {
        assert_eq!(pretty_bytes(0), "0 B");
        assert_eq!(pretty_bytes(999), "999 B");
        assert_eq!(pretty_bytes(10_000), "10.0 kB");
        assert_eq!(pretty_bytes(1_234_567), "1.23 MB");
        assert_eq!(pretty_bytes(512_000_000_000), "512 GB");
    }

    #[test]
    fn test_complete_message() {
        let status = CompleteStatus {
            count_file: 1,
            failures: 0,
            percent: 100.0,
            written_size: 10_000,
        };
        assert_eq!(
            copy_message(&status),
            "Copy complete. 1 file written at size 10.0 kB (10000 bytes) with 0 integrity failures."
        );
    }

    #[test]
    fn test_progress_message() {
        let status = CompleteStatus {
            count_file: 3,
            failures: 1,
            percent: 37.5,
            written_size: 2_000,
        };
        assert_eq!(
            copy_message(&status),
            "Copying 37.50% complete. 3 files written at size 2.00 kB (2000 bytes) with 1 integrity failure."
        );
    }

    #[test]
    fn test_stream_start_message() {
        assert_eq!(
            stream_start_message(1, 13_000_000_000),
            "Copy started for 1 file at 13.0 GB (13000000000 bytes)."
        );
    }
}
