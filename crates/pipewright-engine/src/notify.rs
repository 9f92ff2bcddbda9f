use std::path::PathBuf;

use chrono::Utc;
use futures::future::BoxFuture;
use tokio::io::AsyncWriteExt;
use tracing::info;

use pipewright_core::error::Result;
use pipewright_core::traits::NotificationSink;

/// Emits notifications as tracing events.
pub struct LogNotifier;

impl NotificationSink for LogNotifier {
    fn notify(&self, title: &str, message: &str) -> BoxFuture<'_, Result<()>> {
        info!(title = %title, "{}", message);
        Box::pin(async { Ok(()) })
    }
}

/// Appends one line per notification to a file.
pub struct FileNotifier {
    path: PathBuf,
}

impl FileNotifier {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl NotificationSink for FileNotifier {
    fn notify(&self, title: &str, message: &str) -> BoxFuture<'_, Result<()>> {
        let line = format!("{} [{}] {}\n", Utc::now().to_rfc3339(), title, message);
        Box::pin(async move {
            if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(parent).await?;
            }
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await?;
            file.write_all(line.as_bytes()).await?;
            file.flush().await?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_file_notifier_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/notifications.log");
        let notifier = FileNotifier::new(&path);

        notifier.notify("Pipeline completed", "etl ok").await.unwrap();
        notifier.notify("Pipeline failed", "etl: boom").await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("[Pipeline completed] etl ok"));
        assert!(lines[1].ends_with("[Pipeline failed] etl: boom"));
    }

    #[tokio::test]
    async fn test_log_notifier_never_fails() {
        LogNotifier.notify("t", "m").await.unwrap();
    }
}
