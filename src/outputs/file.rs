//! Newline-delimited JSON events to a file or stdout. Mostly useful for
//! debugging pipelines and for tests.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use super::{OutputConfig, Sink};
use crate::event::EventMsg;
use crate::shutdown::ShutdownSignal;

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct FileOutputConfig {
    /// Absent means stdout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

#[async_trait]
#[typetag::serde(name = "file")]
impl OutputConfig for FileOutputConfig {
    async fn build(&self, _name: &str, _shutdown: ShutdownSignal) -> crate::Result<Arc<dyn Sink>> {
        let writer = match &self.path {
            Some(path) => {
                let file = tokio::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .await
                    .map_err(|err| format!("open {}: {err}", path.display()))?;

                Writer::File(Mutex::new(file))
            }
            None => Writer::Stdout,
        };

        Ok(Arc::new(FileSink { writer }))
    }
}

enum Writer {
    File(Mutex<tokio::fs::File>),
    Stdout,
}

struct FileSink {
    writer: Writer,
}

#[async_trait]
impl Sink for FileSink {
    async fn write_batch(&self, batch: Vec<EventMsg>) -> crate::Result<()> {
        let mut content = Vec::new();
        for event in &batch {
            serde_json::to_writer(&mut content, event)?;
            content.push(b'\n');
        }

        match &self.writer {
            Writer::File(file) => {
                let mut file = file.lock().await;
                file.write_all(&content).await?;
                file.flush().await?;
            }
            Writer::Stdout => {
                let mut stdout = tokio::io::stdout();
                stdout.write_all(&content).await?;
                stdout.flush().await?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Value;

    #[tokio::test]
    async fn writes_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.json");

        let config = FileOutputConfig {
            path: Some(path.clone()),
        };
        let sink = config.build("out", ShutdownSignal::noop()).await.unwrap();

        let mut event = EventMsg::new("port-stats", 7);
        event.values.insert("count".into(), Value::Int(1));

        sink.write_batch(vec![event.clone(), event]).await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);

        let decoded: EventMsg = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(decoded.name, "port-stats");
        assert_eq!(decoded.values["count"], Value::Int(1));
    }
}
