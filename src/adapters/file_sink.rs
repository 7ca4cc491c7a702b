use async_trait::async_trait;
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use time::format_description::well_known::Rfc3339;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{error, info, instrument, warn};

use crate::config::OutputFormat;
use crate::domain::{InboundMessage, PersistenceRecord};
use crate::error::PersistenceError;
use crate::ports::MessageSink;

const TAIL_CHUNK: usize = 4096;

/// Append-only line file. The sink is the only writer of `path`.
pub struct FileSink {
    path: PathBuf,
    format: OutputFormat,
    state: Mutex<FileState>,
}

struct FileState {
    file: File,
    /// End of the last fully written, fsynced record.
    committed_len: u64,
    /// Next write stops after this many bytes and fails, as a full disk would.
    #[cfg(test)]
    fail_after_bytes: Option<usize>,
}

impl FileState {
    async fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        #[cfg(test)]
        if let Some(limit) = self.fail_after_bytes.take() {
            self.file.write_all(&buf[..limit.min(buf.len())]).await?;
            self.file.flush().await?;
            return Err(io::Error::new(io::ErrorKind::Other, "no space left on device"));
        }
        self.file.write_all(buf).await
    }
}

impl FileSink {
    pub async fn open(path: impl Into<PathBuf>, format: OutputFormat) -> Result<Self, PersistenceError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)
            .await?;
        let len = file.metadata().await?.len();
        let committed_len = repair_torn_tail(&mut file, len, &path).await?;

        info!("File sink ready at {} ({} bytes, format {:?})", path.display(), committed_len, format);
        Ok(Self {
            path,
            format,
            state: Mutex::new(FileState {
                file,
                committed_len,
                #[cfg(test)]
                fail_after_bytes: None,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn encode(&self, batch: &[InboundMessage]) -> Result<Vec<u8>, PersistenceError> {
        let mut buf = Vec::with_capacity(batch.len() * 128);
        for message in batch {
            let record = PersistenceRecord::from(message);
            match self.format {
                OutputFormat::Jsonl => {
                    serde_json::to_writer(&mut buf, &record)?;
                    buf.push(b'\n');
                }
                OutputFormat::Plain => {
                    buf.extend_from_slice(plain_line(&record, &message.payload)?.as_bytes());
                }
            }
        }
        Ok(buf)
    }
}

/// `<received_at> <topic> <payload>`; multi-line or binary payloads are base64-tagged.
fn plain_line(record: &PersistenceRecord, raw: &[u8]) -> Result<String, PersistenceError> {
    use base64::{engine::general_purpose, Engine as _};

    let received_at = record
        .received_at
        .format(&Rfc3339)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let payload = match std::str::from_utf8(raw) {
        Ok(text) if !text.contains(|c: char| c == '\n' || c == '\r') => text.to_string(),
        _ => format!("base64:{}", general_purpose::STANDARD.encode(raw)),
    };
    Ok(format!("{} {} {}\n", received_at, record.topic, payload))
}

/// Cuts a trailing partial line left behind by a crash mid-write.
async fn repair_torn_tail(file: &mut File, len: u64, path: &Path) -> io::Result<u64> {
    if len == 0 {
        return Ok(0);
    }

    let mut buf = vec![0u8; TAIL_CHUNK];
    let mut end = len;
    while end > 0 {
        let start = end.saturating_sub(TAIL_CHUNK as u64);
        let chunk = &mut buf[..(end - start) as usize];
        file.seek(SeekFrom::Start(start)).await?;
        file.read_exact(chunk).await?;

        if end == len && chunk.last() == Some(&b'\n') {
            return Ok(len);
        }
        if let Some(pos) = chunk.iter().rposition(|b| *b == b'\n') {
            let keep = start + pos as u64 + 1;
            file.set_len(keep).await?;
            warn!("Dropped {} bytes of torn record at end of {}", len - keep, path.display());
            return Ok(keep);
        }
        end = start;
    }

    file.set_len(0).await?;
    warn!("Dropped {} bytes of torn record at end of {}", len, path.display());
    Ok(0)
}

#[async_trait]
impl MessageSink for FileSink {
    #[instrument(skip(self, batch), fields(path = %self.path.display(), batch_size = batch.len()))]
    async fn persist_batch(&self, batch: &[InboundMessage]) -> Result<(), PersistenceError> {
        if batch.is_empty() {
            return Ok(());
        }
        let buf = self.encode(batch)?;

        let mut state = self.state.lock().await;
        let committed = state.committed_len;
        let result: io::Result<()> = async {
            state.file.seek(SeekFrom::Start(committed)).await?;
            state.write_all(&buf).await?;
            state.file.flush().await?;
            state.file.sync_data().await
        }
        .await;

        match result {
            Ok(()) => {
                state.committed_len = committed + buf.len() as u64;
                Ok(())
            }
            Err(e) => {
                // Roll back so a half-written line never becomes visible.
                if let Err(truncate_err) = state.file.set_len(committed).await {
                    error!("Failed to roll back {} to {} bytes: {}", self.path.display(), committed, truncate_err);
                }
                Err(PersistenceError::Io(e))
            }
        }
    }

    async fn flush(&self) -> Result<(), PersistenceError> {
        let mut state = self.state.lock().await;
        state.file.flush().await?;
        state.file.sync_all().await?;
        Ok(())
    }
}
