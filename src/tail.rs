//! Line reader over a file that another process is still appending to.
//!
//! Instrumentation output and logcat are both redirected into files on the
//! host by [`Device::spawn`](crate::device::Device::spawn). [`FileTail`]
//! follows such a file the way `tail -f` does, but knows when to stop: once
//! the writer's "exited" token is cancelled and the reader has caught up
//! with the end of the file, the tail ends.

use std::io;
use std::path::Path;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::select;
use tokio_util::sync::CancellationToken;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Follows an append-only file line by line.
pub struct FileTail {
    reader: BufReader<tokio::fs::File>,
    partial: Vec<u8>,
    writer_done: Option<CancellationToken>,
    poll_interval: Duration,
}

impl FileTail {
    /// Opens `path` for tailing.
    ///
    /// With `writer_done` set, [`next_line`](Self::next_line) returns `None`
    /// at the first end of file reached after the token was cancelled.
    /// Without it the tail waits forever and must be stopped by dropping it.
    pub async fn open(path: &Path, writer_done: Option<CancellationToken>) -> io::Result<Self> {
        let file = tokio::fs::File::open(path).await?;
        Ok(Self {
            reader: BufReader::new(file),
            partial: Vec::new(),
            writer_done,
            poll_interval: DEFAULT_POLL_INTERVAL,
        })
    }

    /// Sets how often the end of the file is re-checked for new content.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Returns the next complete line without its line terminator.
    ///
    /// A trailing line without a newline is only returned once the writer
    /// has exited. Bytes that are not valid UTF-8 are replaced.
    pub async fn next_line(&mut self) -> io::Result<Option<String>> {
        loop {
            // Sampled before reading so that everything written before the
            // writer exited is seen before giving up.
            let writer_done = self
                .writer_done
                .as_ref()
                .is_some_and(CancellationToken::is_cancelled);

            self.reader.read_until(b'\n', &mut self.partial).await?;

            if self.partial.ends_with(b"\n") {
                return Ok(Some(self.take_partial()));
            }

            if writer_done {
                if self.partial.is_empty() {
                    return Ok(None);
                }
                return Ok(Some(self.take_partial()));
            }

            match &self.writer_done {
                Some(token) => {
                    select! {
                        _ = token.cancelled() => {}
                        _ = tokio::time::sleep(self.poll_interval) => {}
                    }
                }
                None => tokio::time::sleep(self.poll_interval).await,
            }
        }
    }

    fn take_partial(&mut self) -> String {
        let bytes = std::mem::take(&mut self.partial);
        let line = String::from_utf8_lossy(&bytes);
        line.trim_end_matches(['\n', '\r']).to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn test_reads_complete_file_after_writer_exited() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "first\r\nsecond\nthird").unwrap();

        let done = CancellationToken::new();
        done.cancel();
        let mut tail = FileTail::open(file.path(), Some(done)).await.unwrap();

        assert_eq!(tail.next_line().await.unwrap().as_deref(), Some("first"));
        assert_eq!(tail.next_line().await.unwrap().as_deref(), Some("second"));
        assert_eq!(tail.next_line().await.unwrap().as_deref(), Some("third"));
        assert_eq!(tail.next_line().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_waits_for_appended_lines() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let path = file.path().to_path_buf();
        let done = CancellationToken::new();

        let mut tail = FileTail::open(&path, Some(done.clone()))
            .await
            .unwrap()
            .with_poll_interval(Duration::from_millis(5));

        let writer = tokio::spawn({
            let path = path.clone();
            async move {
                let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
                tokio::time::sleep(Duration::from_millis(30)).await;
                write!(file, "par").unwrap();
                file.flush().unwrap();
                tokio::time::sleep(Duration::from_millis(30)).await;
                writeln!(file, "tial").unwrap();
                writeln!(file, "last").unwrap();
                file.flush().unwrap();
                done.cancel();
            }
        });

        assert_eq!(tail.next_line().await.unwrap().as_deref(), Some("partial"));
        assert_eq!(tail.next_line().await.unwrap().as_deref(), Some("last"));
        assert_eq!(tail.next_line().await.unwrap(), None);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_utf8_is_replaced() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"ok \xff\xfe bytes\n").unwrap();

        let mut tail = FileTail::open(file.path(), Some(finished_token()))
            .await
            .unwrap();
        let line = tail.next_line().await.unwrap().unwrap();
        assert!(line.starts_with("ok "));
        assert!(line.ends_with(" bytes"));
    }

    #[tokio::test]
    async fn test_tail_without_writer_token_keeps_waiting() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let mut tail = FileTail::open(file.path(), None)
            .await
            .unwrap()
            .with_poll_interval(Duration::from_millis(5));

        let waited = tokio::time::timeout(Duration::from_millis(50), tail.next_line()).await;
        assert!(waited.is_err());
    }

    fn finished_token() -> CancellationToken {
        let token = CancellationToken::new();
        token.cancel();
        token
    }
}
