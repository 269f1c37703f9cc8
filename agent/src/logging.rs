//! Size-rotating log writer
//!
//! `tracing_appender::rolling` only rotates on a wall-clock boundary
//! (minutely/hourly/daily); the agent's log policy is a byte cap instead
//! (`agent_log_max_bytes` x `agent_log_max_files`, default 5 MiB x 3). This
//! implements the same append-and-rotate idea against a size threshold and
//! hands the result to `tracing_appender::non_blocking`, which only needs a
//! `Write + Send + 'static`, so it plugs into the same subscriber setup the
//! donor uses for its own rolling appender.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;

pub struct SizeRotatingWriter {
    path: PathBuf,
    max_bytes: u64,
    max_files: u32,
    file: File,
    written: u64,
}

impl SizeRotatingWriter {
    pub fn new(path: PathBuf, max_bytes: u64, max_files: u32) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let written = file.metadata().map(|m| m.len()).unwrap_or(0);
        Ok(Self { path, max_bytes, max_files, file, written })
    }

    fn rotated_path(&self, generation: u32) -> PathBuf {
        let file_name = self.path.file_name().map(|f| f.to_string_lossy().to_string()).unwrap_or_default();
        self.path.with_file_name(format!("{file_name}.{generation}"))
    }

    fn rotate(&mut self) -> io::Result<()> {
        for generation in (1..self.max_files).rev() {
            let from = self.rotated_path(generation);
            let to = self.rotated_path(generation + 1);
            if from.exists() {
                let _ = std::fs::rename(&from, &to);
            }
        }
        let _ = std::fs::rename(&self.path, self.rotated_path(1));
        self.file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.written = 0;
        Ok(())
    }
}

impl Write for SizeRotatingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.written >= self.max_bytes {
            self.rotate()?;
        }
        let written = self.file.write(buf)?;
        self.written += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn rotates_once_cap_is_exceeded() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("agent.log");
        let mut writer = SizeRotatingWriter::new(path.clone(), 8, 3).unwrap();

        writer.write_all(b"12345678").unwrap();
        writer.write_all(b"more").unwrap();

        assert!(path.exists());
        assert!(path.with_file_name("agent.log.1").exists());
    }

    #[test]
    fn keeps_at_most_max_files_generations() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("agent.log");
        let mut writer = SizeRotatingWriter::new(path.clone(), 4, 2).unwrap();

        for _ in 0..5 {
            writer.write_all(b"1234").unwrap();
        }

        assert!(path.with_file_name("agent.log.1").exists());
        assert!(!path.with_file_name("agent.log.3").exists());
    }
}
