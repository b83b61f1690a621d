// Per-job log files under the diag directory.

use anyhow::{Context, Result};
use chrono::Utc;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// Maximum size of a single log page in bytes (8 MB).
pub const PAGE_SIZE: usize = 8 * 1024 * 1024;

/// Writes a job's step output to `<dir>/<job>.log`, rolling over to
/// `<job>.2.log`, `<job>.3.log`, ... when a page reaches the size cap.
/// Each line is prepended with a UTC timestamp.
pub struct JobLogWriter {
    folder: PathBuf,
    file_stem: String,
    page_size: usize,
    writer: Option<BufWriter<File>>,
    page_byte_count: usize,
    pages: Vec<PathBuf>,
    total_lines: u64,
}

impl JobLogWriter {
    pub fn new(folder: &Path, job_name: &str) -> Result<Self> {
        fs::create_dir_all(folder)
            .with_context(|| format!("Failed to create log folder '{}'", folder.display()))?;
        Ok(Self {
            folder: folder.to_path_buf(),
            file_stem: cinder_sdk::IOUtil::sanitize_file_name(job_name),
            page_size: PAGE_SIZE,
            writer: None,
            page_byte_count: 0,
            pages: Vec::new(),
            total_lines: 0,
        })
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Write one line. I/O errors are traced and otherwise ignored so that a
    /// full disk never fails a job.
    pub fn write(&mut self, message: &str) {
        if self.writer.is_none() {
            self.new_page();
        }

        let line = format!("{} {}", Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ"), message);
        if let Some(ref mut writer) = self.writer {
            if let Err(e) = writeln!(writer, "{}", line) {
                tracing::warn!("Failed to write job log line: {}", e);
            }
        }

        self.total_lines += 1;
        self.page_byte_count += line.len() + 1;
        if self.page_byte_count >= self.page_size {
            self.end_page();
        }
    }

    /// Files written so far, in order.
    pub fn pages(&self) -> &[PathBuf] {
        &self.pages
    }

    pub fn total_lines(&self) -> u64 {
        self.total_lines
    }

    /// Flush and close the current page.
    pub fn end(&mut self) {
        self.end_page();
    }

    fn new_page(&mut self) {
        self.end_page();
        self.page_byte_count = 0;

        let file_name = match self.pages.len() {
            0 => format!("{}.log", self.file_stem),
            n => format!("{}.{}.log", self.file_stem, n + 1),
        };
        let path = self.folder.join(file_name);

        match File::create(&path) {
            Ok(file) => {
                self.writer = Some(BufWriter::new(file));
                self.pages.push(path);
            }
            Err(e) => {
                tracing::error!("Failed to create job log {:?}: {}", path, e);
            }
        }
    }

    fn end_page(&mut self) {
        if let Some(mut writer) = self.writer.take() {
            let _ = writer.flush();
        }
    }
}

impl Drop for JobLogWriter {
    fn drop(&mut self) {
        self.end();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_timestamped_lines() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = JobLogWriter::new(dir.path(), "fmt").unwrap();
        log.write("hello");
        log.write("world");
        log.end();

        let content = fs::read_to_string(dir.path().join("fmt.log")).unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with(" hello"));
        assert!(lines[0].contains('T') && lines[0].split(' ').next().unwrap().ends_with('Z'));
        assert_eq!(log.total_lines(), 2);
    }

    #[test]
    fn rolls_over_pages_at_size_cap() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = JobLogWriter::new(dir.path(), "build and test")
            .unwrap()
            .with_page_size(64);
        for i in 0..6 {
            log.write(&format!("line number {i} with some padding"));
        }
        log.end();

        assert!(log.pages().len() > 1);
        assert_eq!(log.pages()[0], dir.path().join("build_and_test.log"));
        assert_eq!(log.pages()[1], dir.path().join("build_and_test.2.log"));
        let total: usize = log
            .pages()
            .iter()
            .map(|p| fs::read_to_string(p).unwrap().lines().count())
            .sum();
        assert_eq!(total, 6);
    }
}
