//! Print-job spool (`spec.md` §4.8): a job is a linked sequence of
//! per-page temporary files plus a status. Cancel is valid from any
//! state and unwinds cleanly (closes and drops every page file
//! collected so far).

use std::io::Write;
use tempfile::NamedTempFile;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Idle,
    Start,
    Receiving,
    Complete,
    Cancelled,
}

/// One page of a print job, spooled to a temp file as it arrives.
struct Page {
    file: NamedTempFile,
    bytes_written: u64,
}

pub struct PrintJob {
    status: JobStatus,
    pages: Vec<Page>,
}

impl Default for PrintJob {
    fn default() -> Self {
        Self::new()
    }
}

impl PrintJob {
    pub fn new() -> Self {
        PrintJob { status: JobStatus::Idle, pages: Vec::new() }
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn start(&mut self) {
        self.status = JobStatus::Start;
        self.pages.clear();
    }

    /// Begins spooling a new page; must be called once per page before
    /// `receive_chunk` targets it.
    pub fn new_page(&mut self) -> std::io::Result<()> {
        self.status = JobStatus::Receiving;
        let file = NamedTempFile::new()?;
        self.pages.push(Page { file, bytes_written: 0 });
        Ok(())
    }

    pub fn receive_chunk(&mut self, chunk: &[u8]) -> std::io::Result<()> {
        self.status = JobStatus::Receiving;
        let page = self.pages.last_mut().expect("receive_chunk called with no open page");
        page.file.write_all(chunk)?;
        page.bytes_written += chunk.len() as u64;
        Ok(())
    }

    pub fn complete(&mut self) {
        self.status = JobStatus::Complete;
    }

    /// Cancels the job from any state, dropping every spooled page.
    pub fn cancel(&mut self) {
        self.pages.clear();
        self.status = JobStatus::Cancelled;
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub fn page_paths(&self) -> Vec<std::path::PathBuf> {
        self.pages.iter().map(|p| p.file.path().to_path_buf()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_walks_start_receiving_complete() {
        let mut job = PrintJob::new();
        assert_eq!(job.status(), JobStatus::Idle);
        job.start();
        assert_eq!(job.status(), JobStatus::Start);
        job.new_page().unwrap();
        job.receive_chunk(b"page one").unwrap();
        assert_eq!(job.status(), JobStatus::Receiving);
        job.new_page().unwrap();
        job.receive_chunk(b"page two").unwrap();
        job.complete();
        assert_eq!(job.status(), JobStatus::Complete);
        assert_eq!(job.page_count(), 2);
    }

    #[test]
    fn cancel_from_receiving_drops_pages() {
        let mut job = PrintJob::new();
        job.start();
        job.new_page().unwrap();
        job.receive_chunk(b"partial").unwrap();
        job.cancel();
        assert_eq!(job.status(), JobStatus::Cancelled);
        assert_eq!(job.page_count(), 0);
    }

    #[test]
    fn cancel_from_idle_is_clean() {
        let mut job = PrintJob::new();
        job.cancel();
        assert_eq!(job.status(), JobStatus::Cancelled);
    }
}
