use std::sync::atomic::{AtomicU64, Ordering};

use tracing::instrument;

#[derive(Debug)]
pub struct TlsCounter {
    // mutex is used primarily from one thread, so it's not a bottleneck
    count: thread_local::ThreadLocal<std::sync::Mutex<u64>>,
}

impl TlsCounter {
    pub fn new() -> Self {
        Self {
            count: thread_local::ThreadLocal::new(),
        }
    }

    pub fn add(&self, value: u64) {
        let mutex = self.count.get_or(|| std::sync::Mutex::new(0));
        let mut guard = mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        *guard += value;
    }

    pub fn inc(&self) {
        self.add(1);
    }

    pub fn reset(&self) {
        for mutex in self.count.iter() {
            *mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = 0;
        }
    }

    pub fn get(&self) -> u64 {
        self.count.iter().fold(0, |x, y| {
            x + *y.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
        })
    }
}

impl Default for TlsCounter {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
pub struct ProgressCounter {
    started: TlsCounter,
    finished: TlsCounter,
}

impl Default for ProgressCounter {
    fn default() -> Self {
        Self::new()
    }
}

pub struct ProgressGuard<'a> {
    progress: &'a ProgressCounter,
}

impl<'a> ProgressGuard<'a> {
    pub fn new(progress: &'a ProgressCounter) -> Self {
        progress.started.inc();
        Self { progress }
    }
}

impl Drop for ProgressGuard<'_> {
    fn drop(&mut self) {
        self.progress.finished.inc();
    }
}

pub struct Status {
    pub started: u64,
    pub finished: u64,
}

impl ProgressCounter {
    pub fn new() -> Self {
        Self {
            started: TlsCounter::new(),
            finished: TlsCounter::new(),
        }
    }

    pub fn reset(&self) {
        self.started.reset();
        self.finished.reset();
    }

    pub fn guard(&self) -> ProgressGuard<'_> {
        ProgressGuard::new(self)
    }

    #[instrument]
    pub fn get(&self) -> Status {
        let mut status = Status {
            started: self.started.get(),
            finished: self.finished.get(),
        };
        if status.finished > status.started {
            tracing::debug!(
                "progress inversion - started: {}, finished {}",
                status.started,
                status.finished
            );
            status.started = status.finished;
        }
        status
    }
}

/// Aggregate transfer progress, updated concurrently by every worker.
#[derive(Debug)]
pub struct Progress {
    /// Files being worked on.
    pub ops: ProgressCounter,
    /// Bytes actually streamed.
    pub bytes_transferred: TlsCounter,
    /// Bytes accounted for, including skipped files and resumed prefixes.
    pub bytes_done: TlsCounter,
    pub files_transferred: TlsCounter,
    pub files_resumed: TlsCounter,
    pub files_restarted: TlsCounter,
    pub files_skipped: TlsCounter,
    pub files_failed: TlsCounter,
    bytes_total: AtomicU64,
    files_total: AtomicU64,
    start_time: std::sync::Mutex<std::time::Instant>,
}

impl Progress {
    pub fn new() -> Self {
        Self {
            ops: Default::default(),
            bytes_transferred: Default::default(),
            bytes_done: Default::default(),
            files_transferred: Default::default(),
            files_resumed: Default::default(),
            files_restarted: Default::default(),
            files_skipped: Default::default(),
            files_failed: Default::default(),
            bytes_total: AtomicU64::new(0),
            files_total: AtomicU64::new(0),
            start_time: std::sync::Mutex::new(std::time::Instant::now()),
        }
    }

    /// Adds one enumerated batch to the expected totals.
    pub fn add_totals(&self, files: u64, bytes: u64) {
        self.files_total.fetch_add(files, Ordering::Relaxed);
        self.bytes_total.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn bytes_total(&self) -> u64 {
        self.bytes_total.load(Ordering::Relaxed)
    }

    pub fn files_total(&self) -> u64 {
        self.files_total.load(Ordering::Relaxed)
    }

    pub fn get_duration(&self) -> std::time::Duration {
        self.start_time
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .elapsed()
    }

    /// Zeroes every counter and total and restarts the clock.
    ///
    /// Must not be called while a transfer is feeding the counters.
    pub fn reset(&self) {
        self.ops.reset();
        self.bytes_transferred.reset();
        self.bytes_done.reset();
        self.files_transferred.reset();
        self.files_resumed.reset();
        self.files_restarted.reset();
        self.files_skipped.reset();
        self.files_failed.reset();
        self.files_total.store(0, Ordering::Relaxed);
        self.bytes_total.store(0, Ordering::Relaxed);
        *self
            .start_time
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = std::time::Instant::now();
    }
}

impl Default for Progress {
    fn default() -> Self {
        Self::new()
    }
}

pub struct ProgressPrinter<'a> {
    progress: &'a Progress,
    last_bytes: u64,
    last_update: std::time::Instant,
}

impl<'a> ProgressPrinter<'a> {
    pub fn new(progress: &'a Progress) -> Self {
        Self {
            progress,
            last_bytes: progress.bytes_transferred.get(),
            last_update: std::time::Instant::now(),
        }
    }

    pub fn print(&mut self) -> String {
        let time_now = std::time::Instant::now();
        let ops = self.progress.ops.get();
        let total_duration_secs = self.progress.get_duration().as_secs_f64();
        let curr_duration_secs = (time_now - self.last_update).as_secs_f64();
        let bytes = self.progress.bytes_transferred.get();
        let average_bytes_rate = bytes as f64 / total_duration_secs;
        let current_bytes_rate = (bytes - self.last_bytes) as f64 / curr_duration_secs;
        self.last_bytes = bytes;
        self.last_update = time_now;
        format!(
            "-----------------------\n\
            FILES:\n\
            in flight:   {:>10}\n\
            done:        {:>10} / {}\n\
            -----------------------\n\
            TRANSFERRED:\n\
            average:     {:>10}/s\n\
            current:     {:>10}/s\n\
            total:       {:>10}\n\
            accounted:   {:>10} / {}\n\
            -----------------------\n\
            transferred: {:>10}\n\
            resumed:     {:>10}\n\
            restarted:   {:>10}\n\
            skipped:     {:>10}\n\
            failed:      {:>10}",
            ops.started - ops.finished,
            ops.finished,
            self.progress.files_total(),
            bytesize::ByteSize(average_bytes_rate as u64),
            bytesize::ByteSize(current_bytes_rate as u64),
            bytesize::ByteSize(bytes),
            bytesize::ByteSize(self.progress.bytes_done.get()),
            bytesize::ByteSize(self.progress.bytes_total()),
            self.progress.files_transferred.get(),
            self.progress.files_resumed.get(),
            self.progress.files_restarted.get(),
            self.progress.files_skipped.get(),
            self.progress.files_failed.get(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    #[test]
    fn basic_counting() -> Result<()> {
        let tls_counter = TlsCounter::new();
        for _ in 0..10 {
            tls_counter.inc();
        }
        assert!(tls_counter.get() == 10);
        Ok(())
    }

    #[test]
    fn threaded_counting() -> Result<()> {
        let tls_counter = TlsCounter::new();
        std::thread::scope(|scope| {
            for _ in 0..10 {
                scope.spawn(|| {
                    for _ in 0..100 {
                        tls_counter.add(3);
                    }
                });
            }
        });
        assert_eq!(tls_counter.get(), 3000);
        Ok(())
    }

    #[test]
    fn guard_tracks_in_flight() -> Result<()> {
        let counter = ProgressCounter::new();
        {
            let _guard = counter.guard();
            let status = counter.get();
            assert_eq!(status.started - status.finished, 1);
        }
        let status = counter.get();
        assert_eq!((status.started, status.finished), (1, 1));
        Ok(())
    }

    #[test]
    fn printer_reports_totals() -> Result<()> {
        let progress = Progress::new();
        progress.add_totals(3, 3000);
        progress.bytes_transferred.add(1024);
        progress.files_skipped.inc();
        let mut printer = ProgressPrinter::new(&progress);
        let text = printer.print();
        assert!(text.contains("/ 3\n"));
        assert!(
            text.lines()
                .any(|line| line.starts_with("skipped:") && line.ends_with(" 1"))
        );
        Ok(())
    }

    #[test]
    fn reset_starts_a_new_run() -> Result<()> {
        let progress = Progress::new();
        progress.add_totals(4, 4000);
        progress.bytes_done.add(4000);
        progress.files_transferred.add(4);
        drop(progress.ops.guard());
        progress.reset();
        progress.add_totals(2, 100);
        progress.files_transferred.add(2);
        assert_eq!(progress.files_total(), 2);
        assert_eq!(progress.bytes_total(), 100);
        assert_eq!(progress.files_transferred.get(), 2);
        assert_eq!(progress.bytes_done.get(), 0);
        let status = progress.ops.get();
        assert_eq!((status.started, status.finished), (0, 0));
        Ok(())
    }
}
