//! Process-wide resource throttling for file transfers
//!
//! Three independent token buckets, all disabled until configured:
//!
//! 1. **Open files** - bounds the number of simultaneously open local files. A permit is held
//!    for as long as the file is open and released on drop.
//! 2. **Operations** - bounds the number of files started per second.
//! 3. **I/O operations** - bounds throughput by charging one token per chunk of every file.
//!
//! Operation and I/O tokens are consumed, never returned; a background task refills them at a
//! fixed interval.
//!
//! ```rust,no_run
//! use std::time::Duration;
//!
//! # async fn example(file_size: u64) {
//! throttle::set_max_open_files(1024);
//! throttle::init_ops_tokens(10);
//! tokio::spawn(throttle::run_ops_replenish_thread(10, Duration::from_millis(100)));
//! throttle::init_iops_tokens(100);
//! tokio::spawn(throttle::run_iops_replenish_thread(100, Duration::from_millis(100)));
//!
//! // before each file
//! throttle::get_ops_token().await;
//! throttle::get_file_iops_tokens(64 * 1024, file_size).await;
//! let _guard = throttle::open_file_permit().await;
//! # }
//! ```
//!
//! For I/O throttling a file of `file_size` bytes costs `⌈file_size / chunk_size⌉` tokens, with
//! a minimum of one.

mod semaphore;

static OPEN_FILES_LIMIT: semaphore::Semaphore = semaphore::Semaphore::new();
static OPS_THROTTLE: semaphore::Semaphore = semaphore::Semaphore::new();
static IOPS_THROTTLE: semaphore::Semaphore = semaphore::Semaphore::new();

/// 0 removes the limit.
pub fn set_max_open_files(max_open_files: usize) {
    OPEN_FILES_LIMIT.setup(max_open_files);
}

pub struct OpenFileGuard {
    _permit: Option<tokio::sync::SemaphorePermit<'static>>,
}

pub async fn open_file_permit() -> OpenFileGuard {
    OpenFileGuard {
        _permit: OPEN_FILES_LIMIT.acquire().await,
    }
}

pub fn init_ops_tokens(ops_tokens: usize) {
    OPS_THROTTLE.setup(ops_tokens);
}

pub fn init_iops_tokens(ops_tokens: usize) {
    IOPS_THROTTLE.setup(ops_tokens);
}

pub async fn get_ops_token() {
    OPS_THROTTLE.consume().await;
}

/// Number of chunk tokens a file of `file_size` bytes costs.
pub fn file_iops_tokens(chunk_size: u64, file_size: u64) -> u64 {
    if chunk_size == 0 {
        return 0;
    }
    1 + (std::cmp::max(1, file_size) - 1) / chunk_size
}

pub async fn get_file_iops_tokens(chunk_size: u64, file_size: u64) {
    let tokens = file_iops_tokens(chunk_size, file_size);
    if tokens == 0 {
        return;
    }
    match u32::try_from(tokens) {
        Ok(tokens) => IOPS_THROTTLE.consume_many(tokens).await,
        Err(_) => tracing::error!(
            "chunk size: {} is too small to limit throughput for files this big, size: {}",
            chunk_size,
            file_size,
        ),
    }
}

pub async fn run_ops_replenish_thread(replenish: usize, interval: std::time::Duration) {
    OPS_THROTTLE.run_replenish_thread(replenish, interval).await;
}

pub async fn run_iops_replenish_thread(replenish: usize, interval: std::time::Duration) {
    IOPS_THROTTLE
        .run_replenish_thread(replenish, interval)
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_cost_per_file() {
        assert_eq!(file_iops_tokens(0, 1 << 20), 0);
        assert_eq!(file_iops_tokens(64 * 1024, 0), 1);
        assert_eq!(file_iops_tokens(64 * 1024, 1), 1);
        assert_eq!(file_iops_tokens(64 * 1024, 64 * 1024), 1);
        assert_eq!(file_iops_tokens(64 * 1024, 64 * 1024 + 1), 2);
        assert_eq!(file_iops_tokens(64 * 1024, 1 << 20), 16);
    }

    #[tokio::test]
    async fn unconfigured_throttles_never_block() {
        get_ops_token().await;
        get_file_iops_tokens(1, 1 << 20).await;
        let _guard = open_file_permit().await;
    }
}
