//! Configuration types for runtime and execution settings

/// Runtime configuration for tokio and thread pools
#[derive(Debug, Clone, Copy, Default)]
pub struct RuntimeConfig {
    /// Number of worker threads (0 = number of CPU cores)
    pub max_workers: usize,
    /// Number of blocking threads (0 = tokio default of 512)
    pub max_blocking_threads: usize,
}

/// Throttling configuration for resource control
#[derive(Debug, Clone, Copy, Default)]
pub struct ThrottleConfig {
    /// Maximum number of open local files (None = 80% of system limit, Some(0) = no limit)
    pub max_open_files: Option<usize>,
    /// Files started per second (0 = no throttle)
    pub ops_throttle: usize,
    /// I/O operations per second (0 = no throttle)
    pub iops_throttle: usize,
    /// Chunk size for I/O operations (bytes)
    pub chunk_size: u64,
}

impl ThrottleConfig {
    /// Validate configuration and return errors if invalid
    pub fn validate(&self) -> Result<(), String> {
        if self.iops_throttle > 0 && self.chunk_size == 0 {
            return Err("chunk_size must be specified when using iops_throttle".to_string());
        }
        Ok(())
    }
}

/// Output and logging configuration
#[derive(Debug, Clone, Copy, Default)]
pub struct OutputConfig {
    /// Suppress all output except the exit status
    pub quiet: bool,
    /// Verbosity level: 0=WARN, 1=INFO, 2=DEBUG, 3=TRACE
    pub verbose: u8,
    /// Print summary statistics at the end
    pub print_summary: bool,
}

impl OutputConfig {
    pub fn log_level(&self) -> &'static str {
        if self.quiet {
            return "off";
        }
        match self.verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iops_throttle_requires_chunk_size() {
        let config = ThrottleConfig {
            iops_throttle: 10,
            ..Default::default()
        };
        assert!(config.validate().is_err());
        let config = ThrottleConfig {
            iops_throttle: 10,
            chunk_size: 64 * 1024,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn verbosity_levels() {
        let mut output = OutputConfig::default();
        assert_eq!(output.log_level(), "warn");
        output.verbose = 2;
        assert_eq!(output.log_level(), "debug");
        output.verbose = 9;
        assert_eq!(output.log_level(), "trace");
        output.quiet = true;
        assert_eq!(output.log_level(), "off");
    }
}
