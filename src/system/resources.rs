//! Host resource probing
//!
//! Decides how many CPU threads a decode context may use.

/// Upper bound on decode threads.
pub const MAX_DECODE_THREADS: u32 = 8;

/// Number of logical cores visible to this process.
pub fn available_cores() -> u32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(1)
}

/// Default decode thread count: two cores are left for the caller and the
/// OS, clamped to `1..=MAX_DECODE_THREADS`.
pub fn default_thread_count() -> u32 {
    threads_for_cores(available_cores())
}

fn threads_for_cores(cores: u32) -> u32 {
    cores.saturating_sub(2).clamp(1, MAX_DECODE_THREADS)
}
