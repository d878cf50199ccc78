//! Parallel job count for dump and restore.

/// Resolve the `-j` value used by every dump and restore of the run.
///
/// An explicit override wins (clamped to at least 1); otherwise half of the
/// local logical cores, never less than 1.
pub fn resolve_parallel_jobs(explicit: Option<usize>, logical_cores: usize) -> usize {
    match explicit {
        Some(jobs) => jobs.max(1),
        None => (logical_cores / 2).max(1),
    }
}

pub fn local_logical_cores() -> usize {
    num_cpus::get()
}
