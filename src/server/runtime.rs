/// Worker-thread count for the tokio runtime, container-aware.
///
/// Tokio defaults to the host CPU count, which over-provisions threads when
/// the container is limited to a few cores on a large host. Detection order:
/// `PORTCULLIS_WORKER_THREADS` env var, cgroup v2 `cpu.max`, then
/// `available_parallelism`.
pub fn worker_thread_count() -> usize {
    if let Some(n) = std::env::var("PORTCULLIS_WORKER_THREADS")
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
    {
        return n.max(1);
    }

    if let Some(n) = std::fs::read_to_string("/sys/fs/cgroup/cpu.max")
        .ok()
        .as_deref()
        .and_then(cgroup_cpu_quota)
    {
        return n.max(1);
    }

    std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(1)
}

/// Parse cgroup v2 `cpu.max` ("quota period", or "max period" = unlimited).
fn cgroup_cpu_quota(content: &str) -> Option<usize> {
    let mut parts = content.split_whitespace();
    let quota: i64 = parts.next()?.parse().ok()?;
    let period: i64 = parts.next()?.parse().ok()?;
    if quota > 0 && period > 0 {
        Some((quota / period) as usize)
    } else {
        None
    }
}
