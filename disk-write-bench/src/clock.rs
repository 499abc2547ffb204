use nix::time::{clock_gettime, ClockId};

fn read_ns(clock: ClockId) -> nix::Result<u64> {
    let ts = clock_gettime(clock)?;
    // both clocks we read are non-negative
    Ok(ts.tv_sec() as u64 * 1_000_000_000 + ts.tv_nsec() as u64)
}

/// Microseconds on `CLOCK_MONOTONIC`.
pub fn monotonic_now_us() -> u64 {
    // CLOCK_MONOTONIC is always supported on Linux
    read_ns(ClockId::CLOCK_MONOTONIC).map_or(0, |ns| ns / 1000)
}

/// CPU time consumed by all threads of this process, in nanoseconds.
pub fn process_cpu_time_ns() -> nix::Result<u64> {
    read_ns(ClockId::CLOCK_PROCESS_CPUTIME_ID)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic() {
        let a = monotonic_now_us();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = monotonic_now_us();
        assert!(b >= a + 2000, "{a} {b}");
    }

    #[test]
    fn cpu_time_advances_when_busy() {
        let before = process_cpu_time_ns().unwrap();
        let start = std::time::Instant::now();
        let mut x = 0u64;
        while start.elapsed() < std::time::Duration::from_millis(20) {
            x = std::hint::black_box(x.wrapping_add(1));
        }
        assert!(process_cpu_time_ns().unwrap() > before);
    }
}
