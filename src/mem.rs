use parking_lot::Mutex;
use std::sync::OnceLock;
use std::time::{Duration, Instant};
use sysinfo::{System, SystemExt};

/// Cached memory probe. Refreshes at most every `REFRESH_EVERY`, so the
/// scheduler can ask before every admission without hammering the OS.
struct MemProbe {
    sys: System,
    last_check: Instant,
    last_frac: f64, // available / total (0.0..1.0)
}

static PROBE: OnceLock<Mutex<MemProbe>> = OnceLock::new();
const REFRESH_EVERY: Duration = Duration::from_millis(500);
const THROTTLE_PAUSE: Duration = Duration::from_millis(25);

fn probe() -> &'static Mutex<MemProbe> {
    PROBE.get_or_init(|| {
        let mut sys = System::new();
        sys.refresh_memory();
        let last_check = Instant::now().checked_sub(REFRESH_EVERY * 2).unwrap_or_else(Instant::now);
        Mutex::new(MemProbe { sys, last_check, last_frac: 1.0 })
    })
}

/// Recent estimate of the available memory fraction (0.0..1.0).
pub fn available_memory_fraction() -> f64 {
    let mut p = probe().lock();
    let now = Instant::now();
    if now.duration_since(p.last_check) >= REFRESH_EVERY {
        p.sys.refresh_memory();
        let total = p.sys.total_memory() as f64;
        let avail = p.sys.available_memory() as f64;
        p.last_frac = if total > 0.0 { (avail / total).clamp(0.0, 1.0) } else { 1.0 };
        p.last_check = now;
    }
    p.last_frac
}

pub fn is_low_memory(threshold: f64) -> bool {
    available_memory_fraction() < threshold
}

/// Pause admission briefly while free memory sits under `threshold`.
/// Returns true if it paused.
pub fn maybe_throttle_low_memory(threshold: f64) -> bool {
    if is_low_memory(threshold) {
        tracing::trace!("low memory (< {:.0}% free); pausing admission", threshold * 100.0);
        std::thread::sleep(THROTTLE_PAUSE);
        return true;
    }
    false
}
