//! Process-level resource probes: RSS, memory limit, descriptor limit and
//! count. Linux reads them from procfs/cgroupfs; other targets degrade to
//! `None` and the admission controller falls back to descriptor rules only.

/// Environment override for the detected memory limit, e.g. `512MiB`.
pub const MEM_LIMIT_ENV: &str = "PROXYVET_MEM_LIMIT";

/// Parse `123`, `512KB`, `1.5GiB` style byte counts.
pub fn parse_bytes(s: &str) -> Option<i64> {
    let s = s.trim().to_ascii_uppercase();
    if s.is_empty() {
        return None;
    }
    if let Ok(v) = s.parse::<i64>() {
        return Some(v);
    }
    const UNITS: [(&str, i64); 8] = [
        ("KIB", 1 << 10),
        ("MIB", 1 << 20),
        ("GIB", 1 << 30),
        ("TIB", 1 << 40),
        ("KB", 1_000),
        ("MB", 1_000_000),
        ("GB", 1_000_000_000),
        ("TB", 1_000_000_000_000),
    ];
    for (suffix, mult) in UNITS {
        if let Some(num) = s.strip_suffix(suffix) {
            if let Ok(v) = num.trim().parse::<f64>() {
                return Some((v * mult as f64) as i64);
            }
        }
    }
    None
}

pub fn human_bytes(b: i64) -> String {
    if b <= 0 {
        return "unknown".into();
    }
    const UNIT: i64 = 1024;
    if b < UNIT {
        return format!("{b}B");
    }
    let mut div = UNIT;
    let mut exp = 0usize;
    let mut n = b / UNIT;
    while n >= UNIT {
        div *= UNIT;
        exp += 1;
        n /= UNIT;
    }
    const SUFFIX: [&str; 4] = ["KiB", "MiB", "GiB", "TiB"];
    format!("{:.1}{}", b as f64 / div as f64, SUFFIX[exp.min(SUFFIX.len() - 1)])
}

/// Detect the effective memory cap for this process: env override, cgroup v2,
/// cgroup v1, then total physical memory.
pub fn detect_mem_limit_bytes() -> Option<i64> {
    if let Ok(s) = std::env::var(MEM_LIMIT_ENV) {
        if let Some(v) = parse_bytes(&s) {
            if v > 0 {
                return Some(v);
            }
        }
    }
    #[cfg(target_os = "linux")]
    {
        if let Ok(txt) = std::fs::read_to_string("/sys/fs/cgroup/memory.max") {
            let txt = txt.trim();
            if !txt.is_empty() && txt != "max" {
                if let Ok(v) = txt.parse::<i64>() {
                    if v > 0 {
                        return Some(v);
                    }
                }
            }
        }
        if let Ok(txt) = std::fs::read_to_string("/sys/fs/cgroup/memory/memory.limit_in_bytes") {
            if let Ok(v) = txt.trim().parse::<i64>() {
                if v > 0 && v < 1 << 62 {
                    return Some(v);
                }
            }
        }
        if let Ok(txt) = std::fs::read_to_string("/proc/meminfo") {
            for line in txt.lines() {
                if let Some(rest) = line.strip_prefix("MemTotal:") {
                    let kb = rest
                        .split_whitespace()
                        .next()
                        .and_then(|f| f.parse::<i64>().ok())?;
                    if kb > 0 {
                        return Some(kb * 1024);
                    }
                }
            }
        }
    }
    None
}

/// Resident set size of this process.
#[cfg(target_os = "linux")]
pub fn process_rss_bytes() -> Option<i64> {
    let txt = std::fs::read_to_string("/proc/self/statm").ok()?;
    let pages = txt.split_whitespace().nth(1)?.parse::<i64>().ok()?;
    if pages <= 0 {
        return None;
    }
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if page_size <= 0 {
        return None;
    }
    Some(pages * page_size)
}

#[cfg(not(target_os = "linux"))]
pub fn process_rss_bytes() -> Option<i64> {
    None
}

/// Count of open descriptors, a cheap proxy for live sockets.
#[cfg(target_os = "linux")]
pub fn open_fd_count() -> Option<i64> {
    Some(std::fs::read_dir("/proc/self/fd").ok()?.count() as i64)
}

#[cfg(not(target_os = "linux"))]
pub fn open_fd_count() -> Option<i64> {
    None
}

/// Soft RLIMIT_NOFILE.
#[cfg(unix)]
pub fn detect_fd_limit() -> Option<u64> {
    let mut lim = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    let rc = unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut lim) };
    if rc != 0 {
        return None;
    }
    Some(lim.rlim_cur as u64)
}

#[cfg(not(unix))]
pub fn detect_fd_limit() -> Option<u64> {
    None
}

/// Best-effort raise of the soft NOFILE limit toward `target` (capped by the
/// hard limit). Returns the resulting soft limit.
#[cfg(unix)]
pub fn raise_fd_limit(target: u64) -> Option<u64> {
    let mut lim = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut lim) } != 0 {
        return None;
    }
    let want = target.min(lim.rlim_max as u64);
    if (lim.rlim_cur as u64) < want {
        let new = libc::rlimit {
            rlim_cur: want as libc::rlim_t,
            rlim_max: lim.rlim_max,
        };
        if unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &new) } != 0 {
            return Some(lim.rlim_cur as u64);
        }
    }
    detect_fd_limit()
}

#[cfg(not(unix))]
pub fn raise_fd_limit(_target: u64) -> Option<u64> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_bytes_units() {
        assert_eq!(parse_bytes("1024"), Some(1024));
        assert_eq!(parse_bytes("1KiB"), Some(1024));
        assert_eq!(parse_bytes("1.5GiB"), Some(3 * (1 << 29)));
        assert_eq!(parse_bytes("2MB"), Some(2_000_000));
        assert_eq!(parse_bytes("garbage"), None);
        assert_eq!(parse_bytes(""), None);
    }

    #[test]
    fn human_bytes_rounding() {
        assert_eq!(human_bytes(0), "unknown");
        assert_eq!(human_bytes(512), "512B");
        assert_eq!(human_bytes(2048), "2.0KiB");
        assert_eq!(human_bytes(3 * (1 << 29)), "1.5GiB");
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn linux_probes_return_plausible_values() {
        assert!(process_rss_bytes().unwrap() > 0);
        assert!(open_fd_count().unwrap() >= 3);
        assert!(detect_fd_limit().unwrap() > 0);
    }
}
