use std::fmt;
use std::fs;
use std::io;

/// Host memory pressure, classified from the available/total ratio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Pressure {
    Low,
    Normal,
    High,
    Extreme,
    Oom,
}

impl fmt::Display for Pressure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Pressure::Low => "low",
            Pressure::Normal => "normal",
            Pressure::High => "high",
            Pressure::Extreme => "extreme",
            Pressure::Oom => "oom",
        };
        f.write_str(s)
    }
}

/// A point-in-time snapshot of host and process memory, in bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct Usage {
    pub total: u64,
    pub available: u64,
    pub used: u64,
    /// Resident set size of this process.
    pub actual_used: u64,
    pub swap_used: u64,
}

impl Usage {
    pub fn pressure(&self) -> Pressure {
        if self.total == 0 {
            return Pressure::Normal;
        }
        let pct = self.available * 100 / self.total;
        match pct {
            0..=1 => Pressure::Oom,
            2..=4 => Pressure::Extreme,
            5..=9 => Pressure::High,
            10..=49 => Pressure::Normal,
            _ => Pressure::Low,
        }
    }
}

/// Source of memory snapshots. Production uses [`ProcReader`]; tests
/// inject fixed or scripted readers.
pub trait UsageReader: Send + Sync {
    fn usage(&self) -> io::Result<Usage>;
}

/// Reads `/proc/meminfo` and `/proc/self/statm`.
#[derive(Debug, Default)]
pub struct ProcReader;

impl UsageReader for ProcReader {
    fn usage(&self) -> io::Result<Usage> {
        let meminfo = fs::read_to_string("/proc/meminfo")?;
        let mut total = 0u64;
        let mut available = 0u64;
        let mut swap_total = 0u64;
        let mut swap_free = 0u64;

        for line in meminfo.lines() {
            let mut it = line.split_whitespace();
            let (Some(key), Some(val)) = (it.next(), it.next()) else {
                continue;
            };
            let val: u64 = val.parse().unwrap_or(0);
            match key {
                "MemTotal:" => total = val * 1024,
                "MemAvailable:" => available = val * 1024,
                "SwapTotal:" => swap_total = val * 1024,
                "SwapFree:" => swap_free = val * 1024,
                _ => {}
            }
        }

        Ok(Usage {
            total,
            available,
            used: total.saturating_sub(available),
            actual_used: proc_rss()?,
            swap_used: swap_total.saturating_sub(swap_free),
        })
    }
}

/// Resident set size of the current process, from `/proc/self/statm`.
pub fn proc_rss() -> io::Result<u64> {
    let statm = fs::read_to_string("/proc/self/statm")?;
    let rss_pages: u64 = statm
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "malformed /proc/self/statm"))?;
    let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as u64;
    Ok(rss_pages * page)
}

#[cfg(test)]
mod test {
    use super::*;

    fn usage(total: u64, available: u64) -> Usage {
        Usage {
            total,
            available,
            used: total - available,
            actual_used: 0,
            swap_used: 0,
        }
    }

    #[test]
    fn pressure_thresholds() {
        assert_eq!(usage(100, 60).pressure(), Pressure::Low);
        assert_eq!(usage(100, 30).pressure(), Pressure::Normal);
        assert_eq!(usage(100, 9).pressure(), Pressure::High);
        assert_eq!(usage(100, 4).pressure(), Pressure::Extreme);
        assert_eq!(usage(100, 1).pressure(), Pressure::Oom);
        assert_eq!(usage(100, 0).pressure(), Pressure::Oom);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn proc_reader_smoke() {
        let u = ProcReader.usage().unwrap();
        assert!(u.total > 0);
        assert!(u.actual_used > 0);
        assert!(u.available <= u.total);
    }
}
