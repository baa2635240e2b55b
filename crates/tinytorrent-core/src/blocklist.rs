use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};

use tinytorrent_session::{IpFilter, IpRange};
use tracing::info;

/// Parsed blocklist plus bookkeeping for status reporting.
#[derive(Debug, Clone)]
pub struct BlocklistResult {
    /// The rules handed to the session.
    pub filter: IpFilter,
    /// Accepted rule count.
    pub entries: usize,
}

/// Tracks the blocklist source file and its last successful load.
#[derive(Debug)]
pub struct BlocklistManager {
    path: PathBuf,
    entries: usize,
    last_loaded_unix: Option<i64>,
}

impl BlocklistManager {
    /// Manager for the blocklist at `path`.
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            entries: 0,
            last_loaded_unix: None,
        }
    }

    /// The configured source path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rule count from the last successful load.
    #[must_use]
    pub const fn entries(&self) -> usize {
        self.entries
    }

    /// Unix seconds of the last successful load.
    #[must_use]
    pub const fn last_loaded_unix(&self) -> Option<i64> {
        self.last_loaded_unix
    }

    /// Record a completed load.
    pub fn note_loaded(&mut self, entries: usize, now_unix: i64) {
        self.entries = entries;
        self.last_loaded_unix = Some(now_unix);
        info!(entries, path = %self.path.display(), "blocklist applied");
    }

    /// Read and parse the source file. Runs on the I/O service.
    #[must_use]
    pub fn load(path: &Path) -> Option<BlocklistResult> {
        if path.as_os_str().is_empty() || !path.exists() {
            return None;
        }
        let text = std::fs::read_to_string(path).ok()?;
        Some(parse_blocklist(&text))
    }
}

/// Parse blocklist text: one rule per line, blank and `#` lines skipped.
///
/// Accepted forms: `start-end` ranges, CIDR (v4 and v6) and single
/// addresses. Unparseable lines are dropped.
#[must_use]
pub fn parse_blocklist(text: &str) -> BlocklistResult {
    let mut filter = IpFilter::default();
    for line in text.lines() {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if let Some((start, end)) = parse_entry(line) {
            filter.rules.push(IpRange {
                start,
                end,
                blocked: true,
            });
        }
    }
    let entries = filter.len();
    BlocklistResult { filter, entries }
}

fn parse_entry(raw: &str) -> Option<(IpAddr, IpAddr)> {
    let value = raw.trim();
    if value.is_empty() || value.starts_with('#') {
        return None;
    }

    if let Some((first, last)) = value.split_once('-') {
        let start: IpAddr = first.trim().parse().ok()?;
        let end: IpAddr = last.trim().parse().ok()?;
        if start.is_ipv4() != end.is_ipv4() {
            return None;
        }
        return Some((start, end));
    }

    if let Some((network, prefix)) = value.split_once('/') {
        let prefix: u32 = prefix.trim().parse().ok()?;
        return match network.trim().parse::<IpAddr>().ok()? {
            IpAddr::V4(addr) => expand_cidr_v4(addr, prefix),
            IpAddr::V6(addr) => expand_cidr_v6(addr, prefix),
        };
    }

    let addr: IpAddr = value.parse().ok()?;
    Some((addr, addr))
}

fn expand_cidr_v4(addr: Ipv4Addr, prefix: u32) -> Option<(IpAddr, IpAddr)> {
    if prefix > 32 {
        return None;
    }
    let bits = u32::from(addr);
    let host_mask = u32::MAX.checked_shr(prefix).unwrap_or(0);
    let start = bits & !host_mask;
    let end = bits | host_mask;
    Some((
        IpAddr::V4(Ipv4Addr::from(start)),
        IpAddr::V4(Ipv4Addr::from(end)),
    ))
}

fn expand_cidr_v6(addr: Ipv6Addr, prefix: u32) -> Option<(IpAddr, IpAddr)> {
    if prefix > 128 {
        return None;
    }
    let bits = u128::from(addr);
    let host_mask = u128::MAX.checked_shr(prefix).unwrap_or(0);
    let start = bits & !host_mask;
    let end = bits | host_mask;
    Some((
        IpAddr::V6(Ipv6Addr::from(start)),
        IpAddr::V6(Ipv6Addr::from(end)),
    ))
}
