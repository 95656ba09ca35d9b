//! Runtime/host metrics for the Base tab
//!
//! All readers here degrade to a placeholder on failure; nothing in this
//! module may fail the request.

use std::net::Ipv4Addr;

/// Current process RSS in bytes; 0 when unavailable.
pub fn current_memory() -> u64 {
    let Ok(pid) = sysinfo::get_current_pid() else {
        return 0;
    };
    let mut sys = sysinfo::System::new();
    sys.refresh_processes(sysinfo::ProcessesToUpdate::Some(&[pid]), true);
    sys.process(pid).map(|p| p.memory()).unwrap_or(0)
}

/// `{name} v{version} {arch}`, e.g. `Linux v6.8.0 x86_64`.
pub fn os_summary() -> String {
    let name = sysinfo::System::name().unwrap_or_else(|| std::env::consts::OS.to_string());
    let version = sysinfo::System::os_version().unwrap_or_else(|| "-".to_string());
    format!("{} v{} {}", name, version, std::env::consts::ARCH)
}

/// Disk usage line for the root filesystem. `None` on Windows or when no
/// disk information is available.
pub fn disk_summary() -> Option<String> {
    if cfg!(windows) {
        return None;
    }

    let disks = sysinfo::Disks::new_with_refreshed_list();
    let root = disks
        .iter()
        .find(|d| d.mount_point() == std::path::Path::new("/"))
        .or_else(|| disks.iter().max_by_key(|d| d.total_space()))?;

    let total = root.total_space();
    let free = root.available_space();
    if total == 0 {
        return None;
    }
    let used = total.saturating_sub(free);
    let usage = (used as f64 / total as f64) * 100.0;

    Some(format!(
        "total:{}; used:{}; free:{}; usage:{:.2}%",
        size_format(total, 2, false),
        size_format(used, 2, false),
        size_format(free, 2, false),
        usage
    ))
}

/// Human-readable byte count: decimal units by default (`KB`, `MB`...),
/// binary (`KiB`, `MiB`...) when `binary` is set. Trailing zeros trimmed.
pub fn size_format(size: u64, decimals: usize, binary: bool) -> String {
    if size == 0 {
        return "0B".to_string();
    }

    let base: f64 = if binary { 1024.0 } else { 1000.0 };
    let units: &[&str] = if binary {
        &["B", "KiB", "MiB", "GiB", "TiB", "PiB", "EiB"]
    } else {
        &["B", "KB", "MB", "GB", "TB", "PB", "EB"]
    };

    let mut value = size as f64;
    let mut pos = 0;
    while value >= base && pos < units.len() - 1 {
        value /= base;
        pos += 1;
    }

    let formatted = format!("{:.*}", decimals, value);
    let trimmed = if formatted.contains('.') {
        formatted.trim_end_matches('0').trim_end_matches('.')
    } else {
        &formatted
    };
    format!("{}{}", trimmed, units[pos])
}

/// Mask the middle octets of an IPv4 host: `10.1.2.3` → `10.***.***.3`.
/// Loopback, short, and non-IPv4 values pass through untouched.
pub fn mask_ip(ip: &str) -> String {
    if ip.len() < 5 || ip == "localhost" || ip == "127.0.0.1" {
        return ip.to_string();
    }

    if ip.parse::<Ipv4Addr>().is_err() {
        return ip.to_string();
    }

    let parts: Vec<&str> = ip.split('.').collect();
    format!("{}.***.***.{}", parts[0], parts[3])
}

/// Mask a username to its first and last two characters: `debugger` →
/// `de***er`.
pub fn mask_username(username: &str) -> String {
    if username.is_empty() {
        return "-".to_string();
    }
    let chars: Vec<char> = username.chars().collect();
    let head: String = chars.iter().take(2).collect();
    let tail: String = chars.iter().rev().take(2).rev().collect();
    format!("{}***{}", head, tail)
}
