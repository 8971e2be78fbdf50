//! NUMA binding for proxy service threads.
//!
//! The proxy busy-polls memory the GPU writes over PCIe; running it on
//! the device's NUMA node keeps that traffic off the interconnect. The
//! node's CPU set comes from sysfs and the bind is a plain
//! `sched_setaffinity` on the calling thread.

use crate::error::{Result, TrigonError};

/// Pin the calling thread to every CPU of `node`.
#[cfg(target_os = "linux")]
pub fn bind_to_node(node: usize) -> Result<()> {
    let path = format!("/sys/devices/system/node/node{node}/cpulist");
    let list = std::fs::read_to_string(&path).map_err(|e| TrigonError::NumaBind {
        node,
        reason: format!("reading {path}: {e}"),
    })?;
    let cpus = parse_cpu_list(list.trim()).ok_or_else(|| TrigonError::NumaBind {
        node,
        reason: format!("malformed cpulist {:?}", list.trim()),
    })?;
    if cpus.is_empty() {
        return Err(TrigonError::NumaBind {
            node,
            reason: "node has no CPUs".into(),
        });
    }

    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        for cpu in &cpus {
            if *cpu < libc::CPU_SETSIZE as usize {
                libc::CPU_SET(*cpu, &mut set);
            }
        }
        let rc = libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set);
        if rc != 0 {
            return Err(TrigonError::NumaBind {
                node,
                reason: format!("sched_setaffinity errno={}", *libc::__errno_location()),
            });
        }
    }
    tracing::debug!(node, cpus = cpus.len(), "proxy thread bound to NUMA node");
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn bind_to_node(node: usize) -> Result<()> {
    tracing::debug!(node, "NUMA binding unsupported on this platform");
    Ok(())
}

/// Parse a sysfs cpulist ("0-3,8,10-11") into CPU indices. Returns
/// `None` on malformed input.
fn parse_cpu_list(list: &str) -> Option<Vec<usize>> {
    let mut cpus = Vec::new();
    if list.is_empty() {
        return Some(cpus);
    }
    for part in list.split(',') {
        match part.split_once('-') {
            Some((lo, hi)) => {
                let lo: usize = lo.trim().parse().ok()?;
                let hi: usize = hi.trim().parse().ok()?;
                if hi < lo {
                    return None;
                }
                cpus.extend(lo..=hi);
            }
            None => cpus.push(part.trim().parse().ok()?),
        }
    }
    Some(cpus)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_single() {
        assert_eq!(parse_cpu_list("3").unwrap(), vec![3]);
    }

    #[test]
    fn test_parse_range() {
        assert_eq!(parse_cpu_list("0-3").unwrap(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_parse_mixed() {
        assert_eq!(
            parse_cpu_list("0-2,8,10-11").unwrap(),
            vec![0, 1, 2, 8, 10, 11]
        );
    }

    #[test]
    fn test_parse_empty() {
        assert_eq!(parse_cpu_list("").unwrap(), Vec::<usize>::new());
    }

    #[test]
    fn test_parse_malformed() {
        assert!(parse_cpu_list("a-b").is_none());
        assert!(parse_cpu_list("3-1").is_none());
        assert!(parse_cpu_list("1,,2").is_none());
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn test_bind_to_node_zero() {
        // Containers may restrict the allowed CPU set, so a bind failure
        // here is reported but not fatal.
        if std::path::Path::new("/sys/devices/system/node/node0/cpulist").exists() {
            if let Err(e) = bind_to_node(0) {
                eprintln!("bind_to_node(0) not permitted in this environment: {e}");
            }
        }
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn test_bind_to_missing_node() {
        assert!(bind_to_node(4096).is_err());
    }
}
