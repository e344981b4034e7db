//! Hosts input, resolution and presentation.
//!
//! A host is an opaque string handed to the SSH client: `user@host`, a
//! short name, or an FQDN. Deduplication is left to the caller; duplicate
//! hosts are scheduled twice.

use std::fs;
use std::net::ToSocketAddrs;
use std::path::Path;

use crate::error::{Result, SshpError};

/// Hosts from the command line or from a file, one per line.
/// Blank lines and `#` comments are skipped.
pub fn read_hosts(hostsfile: Option<&Path>, hosts: &[String]) -> Result<Vec<String>> {
    if !hosts.is_empty() {
        return Ok(hosts.to_vec());
    }
    let path = hostsfile.ok_or(SshpError::NoHosts)?;
    let content = fs::read_to_string(path).map_err(|source| SshpError::HostsFile {
        path: path.to_path_buf(),
        source,
    })?;
    let hosts: Vec<String> = content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect();
    if hosts.is_empty() {
        return Err(SshpError::NoHosts);
    }
    Ok(hosts)
}

/// Try to resolve each host, probing `host` then `host.<domain>` for every
/// domain in the search list. A host that never resolves passes through
/// unchanged. A `user@` prefix is preserved.
pub fn resolve_hosts(hosts: Vec<String>, domains: &[String]) -> Vec<String> {
    hosts
        .into_iter()
        .map(|host| resolve_in_domains(&host, domains))
        .collect()
}

fn resolve_in_domains(host: &str, domains: &[String]) -> String {
    let (user, name) = match host.split_once('@') {
        Some((user, name)) => (Some(user), name),
        None => (None, host),
    };
    let resolved = std::iter::once(name.to_string())
        .chain(domains.iter().map(|d| format!("{name}.{d}")))
        .find(|candidate| resolves(candidate))
        .unwrap_or_else(|| name.to_string());
    match user {
        Some(user) => format!("{user}@{resolved}"),
        None => resolved,
    }
}

fn resolves(name: &str) -> bool {
    (name, 22)
        .to_socket_addrs()
        .map(|mut addrs| addrs.next().is_some())
        .unwrap_or(false)
}

/// Presentation form of a host name. `max_dots` keeps the first `k`
/// dot-separated labels; `1` gives the short name, a negative value the
/// full name.
pub fn display_host(host: &str, max_dots: i32) -> String {
    if max_dots < 1 {
        return host.to_string();
    }
    host.split('.')
        .take(max_dots as usize)
        .collect::<Vec<_>>()
        .join(".")
}
