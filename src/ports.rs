//! Free port planning on remote hosts

use crate::error::{InstallerError, Result};
use crate::shell::SshClient;

/// Pipeline listing the local ports of all listening IPv4 TCP sockets
const LISTENING_PORTS_CMD: &str =
    r"netstat -ln4 | sed 1,2d | sed 's/\s\s*/ /g' | cut -d ' ' -f 4 | cut -d ':' -f 2";

/// Kernel ephemeral port range, two whitespace-separated bounds
const EPHEMERAL_RANGE_CMD: &str = "cat /proc/sys/net/ipv4/ip_local_port_range";

/// A candidate port range. A single port `p` stands for `[p, 65535]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortRange {
    Single(u16),
    Span(u16, u16),
}

impl From<u16> for PortRange {
    fn from(port: u16) -> Self {
        PortRange::Single(port)
    }
}

impl From<[u16; 2]> for PortRange {
    fn from(bounds: [u16; 2]) -> Self {
        PortRange::Span(bounds[0], bounds[1])
    }
}

impl From<(u16, u16)> for PortRange {
    fn from(bounds: (u16, u16)) -> Self {
        PortRange::Span(bounds.0, bounds.1)
    }
}

/// Expand ranges into `(lo, hi)` pairs, raising privileged low bounds to 1025.
fn normalized(ranges: &[PortRange]) -> Vec<(u16, u16)> {
    ranges
        .iter()
        .map(|range| {
            let (lo, hi) = match *range {
                PortRange::Single(port) => (port, 65535),
                PortRange::Span(lo, hi) => (lo, hi),
            };
            (if lo <= 1024 { 1025 } else { lo }, hi)
        })
        .collect()
}

/// Ports of all listening TCP sockets on the host
pub async fn listening_ports(client: &SshClient) -> Result<Vec<u16>> {
    let output = client.run(LISTENING_PORTS_CMD).await?;
    Ok(output
        .lines()
        .filter_map(|line| line.trim().parse::<u16>().ok())
        .collect())
}

/// The host's ephemeral port range as `[lo, hi)`
pub async fn ephemeral_range(client: &SshClient) -> Result<(u16, u16)> {
    let output = client.run(EPHEMERAL_RANGE_CMD).await?;
    let bounds: Vec<u16> = output
        .split_whitespace()
        .filter_map(|field| field.parse::<u16>().ok())
        .collect();
    match bounds.as_slice() {
        [a, b] => Ok((*a.min(b), *a.max(b))),
        _ => Err(InstallerError::ConfigParse(format!(
            "Unexpected ephemeral port range: {}",
            output.trim()
        ))),
    }
}

/// Return `nr` free ports on the host, walking `ranges` lowest-first in the
/// given order.
///
/// The exclusion set is `exclude` plus the host's currently listening TCP
/// ports plus its ephemeral range.
pub async fn get_free_ports(
    client: &SshClient,
    ranges: &[PortRange],
    exclude: &[u16],
    nr: usize,
) -> Result<Vec<u16>> {
    let listening = listening_ports(client).await?;
    let (ephemeral_lo, ephemeral_hi) = ephemeral_range(client).await?;

    let mut free_ports = Vec::with_capacity(nr);
    for (lo, hi) in normalized(ranges) {
        for candidate in (lo as u32)..=(hi as u32) {
            let port = candidate as u16;
            if port >= ephemeral_lo && port < ephemeral_hi {
                continue;
            }
            if exclude.contains(&port) || listening.contains(&port) || free_ports.contains(&port) {
                continue;
            }
            free_ports.push(port);
            if free_ports.len() == nr {
                return Ok(free_ports);
            }
        }
    }
    Err(InstallerError::InvalidArgument(
        "Unable to find requested nr of free ports".to_string(),
    ))
}
