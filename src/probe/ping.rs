//! ICMP echo with native sockets (socket2) and a `ping` command fallback.
//!
//! Blocking sockets run inside spawn_blocking so the monitor loop's timing
//! is not disturbed by kernel scheduling of the echo itself.

use std::mem::MaybeUninit;
use std::net::{IpAddr, SocketAddr};
use std::process::Stdio;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use regex::Regex;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::process::Command;

use super::ProbeError;

#[derive(Debug, Clone, Copy, PartialEq)]
enum IcmpCapability {
    Native,
    CommandOnly,
}

static ICMP_CAPABILITY: OnceLock<IcmpCapability> = OnceLock::new();

static ECHO_SEQUENCE: AtomicU16 = AtomicU16::new(0);

/// Unique (identifier, sequence) pair so concurrent echoes to the same
/// destination can be told apart.
fn next_echo_id() -> (u16, u16) {
    let identifier: u16 = rand::random();
    let sequence = ECHO_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    (identifier, sequence)
}

fn detect_icmp_capability() -> IcmpCapability {
    // RAW needs CAP_NET_RAW or root; DGRAM works unprivileged where
    // ping_group_range allows it.
    if Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4)).is_ok() {
        tracing::info!("icmp: using native sockets (RAW)");
        return IcmpCapability::Native;
    }
    if Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::ICMPV4)).is_ok() {
        tracing::info!("icmp: using native sockets (DGRAM, unprivileged)");
        return IcmpCapability::Native;
    }
    tracing::info!("icmp: native sockets unavailable, falling back to ping command");
    IcmpCapability::CommandOnly
}

/// Send one ICMP echo request to `address` and wait for the matching reply.
///
/// Returns the round-trip time on success. Hostnames are resolved first;
/// resolution failure is a network error, not a timeout.
pub async fn echo(address: &str, timeout: Duration) -> Result<Duration, ProbeError> {
    let capability = *ICMP_CAPABILITY.get_or_init(detect_icmp_capability);

    if capability == IcmpCapability::Native {
        let ip = resolve_address(address).await?;
        let result = tokio::task::spawn_blocking(move || blocking_echo(ip, timeout))
            .await
            .map_err(|e| ProbeError::Network(format!("spawn_blocking failed: {}", e)))?;

        match result {
            Ok(rtt) => return Ok(rtt),
            Err(e) => {
                let text = e.to_string();
                if text.contains("Permission") || text.contains("not permitted") {
                    tracing::warn!(
                        "icmp: permission error for {}, using command fallback",
                        address
                    );
                    return ping_command(address, timeout).await;
                }
                return Err(e);
            }
        }
    }

    ping_command(address, timeout).await
}

async fn resolve_address(address: &str) -> Result<IpAddr, ProbeError> {
    if let Ok(ip) = address.parse::<IpAddr>() {
        return Ok(ip);
    }

    tokio::net::lookup_host(format!("{}:0", address))
        .await
        .map_err(|e| ProbeError::Network(format!("DNS resolution failed: {}", e)))?
        .next()
        .map(|sa| sa.ip())
        .ok_or_else(|| ProbeError::Network(format!("no addresses found for {}", address)))
}

/// Blocking echo with family-specific framing. Runs on a blocking thread.
fn blocking_echo(ip: IpAddr, timeout: Duration) -> Result<Duration, ProbeError> {
    let (domain, protocol, reply_type) = match ip {
        IpAddr::V4(_) => (Domain::IPV4, Protocol::ICMPV4, 0u8),
        IpAddr::V6(_) => (Domain::IPV6, Protocol::ICMPV6, 129u8),
    };

    let socket = Socket::new(domain, Type::RAW, Some(protocol))
        .or_else(|_| Socket::new(domain, Type::DGRAM, Some(protocol)))
        .map_err(|e| ProbeError::Network(format!("failed to create ICMP socket: {}", e)))?;

    socket
        .set_read_timeout(Some(timeout))
        .map_err(|e| ProbeError::Network(format!("failed to set timeout: {}", e)))?;
    socket
        .set_write_timeout(Some(timeout))
        .map_err(|e| ProbeError::Network(format!("failed to set timeout: {}", e)))?;

    let dest = SocketAddr::new(ip, 0);
    socket
        .connect(&dest.into())
        .map_err(|e| ProbeError::Network(format!("failed to connect: {}", e)))?;

    let (identifier, sequence) = next_echo_id();
    let packet = build_echo_request(ip.is_ipv4(), identifier, sequence);

    let start = Instant::now();
    socket
        .send(&packet)
        .map_err(|e| ProbeError::Network(format!("failed to send: {}", e)))?;

    // Replies for other echoes on the same socket are skipped, not errors.
    loop {
        let mut buf: [MaybeUninit<u8>; 1500] = [MaybeUninit::uninit(); 1500];
        let len = socket.recv(&mut buf).map_err(|e| {
            if e.kind() == std::io::ErrorKind::WouldBlock
                || e.kind() == std::io::ErrorKind::TimedOut
            {
                ProbeError::Timeout(timeout)
            } else {
                ProbeError::Network(format!("failed to receive: {}", e))
            }
        })?;
        // SAFETY: recv initialized `len` bytes
        let buf: &[u8] = unsafe { std::slice::from_raw_parts(buf.as_ptr().cast::<u8>(), len) };

        let elapsed = start.elapsed();
        if elapsed >= timeout {
            return Err(ProbeError::Timeout(timeout));
        }

        // RAW IPv4 sockets hand back the IP header; DGRAM and IPv6 do not.
        let offset = if ip.is_ipv4() && len > 0 && buf[0] >> 4 == 4 {
            20
        } else {
            0
        };
        if len >= offset + 8 {
            let rt = buf[offset];
            let rid = u16::from_be_bytes([buf[offset + 4], buf[offset + 5]]);
            let rseq = u16::from_be_bytes([buf[offset + 6], buf[offset + 7]]);
            if rt == reply_type && rid == identifier && rseq == sequence {
                return Ok(elapsed);
            }
        }
    }
}

/// Build an echo request: type 8 for ICMPv4, 128 for ICMPv6, code 0.
fn build_echo_request(v4: bool, identifier: u16, sequence: u16) -> Vec<u8> {
    let mut packet = vec![0u8; 64]; // 8 byte header + 56 byte payload

    packet[0] = if v4 { 8 } else { 128 };
    packet[1] = 0;
    packet[4..6].copy_from_slice(&identifier.to_be_bytes());
    packet[6..8].copy_from_slice(&sequence.to_be_bytes());

    // The kernel computes the ICMPv6 checksum; ICMPv4 is ours to fill in.
    if v4 {
        let checksum = icmp_checksum(&packet);
        packet[2..4].copy_from_slice(&checksum.to_be_bytes());
    }

    packet
}

/// RFC 1071 internet checksum.
fn icmp_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut i = 0;

    while i + 1 < data.len() {
        sum += u32::from(u16::from_be_bytes([data[i], data[i + 1]]));
        i += 2;
    }
    if i < data.len() {
        sum += u32::from(data[i]) << 8;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }

    !sum as u16
}

/// Echo via the system `ping` binary when native sockets are unavailable.
async fn ping_command(address: &str, timeout: Duration) -> Result<Duration, ProbeError> {
    let timeout_secs = timeout.as_secs().max(1);

    let output = Command::new("ping")
        .args(["-c", "1", "-W", &timeout_secs.to_string(), address])
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| ProbeError::Command(format!("failed to execute ping: {}", e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stdout = String::from_utf8_lossy(&output.stdout);
        if stderr.contains("timeout")
            || stdout.contains("100% packet loss")
            || stdout.contains("100.0% packet loss")
        {
            return Err(ProbeError::Timeout(timeout));
        }
        return Err(ProbeError::Command(format!("ping failed: {}", stdout)));
    }

    parse_ping_output(&String::from_utf8_lossy(&output.stdout))
}

/// Extract the round-trip time from ping output (per-packet line first,
/// summary lines as fallback for terser formats).
fn parse_ping_output(output: &str) -> Result<Duration, ProbeError> {
    static PER_PACKET: OnceLock<Regex> = OnceLock::new();
    let per_packet =
        PER_PACKET.get_or_init(|| Regex::new(r"time[=<](?P<val>[0-9.]+)\s*ms").unwrap());

    if let Some(caps) = per_packet.captures(output) {
        if let Ok(ms) = caps["val"].parse::<f64>() {
            return Ok(Duration::from_secs_f64(ms / 1000.0));
        }
    }

    static SUMMARY: OnceLock<Regex> = OnceLock::new();
    let summary = SUMMARY.get_or_init(|| {
        Regex::new(r"(?:rtt|round-trip)\s+min/avg/max/[a-z]+\s*=\s*([0-9.]+)/([0-9.]+)/").unwrap()
    });

    if let Some(caps) = summary.captures(output) {
        if let Ok(ms) = caps[2].parse::<f64>() {
            return Ok(Duration::from_secs_f64(ms / 1000.0));
        }
    }

    Err(ProbeError::Command(format!(
        "failed to parse ping output: {}",
        output
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_is_nonzero_for_echo_request() {
        let packet = build_echo_request(true, 0x1234, 0x0001);
        assert_eq!(packet.len(), 64);
        assert_eq!(packet[0], 8);
        assert_eq!(packet[4..6], [0x12, 0x34]);
        assert_eq!(packet[6..8], [0x00, 0x01]);
        assert_ne!(u16::from_be_bytes([packet[2], packet[3]]), 0);
    }

    #[test]
    fn v6_echo_request_leaves_checksum_to_kernel() {
        let packet = build_echo_request(false, 0xABCD, 7);
        assert_eq!(packet[0], 128);
        assert_eq!(packet[2..4], [0, 0]);
    }

    #[test]
    fn parses_per_packet_time() {
        let output = "64 bytes from 8.8.8.8: icmp_seq=1 ttl=117 time=12.345 ms";
        let rtt = parse_ping_output(output).unwrap();
        assert!((rtt.as_secs_f64() - 0.012345).abs() < 1e-9);
    }

    #[test]
    fn parses_linux_summary_line() {
        let output = r#"PING 8.8.8.8 (8.8.8.8) 56(84) bytes of data.

--- 8.8.8.8 ping statistics ---
1 packets transmitted, 1 received, 0% packet loss, time 0ms
rtt min/avg/max/mdev = 12.300/12.300/12.300/0.000 ms"#;
        let rtt = parse_ping_output(output).unwrap();
        assert!((rtt.as_secs_f64() - 0.0123).abs() < 1e-9);
    }

    #[test]
    fn parses_macos_summary_line() {
        let output = r#"--- example.com ping statistics ---
1 packets transmitted, 1 packets received, 0.0% packet loss
round-trip min/avg/max/stddev = 17.906/17.906/17.906/0.000 ms"#;
        let rtt = parse_ping_output(output).unwrap();
        assert!((rtt.as_secs_f64() - 0.017906).abs() < 1e-9);
    }

    #[test]
    fn unparseable_output_is_a_command_error() {
        assert!(matches!(
            parse_ping_output("garbage"),
            Err(ProbeError::Command(_))
        ));
    }
}
