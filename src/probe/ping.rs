//! ICMP echo probe with native sockets and a `ping` command fallback.
//!
//! Native echoes run on blocking sockets inside `spawn_blocking` so the
//! round trip is timed without scheduler jitter. When the process may not
//! open ICMP sockets, or the kernel refuses one mid-flight, the OS `ping`
//! utility is used instead and its text output is parsed.

use std::io::ErrorKind;
use std::mem::MaybeUninit;
use std::net::{IpAddr, SocketAddr};
use std::process::Stdio;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use regex::Regex;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::process::Command;

use super::ProbeError;

const ECHO_PACKET_LEN: usize = 64;

/// Kind of ICMP socket an echo is sent on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SocketKind {
    /// Needs CAP_NET_RAW; replies to IPv4 carry the IP header
    Raw,
    /// Unprivileged ping socket; the kernel owns the identifier field
    Dgram,
}

/// Which ICMP sockets this process may open, detected once.
#[derive(Debug, Clone, Copy)]
struct Capabilities {
    raw_v4: bool,
    dgram_v4: bool,
    raw_v6: bool,
    dgram_v6: bool,
}

static CAPABILITIES: OnceLock<Capabilities> = OnceLock::new();

static ECHO_SEQUENCE: AtomicU16 = AtomicU16::new(0);

fn capabilities() -> Capabilities {
    *CAPABILITIES.get_or_init(|| {
        let can_open = |domain, ty, protocol| Socket::new(domain, ty, Some(protocol)).is_ok();
        let caps = Capabilities {
            raw_v4: can_open(Domain::IPV4, Type::RAW, Protocol::ICMPV4),
            dgram_v4: can_open(Domain::IPV4, Type::DGRAM, Protocol::ICMPV4),
            raw_v6: can_open(Domain::IPV6, Type::RAW, Protocol::ICMPV6),
            dgram_v6: can_open(Domain::IPV6, Type::DGRAM, Protocol::ICMPV6),
        };
        if caps.dgram_v4 || caps.raw_v4 {
            tracing::info!("Ping probe: native ICMP available ({:?})", caps);
        } else {
            tracing::info!("Ping probe: native ICMP unavailable, using ping command");
        }
        caps
    })
}

/// Pick a native socket for `ip`, or `None` to use the ping command.
///
/// Unprivileged mode only ever uses ping sockets, even when running as root.
fn native_socket_kind(ip: IpAddr, privileged: bool) -> Option<SocketKind> {
    let caps = capabilities();
    let (raw, dgram) = match ip {
        IpAddr::V4(_) => (caps.raw_v4, caps.dgram_v4),
        IpAddr::V6(_) => (caps.raw_v6, caps.dgram_v6),
    };

    if privileged && raw {
        Some(SocketKind::Raw)
    } else if dgram {
        Some(SocketKind::Dgram)
    } else {
        None
    }
}

/// Send one echo request to `address` and wait for its reply.
///
/// Returns the round-trip time.
pub async fn ping_once(address: &str, timeout: Duration, privileged: bool) -> Result<Duration, ProbeError> {
    let ip = resolve_address(address).await?;

    let Some(kind) = native_socket_kind(ip, privileged) else {
        return ping_command(&ip.to_string(), timeout).await;
    };

    let result = tokio::task::spawn_blocking(move || blocking_echo(ip, kind, timeout))
        .await
        .map_err(|e| ProbeError::Network(format!("echo task failed: {}", e)))?;

    match result {
        Err(ProbeError::Permission(reason)) => {
            tracing::warn!(
                "Native ping to {} refused ({}), falling back to ping command",
                ip,
                reason
            );
            ping_command(&ip.to_string(), timeout).await
        }
        other => other,
    }
}

/// Resolve a host name or literal address to the first IP found.
async fn resolve_address(address: &str) -> Result<IpAddr, ProbeError> {
    if let Ok(ip) = address.parse::<IpAddr>() {
        return Ok(ip);
    }

    let mut addrs = tokio::net::lookup_host((address, 0))
        .await
        .map_err(|e| ProbeError::Network(format!("cannot resolve {}: {}", address, e)))?;

    addrs
        .next()
        .map(|sa| sa.ip())
        .ok_or_else(|| ProbeError::Network(format!("no addresses found for {}", address)))
}

fn socket_error(context: &str, e: std::io::Error) -> ProbeError {
    if e.kind() == ErrorKind::PermissionDenied {
        ProbeError::Permission(format!("{}: {}", context, e))
    } else {
        ProbeError::Network(format!("{}: {}", context, e))
    }
}

/// Blocking echo exchange on a fresh socket. Runs on the blocking pool.
fn blocking_echo(ip: IpAddr, kind: SocketKind, timeout: Duration) -> Result<Duration, ProbeError> {
    let (domain, protocol, request_type, reply_type) = match ip {
        IpAddr::V4(_) => (Domain::IPV4, Protocol::ICMPV4, 8u8, 0u8),
        IpAddr::V6(_) => (Domain::IPV6, Protocol::ICMPV6, 128u8, 129u8),
    };
    let ty = match kind {
        SocketKind::Raw => Type::RAW,
        SocketKind::Dgram => Type::DGRAM,
    };

    let socket = Socket::new(domain, ty, Some(protocol)).map_err(|e| socket_error("create socket", e))?;
    socket
        .set_write_timeout(Some(timeout))
        .map_err(|e| socket_error("set timeout", e))?;
    socket
        .connect(&SocketAddr::new(ip, 0).into())
        .map_err(|e| socket_error("connect", e))?;

    let identifier: u16 = rand::random();
    let sequence = ECHO_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    let packet = build_echo_request(request_type, identifier, sequence, ip.is_ipv4());

    let start = Instant::now();
    socket.send(&packet).map_err(|e| socket_error("send", e))?;

    let mut buf = [MaybeUninit::<u8>::uninit(); 1500];
    loop {
        let remaining = timeout
            .checked_sub(start.elapsed())
            .filter(|d| !d.is_zero())
            .ok_or(ProbeError::Timeout(timeout))?;
        socket
            .set_read_timeout(Some(remaining))
            .map_err(|e| socket_error("set timeout", e))?;

        let len = match socket.recv(&mut buf) {
            Ok(len) => len,
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                return Err(ProbeError::Timeout(timeout));
            }
            Err(e) => return Err(socket_error("receive", e)),
        };
        let elapsed = start.elapsed();
        // SAFETY: recv initialized the first `len` bytes
        let data: &[u8] = unsafe { std::slice::from_raw_parts(buf.as_ptr() as *const u8, len) };

        if elapsed >= timeout {
            return Err(ProbeError::Timeout(timeout));
        }
        if is_echo_reply(data, reply_type, identifier, sequence, kind) {
            return Ok(elapsed);
        }
    }
}

/// Check whether `data` is the reply to our request.
///
/// Raw IPv4 sockets (and ping sockets on some platforms) deliver the IP
/// header first; an ICMP reply never starts with a 0x4_ byte, so the
/// version nibble tells the two apart. Ping sockets rewrite the identifier,
/// so only the sequence is checked there.
fn is_echo_reply(data: &[u8], reply_type: u8, identifier: u16, sequence: u16, kind: SocketKind) -> bool {
    let offset = match data.first() {
        Some(first) if first >> 4 == 4 => usize::from(first & 0x0f) * 4,
        Some(_) => 0,
        None => return false,
    };
    let Some(icmp) = data.get(offset..offset + 8) else {
        return false;
    };

    let reply_id = u16::from_be_bytes([icmp[4], icmp[5]]);
    let reply_seq = u16::from_be_bytes([icmp[6], icmp[7]]);

    icmp[0] == reply_type
        && reply_seq == sequence
        && (kind == SocketKind::Dgram || reply_id == identifier)
}

/// Build an echo request. ICMPv6 checksums are filled in by the kernel.
fn build_echo_request(request_type: u8, identifier: u16, sequence: u16, with_checksum: bool) -> Vec<u8> {
    let mut packet = vec![0u8; ECHO_PACKET_LEN];
    packet[0] = request_type;
    packet[4..6].copy_from_slice(&identifier.to_be_bytes());
    packet[6..8].copy_from_slice(&sequence.to_be_bytes());

    let sent_at = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default();
    packet[8..16].copy_from_slice(&sent_at.to_be_bytes());

    if with_checksum {
        let checksum = icmp_checksum(&packet);
        packet[2..4].copy_from_slice(&checksum.to_be_bytes());
    }
    packet
}

/// Internet checksum (RFC 1071).
fn icmp_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = data
        .chunks(2)
        .map(|pair| match pair {
            [hi, lo] => u32::from(u16::from_be_bytes([*hi, *lo])),
            [hi] => u32::from(*hi) << 8,
            _ => 0,
        })
        .sum();

    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// Ping once through the OS utility.
async fn ping_command(address: &str, timeout: Duration) -> Result<Duration, ProbeError> {
    let wait = wait_arg(timeout, cfg!(target_os = "macos"));

    let output = Command::new("ping")
        .args(["-c", "1", "-W", &wait, address])
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| ProbeError::Command(format!("failed to execute ping: {}", e)))?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stdout.contains("100% packet loss")
            || stdout.contains("100.0% packet loss")
            || stderr.contains("timeout")
        {
            return Err(ProbeError::Timeout(timeout));
        }
        if stderr.contains("not permitted") || stderr.contains("denied") {
            return Err(ProbeError::Permission(stderr.trim().to_string()));
        }
        return Err(ProbeError::Command(format!("ping exited with {}: {}", output.status, stderr.trim())));
    }

    parse_ping_output(&stdout)
}

/// Value for ping's `-W` flag: milliseconds on macOS, otherwise whole
/// seconds rounded up. Never below one unit.
fn wait_arg(timeout: Duration, millis: bool) -> String {
    if millis {
        timeout.as_millis().max(1).to_string()
    } else {
        let secs = timeout.as_secs() + u64::from(timeout.subsec_nanos() > 0);
        secs.max(1).to_string()
    }
}

/// Extract the round-trip time from ping output.
///
/// Understands the per-reply `time=X ms` line and the Linux (`rtt
/// min/avg/max/mdev`) and BSD/macOS (`round-trip min/avg/max/stddev`)
/// summaries, using the average from a summary.
fn parse_ping_output(output: &str) -> Result<Duration, ProbeError> {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    let patterns = PATTERNS.get_or_init(|| {
        [
            r"time[=<](?P<ms>[0-9.]+)\s*ms",
            r"(?:rtt|round-trip)\s+min/avg/max/(?:mdev|stddev)\s*=\s*[0-9.]+/(?P<ms>[0-9.]+)/",
        ]
        .iter()
        .filter_map(|pattern| Regex::new(pattern).ok())
        .collect()
    });

    patterns
        .iter()
        .filter_map(|re| re.captures(output))
        .filter_map(|caps| caps.name("ms")?.as_str().parse::<f64>().ok())
        .find(|ms| ms.is_finite() && *ms >= 0.0)
        .map(|ms| Duration::from_secs_f64(ms / 1000.0))
        .ok_or_else(|| ProbeError::Command(format!("failed to parse ping output: {}", output.trim())))
}
