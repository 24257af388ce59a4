use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use getset::Getters;
use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::UnixStream,
    time::timeout,
};

use crate::{MachinaError, MachinaResult};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// How long a dial may take before the guest is considered unreachable.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// How long any single read or write on an open connection may take.
pub const IO_TIMEOUT: Duration = Duration::from_secs(30);

/// Upper bound on the response status line + header section.
const MAX_HEAD_BYTES: usize = 16 * 1024;

/// The guest agent's exec endpoint.
const EXEC_ENDPOINT: &str = "/v1/exec";

/// The guest agent's status endpoint.
const STATUS_ENDPOINT: &str = "/v1/status";

/// The guest agent's system metrics endpoint.
const SYSINFO_ENDPOINT: &str = "/v1/sysinfo";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Client for the control-plane protocol spoken by the guest agent over the
/// machine's vsock unix socket.
///
/// The peer is a minimal embedded agent, so this is a narrow hand-rolled
/// framer for an HTTP/1.1 subset rather than a general HTTP client: request
/// line + headers + optional Content-Length body out; status line + headers
/// to a blank line + Content-Length-governed body back.
///
/// Every operation opens a fresh connection; there is no pooling and no
/// multiplexing, and all I/O is bounded by [`DIAL_TIMEOUT`]/[`IO_TIMEOUT`] so
/// a guest that never boots cannot hang a caller.
#[derive(Debug, Clone)]
pub struct GuestChannel {
    /// The vsock unix socket of the machine.
    socket_path: PathBuf,
}

/// A parsed response from the guest agent.
#[derive(Debug, Getters)]
#[getset(get = "pub")]
pub struct ControlResponse {
    /// The numeric status code from the status line.
    status: u16,

    /// Header name/value pairs in arrival order.
    headers: Vec<(String, String)>,

    /// The response body.
    body: Vec<u8>,
}

/// The health report returned by the guest's status endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, Getters)]
#[getset(get = "pub")]
pub struct StatusReport {
    /// Whether the guest considers itself healthy.
    ok: bool,
}

/// System metrics reported by the guest agent.
///
/// Well-known fields are typed; anything else the agent reports is carried
/// through untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SysInfo {
    /// Number of CPUs visible to the guest.
    #[serde(default)]
    pub cpus: u64,

    /// Total guest memory in kilobytes.
    #[serde(default)]
    pub mem_total_kb: u64,

    /// Free guest memory in kilobytes.
    #[serde(default)]
    pub mem_free_kb: u64,

    /// Guest uptime in seconds.
    #[serde(default)]
    pub uptime_secs: u64,

    /// Any additional metrics the agent reports.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// The body of an exec request.
#[derive(Debug, Serialize)]
struct ExecBody<'a> {
    cmd: &'a [String],
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl GuestChannel {
    /// Creates a channel for the guest behind the given vsock unix socket.
    pub fn new(socket_path: impl AsRef<Path>) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
        }
    }

    /// Runs a command in the guest and returns its output text.
    pub async fn exec(&self, cmd: &[String]) -> MachinaResult<String> {
        let body = serde_json::to_vec(&ExecBody { cmd })?;
        let response = self.roundtrip("POST", EXEC_ENDPOINT, Some(body)).await?;
        ensure_success(&response)?;

        Ok(String::from_utf8_lossy(response.body()).into_owned())
    }

    /// Queries the guest's health.
    pub async fn status(&self) -> MachinaResult<StatusReport> {
        let response = self.roundtrip("GET", STATUS_ENDPOINT, None).await?;
        ensure_success(&response)?;

        serde_json::from_slice(response.body()).map_err(|e| {
            MachinaError::Protocol(format!("malformed status body: {}", e))
        })
    }

    /// Queries the guest's system metrics.
    pub async fn sys_info(&self) -> MachinaResult<SysInfo> {
        let response = self.roundtrip("GET", SYSINFO_ENDPOINT, None).await?;
        ensure_success(&response)?;

        serde_json::from_slice(response.body()).map_err(|e| {
            MachinaError::Protocol(format!("malformed sysinfo body: {}", e))
        })
    }

    /// Opens a fresh connection, writes one framed request, and parses the
    /// response.
    async fn roundtrip(
        &self,
        method: &str,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> MachinaResult<ControlResponse> {
        let mut stream = timeout(DIAL_TIMEOUT, UnixStream::connect(&self.socket_path))
            .await
            .map_err(|_| {
                MachinaError::Connect(format!(
                    "timed out dialing {}",
                    self.socket_path.display()
                ))
            })?
            .map_err(|e| {
                MachinaError::Connect(format!(
                    "failed to connect to {}: {}",
                    self.socket_path.display(),
                    e
                ))
            })?;

        let mut request = format!("{} {} HTTP/1.1\r\nHost: machina\r\n", method, path);
        if let Some(body) = &body {
            request.push_str("Content-Type: application/json\r\n");
            request.push_str(&format!("Content-Length: {}\r\n", body.len()));
        }
        request.push_str("\r\n");

        let mut bytes = request.into_bytes();
        if let Some(body) = body {
            bytes.extend_from_slice(&body);
        }

        timeout(IO_TIMEOUT, stream.write_all(&bytes))
            .await
            .map_err(|_| MachinaError::Protocol("timed out writing request".to_string()))??;

        read_response(&mut stream).await
    }
}

impl ControlResponse {
    /// Returns the first header with the given name, matched case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(header, _)| header.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Reads and parses one response off the stream.
///
/// Header lines are consumed until a blank line; the body is governed by
/// `Content-Length` when present (any trailing bytes are ignored) and read
/// until peer close when absent.
async fn read_response(stream: &mut UnixStream) -> MachinaResult<ControlResponse> {
    let mut buf: Vec<u8> = Vec::new();

    let head_end = loop {
        if let Some(pos) = find_blank_line(&buf) {
            break pos;
        }
        if buf.len() > MAX_HEAD_BYTES {
            return Err(MachinaError::Protocol(
                "response header section too large".to_string(),
            ));
        }
        let n = read_chunk(stream, &mut buf).await?;
        if n == 0 {
            return Err(MachinaError::Protocol(
                "connection closed before end of headers".to_string(),
            ));
        }
    };

    let head = std::str::from_utf8(&buf[..head_end])
        .map_err(|_| MachinaError::Protocol("response headers are not valid utf-8".to_string()))?;

    let mut lines = head.split("\r\n");
    let status_line = lines
        .next()
        .ok_or_else(|| MachinaError::Protocol("empty response".to_string()))?;
    let status = parse_status_line(status_line)?;

    let mut headers = Vec::new();
    for line in lines {
        let (name, value) = line.split_once(':').ok_or_else(|| {
            MachinaError::Protocol(format!("malformed header line: {}", line))
        })?;
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }

    let mut body: Vec<u8> = buf[head_end + 4..].to_vec();

    let content_length = headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
        .map(|(_, value)| {
            value.parse::<usize>().map_err(|_| {
                MachinaError::Protocol(format!("invalid content-length: {}", value))
            })
        })
        .transpose()?;

    match content_length {
        Some(length) => {
            while body.len() < length {
                let n = read_chunk(stream, &mut body).await?;
                if n == 0 {
                    return Err(MachinaError::Protocol(format!(
                        "connection closed after {} of {} body bytes",
                        body.len(),
                        length
                    )));
                }
            }
            // Anything past Content-Length is a trailer we ignore.
            body.truncate(length);
        }
        None => loop {
            let n = read_chunk(stream, &mut body).await?;
            if n == 0 {
                break;
            }
        },
    }

    Ok(ControlResponse {
        status,
        headers,
        body,
    })
}

/// Reads one chunk off the stream into `buf`, returning the byte count.
async fn read_chunk(stream: &mut UnixStream, buf: &mut Vec<u8>) -> MachinaResult<usize> {
    let mut chunk = [0u8; 4096];
    let n = timeout(IO_TIMEOUT, stream.read(&mut chunk))
        .await
        .map_err(|_| MachinaError::Protocol("timed out reading response".to_string()))??;
    buf.extend_from_slice(&chunk[..n]);
    Ok(n)
}

/// Parses `HTTP/1.1 <code> <reason>` into the numeric code.
fn parse_status_line(line: &str) -> MachinaResult<u16> {
    let mut parts = line.split_whitespace();
    let version = parts
        .next()
        .ok_or_else(|| MachinaError::Protocol("empty status line".to_string()))?;
    if !version.starts_with("HTTP/") {
        return Err(MachinaError::Protocol(format!(
            "malformed status line: {}",
            line
        )));
    }
    parts
        .next()
        .and_then(|code| code.parse::<u16>().ok())
        .ok_or_else(|| MachinaError::Protocol(format!("malformed status line: {}", line)))
}

/// Finds the header/body separator, returning the offset of the blank line.
fn find_blank_line(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|window| window == b"\r\n\r\n")
}

/// Rejects non-2xx guest responses.
fn ensure_success(response: &ControlResponse) -> MachinaResult<()> {
    if !(200..300).contains(response.status()) {
        return Err(MachinaError::Protocol(format!(
            "guest returned status {}: {}",
            response.status(),
            String::from_utf8_lossy(response.body())
        )));
    }
    Ok(())
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
