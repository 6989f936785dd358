//! Host↔guest transport: vsock-preferred, TCP-fallback byte stream carrying
//! NDJSON-framed [`orcvm_protocol::AgentRequest`]/[`orcvm_protocol::AgentResponse`]
//! pairs.
//!
//! Grounded on `backend::control_channel::ControlChannel::connect_with_handshake`'s
//! connect/retry shape (bounded deadline, sleep-and-retry loop, vsock first),
//! generalized to the spec's NDJSON wire format instead of the teacher's
//! length-prefixed binary framing.

#[cfg(target_os = "linux")]
mod vsock;

use std::io::{BufReader, Write};
use std::net::TcpStream;
use std::time::{Duration, Instant};

use orcvm_protocol::{read_line_value, AgentRequest, AgentResponse};
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// A connected stream to the guest agent. At-most-one in-flight request per
/// connection; callers MUST serialize or pool connections, per the
/// concurrency model.
pub struct Transport {
    reader: BufReader<Box<dyn ReadWrite>>,
}

trait ReadWrite: std::io::Read + std::io::Write + Send {}
impl<T: std::io::Read + std::io::Write + Send> ReadWrite for T {}

impl Transport {
    /// `connect(vm_id, deadline) -> bidirectional byte stream`: dial vsock
    /// (guest_cid, port) first, sleeping 500ms between attempts; on
    /// persistent vsock failure fall back to TCP at `tcp_fallback_addr` if
    /// configured, else surface `TransportUnavailable`.
    pub async fn connect(
        guest_cid: u32,
        port: u32,
        tcp_fallback_addr: Option<&str>,
        deadline: Duration,
    ) -> Result<Self> {
        // Split the overall budget so a vsock outage that eats the whole
        // deadline can't starve the TCP phase of a chance to run at all.
        let vsock_deadline = if tcp_fallback_addr.is_some() { deadline / 2 } else { deadline };
        let vsock_start = Instant::now();

        #[cfg(target_os = "linux")]
        {
            while vsock_start.elapsed() < vsock_deadline {
                match vsock::connect(guest_cid, port) {
                    Ok(stream) => {
                        debug!(guest_cid, port, "connected via vsock");
                        return Ok(Self {
                            reader: BufReader::new(Box::new(stream)),
                        });
                    }
                    Err(e) => {
                        warn!(guest_cid, port, error = %e, "vsock dial failed, retrying");
                        tokio::time::sleep(Duration::from_millis(500)).await;
                    }
                }
            }
        }

        if let Some(addr) = tcp_fallback_addr {
            let tcp_deadline = deadline.saturating_sub(vsock_start.elapsed()).max(Duration::from_millis(500));
            let tcp_start = Instant::now();
            while tcp_start.elapsed() < tcp_deadline {
                match TcpStream::connect(addr) {
                    Ok(stream) => {
                        debug!(addr, "connected via TCP fallback");
                        return Ok(Self {
                            reader: BufReader::new(Box::new(stream)),
                        });
                    }
                    Err(e) => {
                        warn!(addr, error = %e, "TCP fallback dial failed, retrying");
                        tokio::time::sleep(Duration::from_millis(500)).await;
                    }
                }
            }
        }

        Err(Error::TransportUnavailable(format!(
            "vsock and TCP both failed within {:?}",
            deadline
        )))
    }

    /// Send one request and read exactly one reply, per the single
    /// request/reply framing contract.
    pub fn roundtrip(&mut self, request: &AgentRequest) -> Result<AgentResponse> {
        let line = orcvm_protocol::encode_line(request)?;
        self.reader.get_mut().write_all(&line)?;
        let response: Option<AgentResponse> = read_line_value(&mut self.reader)?;
        response.ok_or_else(|| Error::TransportUnavailable("connection closed before a reply arrived".into()))
    }
}
