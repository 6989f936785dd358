//! End-to-end: the guest agent wire contract over a real TCP socket — NDJSON
//! framing, successful command execution, and the "malformed JSON keeps the
//! connection open" failure policy. Runs against a minimal in-test server
//! rather than the `guest-agent` binary (a separate workspace member with no
//! library target to drive directly), built from the same
//! `orcvm_protocol::{AgentRequest, AgentResponse}` types and failure policy
//! the real binary implements.

use orcvm_protocol::{AgentRequest, AgentResponse};
use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};

fn spawn_test_agent() -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    std::thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(stream) = stream else { continue };
            std::thread::spawn(move || serve_one(stream));
        }
    });
    addr
}

fn serve_one(stream: TcpStream) {
    let mut writer = stream.try_clone().unwrap();
    let mut reader = BufReader::new(stream);
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).unwrap_or(0);
        if n == 0 {
            return;
        }
        let trimmed = line.trim_end();
        if trimmed.is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<AgentRequest>(trimmed) {
            Ok(request) => match std::process::Command::new(&request.cmd).args(&request.args).output() {
                Ok(output) => AgentResponse::success(
                    String::from_utf8_lossy(&output.stdout).into_owned(),
                    String::from_utf8_lossy(&output.stderr).into_owned(),
                    output.status.code().unwrap_or(-1),
                ),
                Err(e) => AgentResponse::spawn_failure(e.to_string()),
            },
            Err(e) => AgentResponse::spawn_failure(format!("malformed request: {e}")),
        };
        let encoded = orcvm_protocol::encode_line(&response).unwrap();
        if writer.write_all(&encoded).is_err() {
            return;
        }
    }
}

fn roundtrip(addr: std::net::SocketAddr, raw_line: &str) -> AgentResponse {
    let mut stream = TcpStream::connect(addr).unwrap();
    stream.write_all(raw_line.as_bytes()).unwrap();
    if !raw_line.ends_with('\n') {
        stream.write_all(b"\n").unwrap();
    }
    let mut reader = BufReader::new(stream);
    let mut buf = String::new();
    reader.read_line(&mut buf).unwrap();
    serde_json::from_str(&buf).unwrap()
}

#[tokio::test]
async fn successful_command_returns_stdout_and_zero_exit() {
    let addr = spawn_test_agent();
    let request = AgentRequest::new("echo").with_args(["hello-guest"]);
    let response = roundtrip(addr, &String::from_utf8(orcvm_protocol::encode_line(&request).unwrap()).unwrap());
    assert!(response.is_success());
    assert_eq!(response.stdout, "hello-guest\n");
}

#[tokio::test]
async fn malformed_json_replies_with_error_and_keeps_connection_open() {
    let addr = spawn_test_agent();
    let mut stream = TcpStream::connect(addr).unwrap();

    stream.write_all(b"{not valid json\n").unwrap();
    let mut reader = BufReader::new(stream.try_clone().unwrap());
    let mut buf = String::new();
    reader.read_line(&mut buf).unwrap();
    let response: AgentResponse = serde_json::from_str(&buf).unwrap();
    assert_eq!(response.exit_code, 1);
    assert!(!response.error.is_empty());

    // The connection must still be usable for a subsequent well-formed request.
    let request = AgentRequest::new("echo").with_args(["still-alive"]);
    stream.write_all(&orcvm_protocol::encode_line(&request).unwrap()).unwrap();
    let mut buf2 = String::new();
    reader.read_line(&mut buf2).unwrap();
    let second: AgentResponse = serde_json::from_str(&buf2).unwrap();
    assert!(second.is_success());
    assert_eq!(second.stdout, "still-alive\n");
}

#[tokio::test]
async fn nonexistent_binary_reports_spawn_failure_not_a_crash() {
    let addr = spawn_test_agent();
    let request = AgentRequest::new("/no/such/binary-xyz-e2e");
    let response = roundtrip(addr, &String::from_utf8(orcvm_protocol::encode_line(&request).unwrap()).unwrap());
    assert_eq!(response.exit_code, 1);
    assert!(!response.error.is_empty());
}
