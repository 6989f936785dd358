//! Guest agent: runs inside the microVM (or is exec'd as the container's
//! entrypoint helper) and executes commands on behalf of the host over the
//! NDJSON wire protocol defined in `orcvm-protocol`.
//!
//! Binds vsock first; if the guest kernel lacks vsock support, falls back to
//! TCP on all interfaces at the same port. Each accepted connection is
//! served by its own thread and may carry many requests serially.

use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::os::unix::io::RawFd;
use std::process::{Command, Stdio};

use orcvm_protocol::{AgentRequest, AgentResponse, GUEST_AGENT_PORT, MAX_LINE_BYTES};

fn kmsg(msg: &str) {
    eprintln!("guest-agent: {msg}");
}

/// Matches the `sockaddr_vm` layout the host side dials in
/// `orcvm::transport::vsock`.
#[repr(C)]
struct SockaddrVm {
    svm_family: libc::sa_family_t,
    svm_reserved1: u16,
    svm_port: u32,
    svm_cid: u32,
    svm_zero: [u8; 4],
}

const VMADDR_CID_ANY: u32 = 0xFFFFFFFF;

fn create_vsock_listener(port: u32) -> RawFd {
    let fd = unsafe { libc::socket(libc::AF_VSOCK, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0) };
    if fd < 0 {
        return -1;
    }

    let addr = SockaddrVm {
        svm_family: libc::AF_VSOCK as libc::sa_family_t,
        svm_reserved1: 0,
        svm_port: port,
        svm_cid: VMADDR_CID_ANY,
        svm_zero: [0; 4],
    };

    let bound = unsafe {
        libc::bind(
            fd,
            &addr as *const _ as *const libc::sockaddr,
            std::mem::size_of::<SockaddrVm>() as libc::socklen_t,
        )
    };
    if bound < 0 {
        unsafe { libc::close(fd) };
        return -1;
    }

    if unsafe { libc::listen(fd, 16) } < 0 {
        unsafe { libc::close(fd) };
        return -1;
    }
    fd
}

struct VsockStream(RawFd);

impl std::io::Read for VsockStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = unsafe { libc::read(self.0, buf.as_mut_ptr().cast(), buf.len()) };
        if n < 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(n as usize)
    }
}

impl std::io::Write for VsockStream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = unsafe { libc::write(self.0, buf.as_ptr().cast(), buf.len()) };
        if n < 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(n as usize)
    }
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Drop for VsockStream {
    fn drop(&mut self) {
        unsafe { libc::close(self.0) };
    }
}

fn main() {
    kmsg("starting");

    let vsock_fd = {
        let mut fd = -1;
        for attempt in 0..30 {
            fd = create_vsock_listener(GUEST_AGENT_PORT);
            if fd >= 0 {
                kmsg(&format!("vsock listener bound on attempt {}", attempt + 1));
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(200));
        }
        fd
    };

    if vsock_fd >= 0 {
        run_vsock_accept_loop(vsock_fd);
        return;
    }

    kmsg("vsock unavailable, falling back to TCP");
    match TcpListener::bind(("0.0.0.0", GUEST_AGENT_PORT as u16)) {
        Ok(listener) => run_tcp_accept_loop(listener),
        Err(e) => {
            kmsg(&format!("fatal: TCP fallback bind failed: {e}"));
            std::process::exit(1);
        }
    }
}

fn run_vsock_accept_loop(listener_fd: RawFd) -> ! {
    kmsg(&format!("listening on vsock port {GUEST_AGENT_PORT}"));
    loop {
        let client_fd = unsafe { libc::accept(listener_fd, std::ptr::null_mut(), std::ptr::null_mut()) };
        if client_fd < 0 {
            kmsg("accept failed");
            continue;
        }
        std::thread::spawn(move || {
            let stream = VsockStream(client_fd);
            if let Err(e) = serve_connection(stream) {
                kmsg(&format!("connection error: {e}"));
            }
        });
    }
}

fn run_tcp_accept_loop(listener: TcpListener) -> ! {
    kmsg(&format!("listening on tcp port {GUEST_AGENT_PORT}"));
    for incoming in listener.incoming() {
        match incoming {
            Ok(stream) => {
                std::thread::spawn(move || {
                    if let Err(e) = serve_connection(stream) {
                        kmsg(&format!("connection error: {e}"));
                    }
                });
            }
            Err(e) => kmsg(&format!("accept failed: {e}")),
        }
    }
    unreachable!("TcpListener::incoming() never terminates")
}

/// Serve one connection until the peer disconnects. Malformed JSON gets an
/// error response on the same connection rather than closing it; only I/O
/// failures and oversized lines terminate the loop.
fn serve_connection<S: std::io::Read + std::io::Write + TryCloneDyn>(stream: S) -> std::io::Result<()> {
    let mut writer = stream.try_clone_dyn()?;
    let mut reader = BufReader::new(stream);

    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line)?;
        if n == 0 {
            return Ok(());
        }
        if line.len() > MAX_LINE_BYTES {
            kmsg("rejecting oversized line, closing connection");
            return Ok(());
        }
        let trimmed = line.trim_end_matches(['\n', '\r']);
        if trimmed.is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<AgentRequest>(trimmed) {
            Ok(request) => execute(request),
            Err(e) => AgentResponse::spawn_failure(format!("malformed request: {e}")),
        };

        let encoded = orcvm_protocol::encode_line(&response)
            .unwrap_or_else(|_| b"{\"exit_code\":1,\"stdout\":\"\",\"stderr\":\"\",\"error\":\"internal encode failure\"}\n".to_vec());
        writer.write_all(&encoded)?;
    }
}

fn execute(request: AgentRequest) -> AgentResponse {
    let mut command = Command::new(&request.cmd);
    command.args(&request.args);
    command.stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());
    for entry in &request.env {
        if let Some((key, value)) = entry.split_once('=') {
            command.env(key, value);
        }
    }

    match command.output() {
        Ok(output) => AgentResponse::success(
            String::from_utf8_lossy(&output.stdout).into_owned(),
            String::from_utf8_lossy(&output.stderr).into_owned(),
            output.status.code().unwrap_or(-1),
        ),
        Err(e) => AgentResponse::spawn_failure(format!("failed to spawn {}: {e}", request.cmd)),
    }
}

/// A tiny helper trait so `serve_connection` can duplicate a generic stream
/// handle for independent read/write halves without requiring `Clone`.
trait TryCloneDyn: std::io::Write {
    fn try_clone_dyn(&self) -> std::io::Result<Box<dyn std::io::Write + Send>>;
}

impl TryCloneDyn for VsockStream {
    fn try_clone_dyn(&self) -> std::io::Result<Box<dyn std::io::Write + Send>> {
        let dup = unsafe { libc::dup(self.0) };
        if dup < 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(Box::new(VsockStream(dup)))
    }
}

impl TryCloneDyn for TcpStream {
    fn try_clone_dyn(&self) -> std::io::Result<Box<dyn std::io::Write + Send>> {
        Ok(Box::new(self.try_clone()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execute_echo_captures_stdout() {
        let response = execute(AgentRequest::new("echo").with_args(["hello"]));
        assert!(response.is_success());
        assert_eq!(response.stdout, "hello\n");
    }

    #[test]
    fn execute_nonexistent_binary_reports_spawn_failure() {
        let response = execute(AgentRequest::new("/no/such/binary-xyz"));
        assert_eq!(response.exit_code, 1);
        assert!(!response.error.is_empty());
    }

    #[test]
    fn execute_applies_env_entries() {
        let response = execute(
            AgentRequest::new("sh")
                .with_args(["-c", "echo $FOO"])
                .with_env(["FOO=bar"]),
        );
        assert!(response.is_success());
        assert_eq!(response.stdout, "bar\n");
    }

    #[test]
    fn execute_nonzero_exit_is_not_success_but_not_an_error() {
        let response = execute(AgentRequest::new("sh").with_args(["-c", "exit 7"]));
        assert_eq!(response.exit_code, 7);
        assert!(response.error.is_empty());
        assert!(!response.is_success());
    }
}
