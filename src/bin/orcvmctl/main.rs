//! orcvmctl: thin admin CLI talking to a running `orcvmd` over its local
//! UDS control surface.
//!
//! Usage:
//!   orcvmctl vms
//!   orcvmctl tasks
//!   orcvmctl reap

use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::process;

use orcvm::admin::{AdminRequest, AdminResponse};

fn main() {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        print_usage();
        process::exit(1);
    }

    let socket_path = std::env::var("ORCVM_ADMIN_SOCKET").unwrap_or_else(|_| "/run/orcvm/admin.sock".to_string());

    let request = match args[1].as_str() {
        "vms" => AdminRequest::ListVms,
        "tasks" => AdminRequest::ListTasks,
        "reap" => AdminRequest::Reap,
        "help" | "--help" | "-h" => {
            print_usage();
            return;
        }
        other => {
            eprintln!("unknown command: {other}");
            print_usage();
            process::exit(1);
        }
    };

    match send(&socket_path, &request) {
        Ok(response) => print_response(response),
        Err(e) => {
            eprintln!("orcvmctl: {e}");
            process::exit(1);
        }
    }
}

fn send(socket_path: &str, request: &AdminRequest) -> std::io::Result<AdminResponse> {
    let mut stream = UnixStream::connect(socket_path)?;
    let line = orcvm_protocol::encode_line(request).map_err(|e| std::io::Error::other(e.to_string()))?;
    stream.write_all(&line)?;

    let mut reader = BufReader::new(stream);
    let mut buf = String::new();
    reader.read_line(&mut buf)?;
    serde_json::from_str(&buf).map_err(|e| std::io::Error::other(format!("malformed response: {e}")))
}

fn print_response(response: AdminResponse) {
    match response {
        AdminResponse::Vms { vms } => {
            for vm in vms {
                println!("{}\t{}\t{}\t{}", vm.id, vm.name, vm.state, vm.owning_worker_id);
            }
        }
        AdminResponse::Tasks { tasks } => {
            for task in tasks {
                println!("{}\t{}\t{}\tretries={}", task.id, task.type_tag, task.status, task.retry_count);
            }
        }
        AdminResponse::Reaped { count } => println!("reaped {count} idle VM(s)"),
        AdminResponse::Error { message } => {
            eprintln!("error: {message}");
            process::exit(1);
        }
    }
}

fn print_usage() {
    eprintln!("Usage: orcvmctl <vms|tasks|reap>");
}
