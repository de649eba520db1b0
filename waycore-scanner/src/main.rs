use std::io;
use std::process;

use waycore_scanner::{emit, header, parse, Side};

const USAGE: &str = "\
usage: waycore-scanner [client-header|server-header|code|help] < protocol.xml > output.rs

Reads an XML protocol description from standard input and writes the
requested artifact to standard output:

  client-header  opcode/since constants and enums for client code
  server-header  opcode/since constants and enums for server code
  code           the interface data tables used by the runtime
";

enum Mode {
    ClientHeader,
    ServerHeader,
    Code,
}

fn main() {
    let mode = match std::env::args().nth(1).as_deref() {
        Some("client-header") => Mode::ClientHeader,
        Some("server-header") => Mode::ServerHeader,
        Some("code") => Mode::Code,
        Some("help") | Some("--help") => {
            print!("{}", USAGE);
            return;
        }
        _ => {
            eprint!("{}", USAGE);
            process::exit(1);
        }
    };

    let protocol = match parse::parse_stream(io::stdin().lock()) {
        Ok(protocol) => protocol,
        Err(e) => {
            eprintln!("waycore-scanner: {}", e);
            process::exit(1);
        }
    };

    let stdout = io::stdout();
    let mut out = stdout.lock();
    let written = match mode {
        Mode::ClientHeader => header::emit_header(&protocol, Side::Client, &mut out),
        Mode::ServerHeader => header::emit_header(&protocol, Side::Server, &mut out),
        Mode::Code => emit::emit_code(&protocol, &mut out),
    };
    if let Err(e) = written {
        eprintln!("waycore-scanner: write failed: {}", e);
        process::exit(1);
    }
}
