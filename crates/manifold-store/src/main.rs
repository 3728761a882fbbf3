use std::io;
use std::os::unix::io::{FromRawFd, OwnedFd};
use std::path::PathBuf;
use std::process::exit;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use manifold_store::{Config, Exit, Framing, Server, StoreError};

/// Serve the most recent standard-input record over a unix socket.
#[derive(Debug, Parser)]
#[command(name = "manifold-store")]
struct Args {
    /// Fixed record length in bytes; selects fixed-length framing.
    #[arg(short = 'l', value_name = "LENGTH", conflicts_with = "separator")]
    length: Option<usize>,

    /// Record separator byte: a single character, or \0 for NUL.
    #[arg(short = 't', value_name = "SEP")]
    separator: Option<String>,

    /// Path of the unix socket to serve on.
    socket_path: PathBuf,
}

fn framing(args: &Args) -> Result<Framing, String> {
    if let Some(length) = args.length {
        if length == 0 {
            return Err("record length must be positive".to_string());
        }
        return Ok(Framing::FixedLength(length));
    }
    match args.separator.as_deref() {
        None => Ok(Framing::Separator(b'\n')),
        Some(arg) => match arg.as_bytes() {
            [byte] => Ok(Framing::Separator(*byte)),
            [b'\\', b'0'] => Ok(Framing::Separator(0)),
            _ => Err(format!(
                "record separator must be a single byte, got {arg:?}"
            )),
        },
    }
}

fn run(args: Args) -> Result<Exit, StoreError> {
    let framing = framing(&args).map_err(StoreError::Usage)?;
    let config = Config::with_framing(framing);

    let stdin = dup_stdin().map_err(|e| StoreError::io("duplicating standard input", e))?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| StoreError::io("starting the event loop runtime", e))?;

    runtime.block_on(async {
        let mut server = Server::bind(config, &args.socket_path, stdin)?;
        server.run().await
    })
}

fn dup_stdin() -> io::Result<OwnedFd> {
    let fd = unsafe { libc::dup(0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            // Usage problems exit 1, whatever clap's own convention says.
            let _ = e.print();
            exit(1);
        }
    };

    match run(args) {
        Ok(Exit::Quit) => exit(0),
        Err(e) => {
            eprintln!("manifold-store: {e}");
            exit(e.exit_code());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(argv: &[&str]) -> Args {
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn default_framing_is_newline_separated() {
        let args = parse(&["manifold-store", "/tmp/s.sock"]);
        assert_eq!(framing(&args).unwrap(), Framing::Separator(b'\n'));
    }

    #[test]
    fn length_flag_selects_fixed_framing() {
        let args = parse(&["manifold-store", "-l", "4", "/tmp/s.sock"]);
        assert_eq!(framing(&args).unwrap(), Framing::FixedLength(4));
    }

    #[test]
    fn zero_length_is_a_usage_error() {
        let args = parse(&["manifold-store", "-l", "0", "/tmp/s.sock"]);
        assert!(framing(&args).is_err());
    }

    #[test]
    fn separator_accepts_single_byte_and_nul_escape() {
        let args = parse(&["manifold-store", "-t", ";", "/tmp/s.sock"]);
        assert_eq!(framing(&args).unwrap(), Framing::Separator(b';'));

        let args = parse(&["manifold-store", "-t", "\\0", "/tmp/s.sock"]);
        assert_eq!(framing(&args).unwrap(), Framing::Separator(0));

        let args = parse(&["manifold-store", "-t", "ab", "/tmp/s.sock"]);
        assert!(framing(&args).is_err());
    }

    #[test]
    fn length_and_separator_flags_conflict() {
        assert!(
            Args::try_parse_from(["manifold-store", "-l", "4", "-t", ";", "/tmp/s.sock"]).is_err()
        );
    }

    #[test]
    fn socket_path_is_required() {
        assert!(Args::try_parse_from(["manifold-store"]).is_err());
    }
}
