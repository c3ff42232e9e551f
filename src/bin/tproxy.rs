//! Standalone proxy binary.
//!
//! Usage:
//! ```
//! cargo run --bin tproxy -- --port 8080 --intercept --verbose
//! ```

use std::path::PathBuf;

use tproxy_core::api::proxy_api;
use tproxy_core::proxy::{run_server, ProxySettings};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = parse_args()?;

    proxy_api::init_core(
        settings.log_dir.as_ref().map(|dir| dir.display().to_string()),
        settings.verbose,
    )
    .map_err(anyhow::Error::msg)?;

    tracing::info!(
        "Starting tproxy v{} on {} (intercept: {})",
        tproxy_core::VERSION,
        settings.listen_address(),
        settings.intercept
    );

    tokio::select! {
        result = run_server(&settings) => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted, shutting down");
            Ok(())
        }
    }
}

fn parse_args() -> anyhow::Result<ProxySettings> {
    let raw: Vec<String> = std::env::args().skip(1).collect();
    let mut settings = ProxySettings::default();

    // A config file sets the baseline, flags override it
    if let Some(pos) = raw.iter().position(|arg| arg == "--config") {
        let path = raw
            .get(pos + 1)
            .ok_or_else(|| anyhow::anyhow!("--config needs a path"))?;
        settings = ProxySettings::from_json_file(path)?;
    }

    let mut args = raw.into_iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => {
                args.next();
            }
            "--port" | "-p" => {
                let value = next_value(&mut args, &arg)?;
                settings.port = value
                    .parse()
                    .map_err(|_| anyhow::anyhow!("Invalid port: {value}"))?;
            }
            "--bind" => settings.bind_address = next_value(&mut args, &arg)?,
            "--intercept" => settings.intercept = true,
            "--verbose" | "-v" => settings.verbose = true,
            "--upstream" => settings.upstream = Some(next_value(&mut args, &arg)?),
            "--outgoing-address" => {
                let value = next_value(&mut args, &arg)?;
                settings.tcp_outgoing_address = Some(
                    value
                        .parse()
                        .map_err(|_| anyhow::anyhow!("Invalid outgoing address: {value}"))?,
                );
            }
            "--cert" => settings.cert_path = Some(PathBuf::from(next_value(&mut args, &arg)?)),
            "--key" => settings.key_path = Some(PathBuf::from(next_value(&mut args, &arg)?)),
            "--verify-upstream-tls" => settings.verify_upstream_tls = true,
            "--log-dir" => settings.log_dir = Some(PathBuf::from(next_value(&mut args, &arg)?)),
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            _ => {
                eprintln!("Unknown argument: {arg}");
            }
        }
    }

    Ok(settings)
}

fn next_value(args: &mut impl Iterator<Item = String>, flag: &str) -> anyhow::Result<String> {
    args.next()
        .ok_or_else(|| anyhow::anyhow!("{flag} needs a value"))
}

fn print_help() {
    eprintln!("tproxy {}", tproxy_core::VERSION);
    eprintln!();
    eprintln!("Usage: tproxy [OPTIONS]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --config <FILE>            JSON settings file (flags override it)");
    eprintln!("  --port, -p <PORT>          Listen port (default: 8080)");
    eprintln!("  --bind <ADDR>              Bind address (default: 127.0.0.1)");
    eprintln!("  --intercept                Decrypt CONNECT tunnels (TLS MITM)");
    eprintln!("  --upstream <[U:P@]H:P>     Chain through another HTTP proxy");
    eprintln!("  --outgoing-address <IP>    Local address for upstream sockets");
    eprintln!("  --cert <PEM> --key <PEM>   Interception certificate and key");
    eprintln!("  --verify-upstream-tls      Verify origin certificates when intercepting");
    eprintln!("  --log-dir <DIR>            Write daily log files to DIR");
    eprintln!("  --verbose, -v              Debug logging (RUST_LOG overrides)");
    eprintln!("  --help, -h                 Show this help");
}
