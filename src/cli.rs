//! Command line interface for the `hostwire` daemon.
//!
//! Every flag overrides the matching configuration file setting. The build
//! script also compiles this module to render the man page, so it depends
//! on `clap` alone.

use std::path::PathBuf;

use clap::Parser;

/// Command line arguments for the `hostwire` binary.
#[derive(Debug, Parser)]
#[command(
    name = "hostwire",
    version,
    about = "Multi-protocol JSON-RPC host agent"
)]
pub struct Cli {
    /// JSON configuration file.
    #[arg(short, long, env = "HOSTWIRE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Address to listen on.
    #[arg(long, env = "HOSTWIRE_HOST")]
    pub host: Option<String>,

    /// Port to listen on.
    #[arg(short, long, env = "HOSTWIRE_PORT")]
    pub port: Option<u16>,

    /// PEM certificate chain; enables TLS together with `--key`.
    #[arg(long, requires = "key")]
    pub cert: Option<PathBuf>,

    /// PEM private key.
    #[arg(long, requires = "cert")]
    pub key: Option<PathBuf>,

    /// PEM CA bundle used to verify client certificates.
    #[arg(long)]
    pub ca: Option<PathBuf>,

    /// TLS handshake timeout in seconds.
    #[arg(long)]
    pub ssl_handshake_timeout: Option<u64>,

    /// Protocol detection timeout in seconds.
    #[arg(long)]
    pub detector_timeout: Option<u64>,

    /// Concurrently executing RPC methods.
    #[arg(long)]
    pub workers: Option<usize>,

    /// Log filter directive, e.g. `debug` or `hostwire=trace`.
    #[arg(long, env = "RUST_LOG")]
    pub log_level: Option<String>,
}
