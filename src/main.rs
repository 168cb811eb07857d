use anyhow::Result;
use clap::Parser;
use regex::Regex;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use tlsgrep::capture::PacketSource;
use tlsgrep::output::{self, Formatter};
use tlsgrep::protocol;
use tlsgrep::tls::{ClientSide, FlowConfig, KeyLog, TlsDecryptor};

#[derive(Parser)]
#[command(
    name = "tlsgrep",
    version,
    about = "Decrypt TLS 1.2 connections in a packet capture and grep their contents"
)]
struct Cli {
    /// Regex pattern to match against decrypted flow contents
    pattern: Option<String>,

    /// Read from pcap/pcapng file
    #[arg(short = 'I', long)]
    input: PathBuf,

    /// SSLKEYLOGFILE path for TLS decryption
    #[arg(long, env = "SSLKEYLOGFILE")]
    keylog: Option<PathBuf>,

    /// BPF filter expression (same syntax as tcpdump)
    #[arg(short = 'F', long)]
    bpf: Option<String>,

    /// Case-insensitive matching
    #[arg(short = 'i', long)]
    ignore_case: bool,

    /// Invert match (show non-matching flows)
    #[arg(short = 'v', long)]
    invert: bool,

    /// Output one JSON object per flow
    #[arg(long, conflicts_with = "hex")]
    json: bool,

    /// Show hex dump of decrypted data
    #[arg(short = 'x', long)]
    hex: bool,

    /// Quiet mode (decrypted data only, no flow headers)
    #[arg(short = 'q', long)]
    quiet: bool,

    /// Which TCP side is the TLS client
    #[arg(long, value_enum, default_value_t = ClientSide::Auto)]
    client_side: ClientSide,

    /// Increase log verbosity (-v is taken by --invert)
    #[arg(long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .with_writer(std::io::stderr)
        .init();

    let pattern = match &cli.pattern {
        Some(p) => {
            let pat = if cli.ignore_case {
                format!("(?i){}", p)
            } else {
                p.clone()
            };
            Some(Regex::new(&pat)?)
        }
        None => None,
    };

    let keylog = match &cli.keylog {
        Some(path) => Some(Arc::new(KeyLog::from_file(path)?)),
        None => {
            tracing::warn!("no key log given, encrypted records will not be decrypted");
            None
        }
    };
    let config = FlowConfig {
        client_side: cli.client_side,
        keylog,
    };

    let mut source = PacketSource::from_file(&cli.input, cli.bpf.as_deref())?;
    let link_type = source.link_type();
    let mut decryptor = TlsDecryptor::new(config);
    let mut packets: u64 = 0;

    source.for_each_packet(|packet_data| {
        packets += 1;
        if let Some(segment) = protocol::decode_segment(packet_data.data, link_type) {
            decryptor.process_segment(&segment);
        }
        true
    })?;

    let (evicted, evicted_tls) = (decryptor.evicted(), decryptor.evicted_tls());
    let flows = decryptor.finish();
    tracing::info!(
        packets,
        flows = flows.len(),
        evicted,
        evicted_tls,
        "capture processed"
    );

    let formatter = Formatter::new(cli.json, cli.hex, cli.quiet);
    for (key, flow) in &flows {
        let matched = match &pattern {
            Some(re) => re.is_match(&output::flow_payload_str(flow)) != cli.invert,
            None => !cli.invert,
        };
        if matched {
            formatter.print_flow(key, flow, &pattern);
        }
    }

    Ok(())
}
