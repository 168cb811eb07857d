use colored::Colorize;
use regex::Regex;
use serde_json::json;

use crate::protocol::StreamKey;
use crate::reassembly::Side;
use crate::tls::Flow;
use crate::tls::handshake::cipher_suite_name;

pub struct Formatter {
    json: bool,
    hex: bool,
    quiet: bool,
}

impl Formatter {
    pub fn new(json: bool, hex: bool, quiet: bool) -> Self {
        Formatter { json, hex, quiet }
    }

    pub fn print_flow(&self, key: &StreamKey, flow: &Flow, pattern: &Option<Regex>) {
        if self.json {
            println!("{}", flow_json(key, flow));
        } else {
            self.print_flow_text(key, flow, pattern);
        }
    }

    fn print_flow_text(&self, key: &StreamKey, flow: &Flow, pattern: &Option<Regex>) {
        if !self.quiet {
            let suite = suite_label(flow);
            eprintln!(
                "{} {} {} epochs={} ({} bytes)",
                "TLS".cyan().bold(),
                key.to_string().green(),
                suite.yellow(),
                flow.old_states().len() + 1,
                flow.fwd().application_data().len() + flow.rev().application_data().len()
            );
        }

        for side in [Side::Forward, Side::Reverse] {
            let direction = flow.direction(side);
            let data = direction.application_data();
            let stats = direction.stats();

            if !self.quiet {
                let role = direction
                    .plex()
                    .map(|plex| format!("{:?}", plex.writer()).to_lowercase())
                    .unwrap_or_default();
                let mut notes = Vec::new();
                if stats.undecryptable > 0 {
                    notes.push(format!("{} undecryptable", stats.undecryptable));
                }
                if direction.is_truncated() {
                    notes.push("truncated".to_string());
                }
                if direction.is_stalled() {
                    notes.push("stalled".to_string());
                }
                let notes = if notes.is_empty() {
                    String::new()
                } else {
                    format!(" [{}]", notes.join(", "))
                };
                eprintln!(
                    "  {} {} {} ({} bytes){}",
                    "->".dimmed(),
                    side.to_string().blue(),
                    role,
                    data.len(),
                    notes.red()
                );
            }

            if data.is_empty() {
                continue;
            }
            if self.hex {
                print_hex(data);
            } else {
                let text = sanitize_control_chars(&String::from_utf8_lossy(data));
                print_highlighted(&text, pattern);
            }
        }
    }
}

/// Decrypted text of both directions, used for pattern matching.
pub fn flow_payload_str(flow: &Flow) -> String {
    let fwd = String::from_utf8_lossy(flow.fwd().application_data());
    let rev = String::from_utf8_lossy(flow.rev().application_data());
    format!("{}\n{}", fwd, rev)
}

fn suite_label(flow: &Flow) -> String {
    match flow.connstate().and_then(|period| period.cipher_suite()) {
        Some(id) => cipher_suite_name(id)
            .map(str::to_string)
            .unwrap_or_else(|| format!("0x{:04x}", id)),
        None => "no cipher negotiated".to_string(),
    }
}

fn flow_json(key: &StreamKey, flow: &Flow) -> serde_json::Value {
    let directions: Vec<_> = [Side::Forward, Side::Reverse]
        .into_iter()
        .map(|side| {
            let direction = flow.direction(side);
            json!({
                "side": side,
                "role": direction.plex().map(|plex| plex.writer()),
                "stats": direction.stats(),
                "stalled": direction.is_stalled(),
                "truncated": direction.is_truncated(),
                "payload": String::from_utf8_lossy(direction.application_data()),
            })
        })
        .collect();

    let suite = flow.connstate().and_then(|period| period.cipher_suite());
    json!({
        "type": "tls_flow",
        "stream": key.to_string(),
        "client_side": flow.client_side(),
        "cipher_suite": suite.map(|id| format!("0x{:04x}", id)),
        "cipher_suite_name": suite.and_then(cipher_suite_name),
        "epochs": flow.old_states().len() + 1,
        "directions": directions,
    })
}

/// Replace control characters other than tab, CR, and LF with U+FFFD so that
/// decrypted payloads cannot inject terminal escape sequences.
pub fn sanitize_control_chars(s: &str) -> String {
    s.chars()
        .map(|c| match c {
            '\t' | '\n' | '\r' => c,
            c if c.is_control() => '\u{FFFD}',
            c => c,
        })
        .collect()
}

/// Print payload with regex matches highlighted in red.
fn print_highlighted(text: &str, pattern: &Option<Regex>) {
    match pattern {
        Some(re) => {
            let mut last = 0;
            for m in re.find_iter(text) {
                print!("{}", &text[last..m.start()]);
                print!("{}", m.as_str().red().bold());
                last = m.end();
            }
            println!("{}", &text[last..]);
        }
        None => println!("{}", text),
    }
}

/// Print hex + ASCII dump.
fn print_hex(data: &[u8]) {
    for (i, chunk) in data.chunks(16).enumerate() {
        println!("{}", hex_line(i * 16, chunk));
    }
}

fn hex_line(offset: usize, chunk: &[u8]) -> String {
    let mut line = format!("{:08x}  ", offset);
    for j in 0..16 {
        match chunk.get(j) {
            Some(byte) => line.push_str(&format!("{:02x} ", byte)),
            None => line.push_str("   "),
        }
        if j == 7 {
            line.push(' ');
        }
    }
    line.push_str(" |");
    line.extend(chunk.iter().map(|&b| {
        if b.is_ascii_graphic() || b == b' ' {
            b as char
        } else {
            '.'
        }
    }));
    line.push('|');
    line
}
