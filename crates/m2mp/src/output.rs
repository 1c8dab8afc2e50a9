use std::io::{IsTerminal, Write};
use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde::Serialize;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
    Raw,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

#[derive(Serialize)]
struct MessageOutput<'a> {
    schema_id: &'a str,
    message_id: String,
    payload_size: usize,
    payload: String,
    timestamp: String,
}

#[derive(Serialize)]
struct SentOutput<'a> {
    schema_id: &'a str,
    message_id: String,
    payload_size: usize,
    fragments: usize,
    redundancy: u32,
    timestamp: String,
}

#[derive(Serialize)]
struct ListeningOutput<'a> {
    schema_id: &'a str,
    addr: String,
    channel: &'a str,
    timestamp: String,
}

pub fn print_message(message_id: u32, payload: &[u8], format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(&MessageOutput {
            schema_id: "https://schemas.3leaps.dev/m2mp/cli/v1/message-received.schema.json",
            message_id: message_id_hex(message_id),
            payload_size: payload.len(),
            payload: payload_preview(payload),
            timestamp: now_unix_seconds(),
        }),
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["MESSAGE", "SIZE", "PAYLOAD"])
                .add_row(vec![
                    message_id_hex(message_id),
                    payload.len().to_string(),
                    payload_preview(payload),
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty => {
            println!(
                "message={} size={} payload={}",
                message_id_hex(message_id),
                payload.len(),
                payload_preview(payload)
            );
        }
        OutputFormat::Raw => print_raw(payload),
    }
}

pub fn print_sent(
    message_id: u32,
    payload_size: usize,
    fragments: usize,
    redundancy: u32,
    format: OutputFormat,
) {
    match format {
        OutputFormat::Json => print_json(&SentOutput {
            schema_id: "https://schemas.3leaps.dev/m2mp/cli/v1/message-sent.schema.json",
            message_id: message_id_hex(message_id),
            payload_size,
            fragments,
            redundancy,
            timestamp: now_unix_seconds(),
        }),
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["MESSAGE", "SIZE", "FRAGMENTS", "REDUNDANCY"])
                .add_row(vec![
                    message_id_hex(message_id),
                    payload_size.to_string(),
                    fragments.to_string(),
                    redundancy.to_string(),
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty => {
            println!(
                "sent message={} size={} fragments={} redundancy={}",
                message_id_hex(message_id),
                payload_size,
                fragments,
                redundancy
            );
        }
        OutputFormat::Raw => {}
    }
}

pub fn print_listening(addr: SocketAddr, channel: &str, format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(&ListeningOutput {
            schema_id: "https://schemas.3leaps.dev/m2mp/cli/v1/daemon-listening.schema.json",
            addr: addr.to_string(),
            channel,
            timestamp: now_unix_seconds(),
        }),
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["LISTENING", "CHANNEL"])
                .add_row(vec![addr.to_string(), channel.to_string()]);
            println!("{table}");
        }
        OutputFormat::Pretty | OutputFormat::Raw => {
            println!("listening={addr} channel={channel}");
        }
    }
    let _ = std::io::stdout().flush();
}

pub fn print_raw(data: &[u8]) {
    let mut out = std::io::stdout();
    let _ = out.write_all(data);
    let _ = out.flush();
}

fn print_json<T: Serialize>(value: &T) {
    println!(
        "{}",
        serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string())
    );
}

fn message_id_hex(message_id: u32) -> String {
    format!("{message_id:08x}")
}

fn payload_preview(payload: &[u8]) -> String {
    match std::str::from_utf8(payload) {
        Ok(text) => text.to_string(),
        Err(_) => format!("<binary {} bytes>", payload.len()),
    }
}

fn now_unix_seconds() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().to_string())
        .unwrap_or_else(|_| "0".to_string())
}
