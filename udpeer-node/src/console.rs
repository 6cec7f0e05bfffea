//! Operator console: reads commands from stdin and prints results to stdout.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Instant;

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, warn};
use udpeer_core::Device;

use crate::delivery::UdpLink;
use crate::sender::{send_file, send_talk};
use crate::service::SharedRegistry;

const HELP: &str = "\
commands:
  devices                    list peers heard from recently
  talk <name> <message...>   send a text message
  sendfile <name> <file>     send a file from the outbox directory
  help                       show this text
  quit                       stop the node";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Devices,
    Talk { to: String, text: String },
    SendFile { to: String, file: String },
    Help,
    Quit,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("empty line")]
    Empty,
    #[error("unknown command {0:?}, try `help`")]
    Unknown(String),
    #[error("usage: {0}")]
    Usage(&'static str),
}

pub fn parse_command(line: &str) -> Result<Command, ParseError> {
    let line = line.trim();
    let (word, rest) = match line.split_once(char::is_whitespace) {
        Some((w, r)) => (w, r.trim_start()),
        None => (line, ""),
    };
    match word.to_ascii_lowercase().as_str() {
        "" => Err(ParseError::Empty),
        "devices" | "list" => Ok(Command::Devices),
        "help" | "?" => Ok(Command::Help),
        "quit" | "exit" => Ok(Command::Quit),
        "talk" => {
            let (to, text) = rest
                .split_once(char::is_whitespace)
                .map(|(to, text)| (to, text.trim()))
                .filter(|(_, text)| !text.is_empty())
                .ok_or(ParseError::Usage("talk <name> <message...>"))?;
            Ok(Command::Talk {
                to: to.to_string(),
                text: text.to_string(),
            })
        }
        "sendfile" => {
            let mut args = rest.split_whitespace();
            match (args.next(), args.next(), args.next()) {
                (Some(to), Some(file), None) => Ok(Command::SendFile {
                    to: to.to_string(),
                    file: file.to_string(),
                }),
                _ => Err(ParseError::Usage("sendfile <name> <file>")),
            }
        }
        other => Err(ParseError::Unknown(other.to_string())),
    }
}

/// One line per device, oldest heartbeat last.
pub fn render_devices(devices: &[Device], now: Instant) -> String {
    if devices.is_empty() {
        return "no devices".to_string();
    }
    let mut rows: Vec<&Device> = devices.iter().collect();
    rows.sort_by_key(|d| d.silence(now));
    rows.iter()
        .map(|d| {
            format!(
                "{:<20} {:<22} {:.1}s ago",
                d.name,
                d.addr,
                d.silence(now).as_secs_f32()
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Run until `quit`. At end of input the console goes quiet and the node keeps serving.
pub async fn run_console(registry: SharedRegistry, outbox: PathBuf) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    println!("{HELP}");
    while let Some(line) = lines.next_line().await? {
        let cmd = match parse_command(&line) {
            Ok(cmd) => cmd,
            Err(ParseError::Empty) => continue,
            Err(e) => {
                println!("{e}");
                continue;
            }
        };
        debug!(?cmd, "console command");
        match cmd {
            Command::Quit => return Ok(()),
            Command::Help => println!("{HELP}"),
            Command::Devices => {
                let devices = registry.lock().await.snapshot();
                println!("{}", render_devices(&devices, Instant::now()));
            }
            Command::Talk { to, text } => {
                let Some(addr) = lookup(&registry, &to).await else {
                    continue;
                };
                talk(addr, &to, &text).await;
            }
            Command::SendFile { to, file } => {
                let Some(addr) = lookup(&registry, &to).await else {
                    continue;
                };
                transfer(addr, &to, &outbox.join(&file)).await;
            }
        }
    }
    debug!("stdin closed");
    std::future::pending::<()>().await;
    Ok(())
}

async fn lookup(registry: &SharedRegistry, name: &str) -> Option<SocketAddr> {
    let addr = registry.lock().await.get(name).map(|d| d.addr);
    if addr.is_none() {
        println!("unknown device {name:?}; run `devices` to list peers");
    }
    addr
}

async fn talk(addr: SocketAddr, to: &str, text: &str) {
    let link = match UdpLink::open(addr).await {
        Ok(link) => link,
        Err(e) => {
            warn!(error = %e, "cannot open socket");
            println!("talk failed: {e}");
            return;
        }
    };
    match send_talk(&link, text).await {
        Ok(_) => println!("delivered to {to}"),
        Err(e) => println!("talk to {to} failed: {e}"),
    }
}

async fn transfer(addr: SocketAddr, to: &str, path: &Path) {
    let link = match UdpLink::open(addr).await {
        Ok(link) => link,
        Err(e) => {
            warn!(error = %e, "cannot open socket");
            println!("sendfile failed: {e}");
            return;
        }
    };
    println!("sending {} to {to}", path.display());
    let mut shown = None;
    let result = send_file(&link, path, |p| {
        let step = p.percent / 10;
        if shown != Some(step) {
            shown = Some(step);
            println!("  {}% ({}/{} bytes)", p.percent, p.sent, p.total);
        }
    })
    .await;
    match result {
        Ok(report) => println!(
            "sent {} ({} bytes, {} chunks) to {to}",
            path.display(),
            report.bytes_sent,
            report.chunks
        ),
        Err(e) => println!("sendfile to {to} failed: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn parses_simple_commands() {
        assert_eq!(parse_command("devices"), Ok(Command::Devices));
        assert_eq!(parse_command("  HELP "), Ok(Command::Help));
        assert_eq!(parse_command("quit"), Ok(Command::Quit));
        assert_eq!(parse_command("   "), Err(ParseError::Empty));
    }

    #[test]
    fn talk_keeps_message_spacing() {
        assert_eq!(
            parse_command("talk bob  hello  there bob"),
            Ok(Command::Talk {
                to: "bob".into(),
                text: "hello  there bob".into()
            })
        );
        assert!(matches!(
            parse_command("talk bob"),
            Err(ParseError::Usage(_))
        ));
        assert!(matches!(parse_command("talk"), Err(ParseError::Usage(_))));
    }

    #[test]
    fn sendfile_takes_exactly_two_arguments() {
        assert_eq!(
            parse_command("sendfile bob photo.jpg"),
            Ok(Command::SendFile {
                to: "bob".into(),
                file: "photo.jpg".into()
            })
        );
        assert!(matches!(
            parse_command("sendfile bob"),
            Err(ParseError::Usage(_))
        ));
        assert!(matches!(
            parse_command("sendfile bob a b"),
            Err(ParseError::Usage(_))
        ));
    }

    #[test]
    fn unknown_command_named_in_error() {
        assert_eq!(
            parse_command("fly away"),
            Err(ParseError::Unknown("fly".into()))
        );
    }

    #[test]
    fn devices_listed_most_recent_first() {
        let now = Instant::now();
        let devices = vec![
            Device {
                name: "old".into(),
                addr: "10.0.0.2:5000".parse().unwrap(),
                last_heartbeat: now - Duration::from_secs(8),
            },
            Device {
                name: "fresh".into(),
                addr: "10.0.0.3:5000".parse().unwrap(),
                last_heartbeat: now - Duration::from_secs(1),
            },
        ];
        let out = render_devices(&devices, now);
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("fresh"));
        assert!(lines[1].starts_with("old"));
        assert!(lines[1].contains("8.0s ago"));
        assert_eq!(render_devices(&[], now), "no devices");
    }
}
