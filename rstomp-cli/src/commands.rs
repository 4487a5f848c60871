//! Command execution.

use crate::{AckArg, Commands};
use colored::Colorize;
use rstomp_client::{Client, Message};
use rstomp_protocol::headers::header;
use rstomp_protocol::{Command, Frame};
use sha2::{Digest, Sha256};

/// Executes a command. Returns output to print once the command completes.
pub async fn execute(
    client: &Client,
    cmd: Commands,
) -> Result<Option<String>, Box<dyn std::error::Error>> {
    match cmd {
        Commands::HashPassword { .. } => unreachable!(), // handled before connecting

        Commands::Info => {
            let info = client.info();
            let (send, receive) = info.heart_beat;
            Ok(Some(format!(
                "{}\n  Version: {}\n  Server: {}\n  Session: {}\n  Heart-beat: {}ms out, {}ms in",
                "Connected".green(),
                info.version.cyan(),
                info.server.as_deref().unwrap_or("-"),
                info.session.as_deref().unwrap_or("-"),
                send,
                receive
            )))
        }

        Commands::Send {
            destination,
            body,
            content_type,
            json,
            count,
            transaction,
        } => {
            let body = read_body_arg(&body)?;
            let content_type = if json {
                serde_json::from_str::<serde_json::Value>(&body)?;
                Some("application/json".to_string())
            } else {
                content_type
            };

            let tx = if transaction {
                Some(client.begin().await?)
            } else {
                None
            };
            for _ in 0..count {
                let mut frame = Frame::from_command(Command::Send)
                    .with_header(header::DESTINATION, destination.as_str());
                if let Some(ref ct) = content_type {
                    frame = frame.with_header(header::CONTENT_TYPE, ct.as_str());
                }
                if let Some(ref tx) = tx {
                    frame = frame.with_header(header::TRANSACTION, tx.id());
                }
                client.send_frame(frame.with_body(body.clone())).await?;
            }
            if let Some(tx) = tx {
                client.commit(tx).await?;
            }

            Ok(Some(format!(
                "{} {} message(s) to {}",
                "Sent".green(),
                count,
                destination.cyan()
            )))
        }

        Commands::Subscribe {
            destination,
            ack,
            count,
            headers,
        } => {
            let mut subscription = client.subscribe(&destination, ack.into()).await?;
            eprintln!(
                "{} {} ({})",
                "Subscribed to".green(),
                destination.cyan(),
                subscription.id()
            );
            eprintln!("{}", "Press Ctrl+C to stop...".dimmed());

            let mut received = 0u64;
            loop {
                tokio::select! {
                    message = subscription.next() => {
                        let Some(message) = message else {
                            eprintln!("{}", "Connection closed".red());
                            break;
                        };
                        println!("{}", format_message(&message, headers));
                        if !matches!(ack, AckArg::Auto) {
                            client.ack(&message).await?;
                        }
                        received += 1;
                        if count.is_some_and(|n| received >= n) {
                            break;
                        }
                    }
                    _ = tokio::signal::ctrl_c() => {
                        eprintln!("\n{}", "Stopping subscription...".dimmed());
                        break;
                    }
                }
            }

            client.unsubscribe(subscription).await?;
            Ok(None)
        }
    }
}

/// Hashes a passcode the way the broker stores it.
pub fn hash_passcode(passcode: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(passcode.as_bytes());
    hex::encode(hasher.finalize())
}

/// Reads a body argument, loading it from a file when prefixed with `@`.
fn read_body_arg(arg: &str) -> Result<String, Box<dyn std::error::Error>> {
    if let Some(path) = arg.strip_prefix('@') {
        Ok(std::fs::read_to_string(path)?)
    } else {
        Ok(arg.to_string())
    }
}

fn format_message(message: &Message, headers: bool) -> String {
    let body = match message.body_str() {
        Some(text) => text.to_string(),
        None => format!("<{} bytes binary>", message.body().len()),
    };
    if !headers {
        return body;
    }

    let frame = message.frame();
    let mut output = format!("{}\n", frame.name.bold());
    for (name, value) in frame.headers.iter() {
        output.push_str(&format!("  {}: {}\n", name.cyan(), value));
    }
    output.push_str(&body);
    output
}
