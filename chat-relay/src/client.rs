use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Local};
use tokio::{
    io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader},
    select,
};
use tracing::warn;

use crate::{
    cli::ClientArgs,
    message::Message,
    session::{ChatSession, WELCOME_TEXT},
    transport::{MockTransport, Transport, WsTransport},
};

pub const MOCK_WELCOME_TEXT: &str =
    "Welcome to the chat! This is a demo with mock socket connection.";

pub async fn run(args: ClientArgs) -> Result<()> {
    if args.mock {
        let transport = MockTransport::with_delay(Duration::from_millis(args.echo_delay_ms));
        run_session(ChatSession::with_welcome(transport, MOCK_WELCOME_TEXT)).await
    } else {
        let transport = WsTransport::connect(&args.server).await?;
        run_session(ChatSession::with_welcome(transport, WELCOME_TEXT)).await
    }
}

enum Step {
    Input(Option<String>),
    Received(Option<Message>),
    Interrupted,
}

async fn run_session<T: Transport>(mut session: ChatSession<T>) -> Result<()> {
    for message in session.messages() {
        write_stdout(&render_message(message)).await?;
    }

    let mut lines = BufReader::new(io::stdin()).lines();

    loop {
        // Both branches are cancel safe, so losing the race drops nothing.
        let step = select! {
            line = lines.next_line() => Step::Input(line?),
            received = session.receive() => Step::Received(received?),
            ctrl_c = tokio::signal::ctrl_c() => {
                handle_ctrl_c(ctrl_c);
                Step::Interrupted
            }
        };

        match step {
            Step::Input(Some(line)) => {
                if !handle_input(&mut session, &line).await? {
                    break;
                }
            }
            Step::Received(Some(message)) => write_stdout(&render_message(&message)).await?,
            Step::Received(None) => {
                write_stdout("*** connection closed").await?;
                break;
            }
            Step::Input(None) | Step::Interrupted => break,
        }
    }

    session.close().await?;
    Ok(())
}

async fn handle_input<T: Transport>(session: &mut ChatSession<T>, line: &str) -> Result<bool> {
    if line.trim().eq_ignore_ascii_case("/quit") {
        write_stdout("*** leaving chat").await?;
        return Ok(false);
    }
    session.send(line).await?;
    Ok(true)
}

fn handle_ctrl_c(result: io::Result<()>) {
    if let Err(error) = result {
        warn!(?error, "ctrl-c handler failed");
    }
}

pub fn render_message(message: &Message) -> String {
    if message.is_system {
        return format!("*** {}", message.text);
    }
    format!("[{}] {}", local_time(&message.timestamp), message.text)
}

fn local_time(timestamp: &str) -> String {
    match DateTime::parse_from_rfc3339(timestamp) {
        Ok(parsed) => parsed.with_timezone(&Local).format("%H:%M:%S").to_string(),
        Err(_) => timestamp.to_string(),
    }
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_messages_render_as_notices() {
        let message = Message::system("hello there");
        assert_eq!(render_message(&message), "*** hello there");
    }

    #[test]
    fn user_messages_render_with_clock_time() {
        let message = Message::user("hi");
        let rendered = render_message(&message);
        assert!(rendered.ends_with("] hi"), "unexpected render {rendered}");
        // "[HH:MM:SS] hi"
        assert_eq!(rendered.len(), "[00:00:00] hi".len());
    }

    #[test]
    fn unparseable_timestamps_render_raw() {
        let message = Message {
            text: "hi".into(),
            timestamp: "yesterday".into(),
            is_system: false,
        };
        assert_eq!(render_message(&message), "[yesterday] hi");
    }
}
