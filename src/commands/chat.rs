//! Interactive chat with a running model
//!
//! Replies are printed as they stream in. Ctrl-C while a reply is streaming
//! abandons that reply (dropping the stream closes the connection) and
//! returns to the prompt; Ctrl-C or Ctrl-D at the prompt ends the session.

use std::future::Future;
use std::io::Write;

use colored::Colorize;
use futures::StreamExt;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

use crate::error::Result;
use crate::orchestrator::App;
use crate::relay::{ChatMessage, RelayEvent, RelayOutcome, RelayStream};

/// How a streamed reply ended
#[derive(Debug, PartialEq, Eq)]
pub enum Reply {
    /// The stream reached its end, successfully or not
    Finished(RelayOutcome),
    /// The user interrupted the reply
    Abandoned {
        /// Text shown before the interruption
        partial: String,
    },
}

/// Start a chat session, or answer a single prompt
///
/// # Arguments
///
/// * `app` - Application state
/// * `id` - Model to chat with; must be online
/// * `prompt` - Answer this prompt and return instead of starting a session
/// * `system` - Optional system prompt
pub async fn run_chat(
    app: &App,
    id: &str,
    prompt: Option<String>,
    system: Option<String>,
) -> Result<()> {
    let spec = app.supervisor().spec(id)?;
    let mut history = Vec::new();
    if let Some(system) = system {
        history.push(ChatMessage::system(system));
    }

    if let Some(prompt) = prompt {
        history.push(ChatMessage::user(prompt));
        let stream = app.chat(id, &history).await?;
        let reply = render_stream(stream, &mut std::io::stdout(), ctrl_c()).await?;
        return match reply {
            Reply::Finished(outcome) => outcome.into_result().map(|_| ()),
            Reply::Abandoned { .. } => Ok(()),
        };
    }

    let mut rl = DefaultEditor::new()?;
    println!(
        "Chatting with {} ({}). Type /help for commands, /exit to quit.\n",
        spec.name.bold(),
        spec.model_ref
    );

    loop {
        let line = match rl.readline(&format!("{} ", ">>".cyan())) {
            Ok(line) => line,
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => break,
            Err(e) => return Err(e.into()),
        };

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        match trimmed {
            "/exit" | "/quit" => break,
            "/clear" => {
                history.retain(|m: &ChatMessage| m.role == "system");
                println!("Conversation cleared\n");
                continue;
            }
            "/help" => {
                println!("/clear  forget the conversation so far");
                println!("/exit   leave the chat");
                println!("Ctrl-C while a reply streams stops that reply.\n");
                continue;
            }
            _ => {}
        }

        rl.add_history_entry(trimmed)?;
        history.push(ChatMessage::user(trimmed));

        let reply = match app.chat(id, &history).await {
            Ok(stream) => render_stream(stream, &mut std::io::stdout(), ctrl_c()).await?,
            Err(e) => {
                println!("{}\n", format!("Error: {}", e).red());
                history.pop();
                continue;
            }
        };

        match reply {
            Reply::Finished(RelayOutcome {
                text,
                failure: None,
            }) => {
                history.push(ChatMessage::assistant(text));
                println!();
            }
            Reply::Finished(RelayOutcome {
                failure: Some(failure),
                ..
            }) => {
                println!("{}\n", format!("Error: {}", failure).red());
                history.pop();
            }
            Reply::Abandoned { .. } => {
                println!("{}\n", "(reply stopped)".dimmed());
                history.pop();
            }
        }
    }

    Ok(())
}

async fn ctrl_c() {
    if tokio::signal::ctrl_c().await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Write deltas to `out` as they arrive until the stream ends or `cancel`
/// completes
pub async fn render_stream<W, C>(mut stream: RelayStream, out: &mut W, cancel: C) -> Result<Reply>
where
    W: Write,
    C: Future<Output = ()>,
{
    tokio::pin!(cancel);
    let mut shown = String::new();

    loop {
        tokio::select! {
            event = stream.next() => {
                let outcome = match event {
                    Some(RelayEvent::Delta(text)) => {
                        write!(out, "{}", text)?;
                        out.flush()?;
                        shown.push_str(&text);
                        continue;
                    }
                    Some(RelayEvent::Completed { text }) => RelayOutcome { text, failure: None },
                    Some(RelayEvent::Failed { failure, partial }) => RelayOutcome {
                        text: partial,
                        failure: Some(failure),
                    },
                    None => RelayOutcome { text: shown, failure: None },
                };
                writeln!(out)?;
                return Ok(Reply::Finished(outcome));
            }
            _ = &mut cancel => {
                writeln!(out)?;
                return Ok(Reply::Abandoned { partial: shown });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RelayConfig;
    use crate::relay::{RelayClient, RelayFailure};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn sse(lines: &[&str]) -> Vec<u8> {
        lines
            .iter()
            .map(|l| format!("{}\n\n", l))
            .collect::<String>()
            .into_bytes()
    }

    async fn stream_for(server: &MockServer) -> RelayStream {
        RelayClient::new(&RelayConfig::default())
            .unwrap()
            .relay(&server.uri(), "m", &[ChatMessage::user("hi")])
    }

    #[tokio::test]
    async fn test_render_stream_prints_deltas_in_order() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                sse(&[
                    r#"data: {"choices":[{"delta":{"content":"Hel"}}]}"#,
                    r#"data: {"choices":[{"delta":{"content":"lo"}}]}"#,
                    "data: [DONE]",
                ]),
                "text/event-stream",
            ))
            .mount(&server)
            .await;

        let mut out = Vec::new();
        let reply = render_stream(stream_for(&server).await, &mut out, std::future::pending())
            .await
            .unwrap();

        assert_eq!(String::from_utf8(out).unwrap(), "Hello\n");
        assert_eq!(
            reply,
            Reply::Finished(RelayOutcome {
                text: "Hello".to_string(),
                failure: None
            })
        );
    }

    #[tokio::test]
    async fn test_render_stream_reports_server_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("loading"))
            .mount(&server)
            .await;

        let mut out = Vec::new();
        let reply = render_stream(stream_for(&server).await, &mut out, std::future::pending())
            .await
            .unwrap();

        assert_eq!(
            reply,
            Reply::Finished(RelayOutcome {
                text: String::new(),
                failure: Some(RelayFailure::ServerError {
                    status: 503,
                    body: "loading".to_string()
                })
            })
        );
    }

    #[tokio::test]
    async fn test_render_stream_cancel_abandons_reply() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw(sse(&["data: [DONE]"]), "text/event-stream")
                    .set_delay(std::time::Duration::from_secs(10)),
            )
            .mount(&server)
            .await;

        let mut out = Vec::new();
        let started = std::time::Instant::now();
        let reply = render_stream(stream_for(&server).await, &mut out, async {})
            .await
            .unwrap();

        assert_eq!(
            reply,
            Reply::Abandoned {
                partial: String::new()
            }
        );
        assert!(started.elapsed() < std::time::Duration::from_secs(5));
    }
}
