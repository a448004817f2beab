//! Authenticate a user against the system PAM configuration.
//!
//! Run as root (or with a service the caller may use):
//!
//! ```text
//! cargo run --features libpam --example basic_auth -- <user>
//! ```
//!
//! Prompts are answered interactively on the terminal. Note that echo-off
//! prompts are read with echo left on; use a real terminal helper in
//! production code.

use std::io::{BufRead, Write};
use std::sync::Arc;

use doorman_core::stack::libpam::LibPam;
use doorman_core::{
    Conversation, Error, Handle, Message, MessageStyle, Reply, Result, SessionConfig,
};

struct TerminalConversation;

impl Conversation for TerminalConversation {
    fn converse(&self, messages: &[Message]) -> Result<Vec<Reply>> {
        let mut replies = Vec::with_capacity(messages.len());
        let stdin = std::io::stdin();
        for message in messages {
            match message.style {
                MessageStyle::PromptEchoOff | MessageStyle::PromptEchoOn => {
                    print!("{}", message.text);
                    std::io::stdout()
                        .flush()
                        .map_err(|e| Error::Conversation(e.to_string()))?;
                    let mut line = String::new();
                    stdin
                        .lock()
                        .read_line(&mut line)
                        .map_err(|e| Error::Conversation(e.to_string()))?;
                    replies.push(Some(line.trim_end_matches('\n').to_string()));
                }
                MessageStyle::ErrorMsg => {
                    eprintln!("{}", message.text);
                    replies.push(None);
                }
                MessageStyle::TextInfo => {
                    println!("{}", message.text);
                    replies.push(None);
                }
            }
        }
        Ok(replies)
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let user = match std::env::args().nth(1) {
        Some(user) => user,
        None => {
            eprintln!("usage: basic_auth <user>");
            std::process::exit(2);
        }
    };

    let handle = match Handle::new(
        LibPam::new(),
        SessionConfig::new(user),
        Arc::new(TerminalConversation),
    ) {
        Ok(handle) => handle,
        Err(err) => {
            eprintln!("failed to start pam session: {err}");
            std::process::exit(1);
        }
    };

    if let Err(err) = handle.authenticate(false, false) {
        match &err {
            Error::Stack(stack_err) => {
                eprintln!(
                    "authentication failed: {} ({})",
                    stack_err.name(),
                    stack_err.err_str
                );
            }
            other => eprintln!("authentication failed: {other}"),
        }
        std::process::exit(1);
    }
    println!("authenticated");

    if let Err(err) = handle.acct_mgmt(false, false) {
        eprintln!("account validation failed: {err}");
        std::process::exit(1);
    }

    handle.open_session(false).expect("open_session");
    println!("session open; pam environment:");
    for (name, value) in handle.env_map() {
        println!("  {name}={value}");
    }
    handle.close_session(false).expect("close_session");
    println!("session closed");
}
