//! agent-chat: talk to a streaming agent from the terminal.
//! Reads config, connects, finishes any reply still in flight, then asks the
//! question from the arguments (or the first stdin line) and prints the
//! streamed answer to stdout.

use std::io::{self, BufRead, IsTerminal, Write};
use std::process;

use agent_chat_app::{ChatReply, ChatSession, CliArgs};
use agent_chat_client::{config, logging, Chunk};

fn print_chunk(chunk: &Chunk) {
    let mut out = io::stdout().lock();
    let _ = write!(out, "{}", chunk.body);
    let _ = out.flush();
}

/// Finish the answer line and report how the turn ended.
fn finish_reply(reply: &ChatReply) -> bool {
    println!();
    if reply.cancelled {
        eprintln!("Cancelled.");
    }
    if let Some(err) = &reply.error {
        eprintln!("Error: {}", err);
        return false;
    }
    true
}

fn read_question_from_stdin() -> Option<String> {
    let stdin = io::stdin();
    if stdin.is_terminal() {
        return None;
    }
    let mut line = String::new();
    stdin.lock().read_line(&mut line).unwrap_or(0);
    let line = line.trim();
    (!line.is_empty()).then(|| line.to_string())
}

fn main() {
    let args = CliArgs::parse(std::env::args().skip(1));

    let config_path = match config::resolve_config_path(args.config.as_deref()) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(1);
        }
    };

    let cfg = match config::load(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error: failed to load config from {}: {}", config_path.display(), e);
            process::exit(1);
        }
    };

    logging::init_logging(cfg.log_level(), cfg.log_format());

    let question = args.question.or_else(read_question_from_stdin);

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap_or_else(|e| {
            eprintln!("Error: failed to create runtime: {}", e);
            process::exit(1);
        });

    let ok = rt.block_on(async {
        let mut session = match ChatSession::open(cfg).await {
            Ok(s) => s,
            Err(e) => {
                eprintln!("Error: {}", e);
                process::exit(1);
            }
        };

        let cancel = session.cancel_handle();
        tokio::spawn(async move {
            while tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        });

        let mut ok = true;
        match session.resume_pending(print_chunk).await {
            Ok(Some(reply)) => ok &= finish_reply(&reply),
            Ok(None) => {}
            Err(e) => {
                eprintln!("Error: {}", e);
                return false;
            }
        }

        if let Some(question) = question {
            match session.ask(&question, print_chunk).await {
                Ok(reply) => ok &= finish_reply(&reply),
                Err(e) => {
                    eprintln!("Error: {}", e);
                    return false;
                }
            }
        }
        ok
    });

    if !ok {
        process::exit(1);
    }
}
