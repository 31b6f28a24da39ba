use std::io::{self, Write};
use std::sync::Arc;

use anyhow::Result;
use chrono::Local;
use tokio::sync::{mpsc, watch};
use tracing::warn;

use mnemo_config::AgentConfig;
use mnemo_llm::{CompletionOptions, ModelClient, strip_reasoning};
use mnemo_memory::{AtomicChunk, ConsolidationResult, MemorySystem, RecordOutcome, StreamEvent, Turn};

/// Chunks injected into each chat prompt.
const RELEVANT_CHUNKS: usize = 5;

pub(crate) async fn run_chat_session(
    system: Arc<MemorySystem>,
    model: Arc<dyn ModelClient>,
    wire: bool,
) -> Result<()> {
    let (shutdown_tx, _shutdown_rx) = watch::channel(false);
    let archive_task = system.spawn_archive_task(&shutdown_tx);

    if !wire {
        let agent = &system.config().agent;
        println!("{} is online. Type /help for commands.", agent.name);
    }

    let stdin = io::stdin();
    loop {
        if !wire {
            print!("> ");
            io::stdout().flush()?;
        }
        let mut line = String::new();
        let bytes = stdin.read_line(&mut line)?;
        if bytes == 0 {
            break;
        }
        let line = line.trim();

        if line.is_empty() {
            continue;
        }

        if line == "/exit" {
            break;
        }

        if line == "/help" {
            println!("/help");
            println!("/sleep  -- consolidate the short-term buffer now");
            println!("/stats  -- memory statistics");
            println!("/exit");
            continue;
        }

        if line == "/sleep" {
            match system.consolidate().await {
                Ok(result) => print_consolidation(&result, wire),
                Err(err) => eprintln!("error: {err}"),
            }
            continue;
        }

        if line == "/stats" {
            crate::memory_cmds::run_stats(&system).await;
            continue;
        }

        if let Err(err) = chat_turn(&system, model.as_ref(), line, wire).await {
            eprintln!("error: {err:#}");
        }
    }

    let _ = shutdown_tx.send(true);
    if let Some(task) = archive_task {
        let _ = task.await;
    }
    if !wire {
        println!("session closed");
    }
    Ok(())
}

async fn chat_turn(system: &MemorySystem, model: &dyn ModelClient, line: &str, wire: bool) -> Result<()> {
    let config = system.config();
    let relevant = match system.relevant_chunks(line, RELEVANT_CHUNKS).await {
        Ok(hits) => hits.into_iter().map(|(chunk, _)| chunk).collect(),
        Err(err) => {
            warn!(%err, "knowledge lookup failed; answering without it");
            Vec::new()
        }
    };

    let history = system.recent_turns().await;
    let prompt = build_chat_prompt(&history, line);
    let options = CompletionOptions {
        temperature: config.llm.temperature,
        system: Some(build_system_prompt(&config.agent, &relevant)),
    };

    let (tx, mut rx) = mpsc::channel::<String>(64);
    let printer = tokio::spawn(async move {
        let mut stdout = io::stdout();
        while let Some(chunk) = rx.recv().await {
            let _ = write!(stdout, "{chunk}");
            let _ = stdout.flush();
        }
    });
    let reply = model.complete_stream(&prompt, &options, tx).await;
    let _ = printer.await;
    println!();

    // A failed completion records nothing; the exchange is buffered whole.
    let reply = reply?;
    let reply = strip_reasoning(&reply);
    let mut exchange = vec![Turn::user(line)];
    if !reply.is_empty() {
        exchange.push(Turn::assistant(reply));
    }
    let outcome = system.record_turns(exchange).await?;

    match outcome {
        RecordOutcome::Buffered => {
            if wire {
                println!("{}", StreamEvent::turn_metadata(None).to_wire());
            }
        }
        RecordOutcome::Consolidated(result) => print_consolidation(&result, wire),
        RecordOutcome::ConsolidationFailed(err) => {
            eprintln!("memory consolidation deferred: {err}");
            if wire {
                println!("{}", StreamEvent::turn_metadata(None).to_wire());
            }
        }
    }
    Ok(())
}

fn print_consolidation(result: &ConsolidationResult, wire: bool) {
    if wire {
        if let Some(notice) = StreamEvent::memory_notice(result) {
            print!("{}", notice.to_wire());
        }
        println!("{}", StreamEvent::turn_metadata(Some(result)).to_wire());
        return;
    }
    match StreamEvent::memory_notice(result) {
        Some(StreamEvent::MemoryWrite(text)) => println!("[{text}]"),
        _ => println!("[memory unchanged]"),
    }
    if let Some(index) = result.archived_snapshot {
        println!("[archive snapshot {index} written]");
    }
}

/// `system_role` with `{current_time}` filled in, followed by whatever
/// long-term knowledge is relevant to the message.
pub(crate) fn build_system_prompt(agent: &AgentConfig, relevant: &[AtomicChunk]) -> String {
    let now = Local::now().format("%A, %Y-%m-%d %H:%M").to_string();
    let mut prompt = agent.system_role.replace("{current_time}", &now);
    prompt.push_str(&format!("\nYour name is {}.", agent.name));

    if !relevant.is_empty() {
        let who = if agent.user_name.trim().is_empty() {
            "the user"
        } else {
            agent.user_name.trim()
        };
        prompt.push_str(&format!("\n\nWhat you know about {who}:\n"));
        for chunk in relevant {
            prompt.push_str(&format!("- ({}) {}\n", chunk.category, chunk.content));
        }
    }
    prompt
}

pub(crate) fn build_chat_prompt(history: &[Turn], message: &str) -> String {
    let mut prompt = String::new();
    for turn in history {
        prompt.push_str(&format!("{}: {}\n", turn.role.label(), turn.content.trim()));
    }
    prompt.push_str(&format!("user: {}\nassistant:", message.trim()));
    prompt
}
