use std::io::{BufRead, Write};

use crate::error::Result;
use crate::orchestrator::{Orchestrator, TurnOutcome};
use crate::session::{end_session, start_session};

/// Printed on an aborted turn. Genre-neutral on purpose: the narrator never
/// fabricates around an engine failure.
const TURN_ABORT_LINE: &str = "The scene holds — try again.";

/// Line-per-turn REPL. One line in, the narrator's final text out;
/// `/`-prefixed lines are table commands, not player actions.
pub async fn play(orchestrator: &mut Orchestrator) -> Result<()> {
    let registry = crate::prompts::PromptRegistry::builtin();
    let pins = orchestrator.campaign().prompt_versions.clone();
    let (session, recap) =
        start_session(orchestrator.store(), orchestrator.gateway(), &registry, &pins).await?;
    if let Some(recap) = recap {
        println!("\n{recap}\n");
    }
    println!("[{}] — type /quit to stop, /help for commands", orchestrator.campaign().name);

    let stdin = std::io::stdin();
    let mut lines = stdin.lock().lines();
    loop {
        print!("> ");
        std::io::stdout().flush()?;
        let Some(line) = lines.next() else {
            break;
        };
        let line = line?;
        let input = line.trim();
        if input.is_empty() {
            continue;
        }

        if let Some(command) = input.strip_prefix('/') {
            if !handle_command(orchestrator, command)? {
                break;
            }
            continue;
        }

        match orchestrator.run_turn(input).await {
            TurnOutcome::Committed {
                final_text,
                next_prompt,
                suggested_actions,
                ..
            } => {
                println!("\n{final_text}\n");
                if !suggested_actions.is_empty() {
                    println!("(You might: {})", suggested_actions.join(" · "));
                }
                println!("{next_prompt}");
            }
            TurnOutcome::Clarification { question, .. } => {
                println!("\n{question}");
            }
            TurnOutcome::Aborted { error } => {
                log::error!("aborted turn: {error}");
                println!("{TURN_ABORT_LINE}");
            }
        }
    }

    end_session(orchestrator.store(), &session)?;
    Ok(())
}

/// Returns false when the REPL should exit.
fn handle_command(orchestrator: &Orchestrator, command: &str) -> Result<bool> {
    let store = orchestrator.store();
    match command.split_whitespace().next().unwrap_or("") {
        "quit" | "q" | "exit" => return Ok(false),
        "help" => {
            println!("/status /clocks /scene /inventory /threads /debug /quit");
        }
        "status" => {
            println!(
                "{} — turn {}",
                orchestrator.campaign().name,
                store.last_turn()?
            );
            for clock in store.clocks()? {
                println!("  {}: {}/{}", clock.name, clock.value, clock.max);
            }
        }
        "clocks" => {
            for clock in store.clocks()? {
                let triggers: Vec<String> = clock
                    .triggers
                    .iter()
                    .map(|(at, key)| format!("{at}→{key}"))
                    .collect();
                println!("{}: {}/{} [{}]", clock.name, clock.value, clock.max, triggers.join(", "));
            }
        }
        "scene" => {
            if let Some(scene) = store.scene()? {
                println!("location: {}", scene.location);
                for id in &scene.present {
                    println!("  present: {id}");
                }
            } else {
                println!("no scene yet");
            }
        }
        "inventory" => {
            for entry in store.inventory()? {
                println!("{} x{} {:?}", entry.item, entry.quantity, entry.flags);
            }
        }
        "threads" => {
            for thread in store.threads()? {
                println!("{} [{}] {}", thread.id, thread.status, thread.title);
            }
        }
        "debug" => {
            let turn = store.last_turn()?;
            match store.event(turn)? {
                Some(record) => {
                    println!("{}", serde_json::to_string_pretty(&record)?)
                }
                None => println!("no turns recorded"),
            }
        }
        other => println!("unknown command: /{other}"),
    }
    Ok(true)
}
