use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use fateloom::config::EngineSettings;
use fateloom::error::{EngineError, Result};
use fateloom::gateway::{Gateway, MockProvider, OpenAiProvider, ProviderAdapter};
use fateloom::lore::index::LoreIndex;
use fateloom::lore::vectors::VectorLore;
use fateloom::orchestrator::{Orchestrator, TurnOutcome};
use fateloom::prompts::PromptRegistry;
use fateloom::scenario::{Scenario, seed_campaign};
use fateloom::state::Store;

#[derive(Parser)]
#[command(name = "fateloom", version, about = "Turn-based narrative RPG engine")]
struct Cli {
    /// Campaign database path.
    #[arg(long, default_value = "campaign.db")]
    db: PathBuf,

    /// Campaign id inside the database.
    #[arg(long, default_value = "campaign:main")]
    campaign: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Initialize a campaign state store.
    Init,
    /// Seed state from a scenario definition.
    NewGame {
        #[arg(long)]
        scenario: PathBuf,
        #[arg(long)]
        preset: Option<String>,
    },
    /// Interactive REPL: one line per turn.
    Play,
    /// Execute a single turn programmatically.
    RunTurn {
        #[arg(long)]
        input: String,
        /// JSON map of prompt id -> version, overriding the campaign pins.
        #[arg(long)]
        prompt_versions: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Display a stored event record.
    ShowEvent {
        #[arg(long)]
        turn: u64,
        #[arg(long)]
        field: Option<String>,
    },
    /// Replay a turn range into a sandbox campaign.
    Replay {
        #[arg(long)]
        start: u64,
        #[arg(long)]
        end: u64,
        #[arg(long)]
        prompt_overrides: Option<String>,
    },
    /// Install a content pack directory.
    InstallPack { path: PathBuf },
    /// List installed content packs.
    ListPacks,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let data_dir = cli
        .db
        .parent()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    if let Err(e) = fateloom::logging::init(data_dir) {
        eprintln!("could not initialize logging: {e}");
    }

    match run(cli).await {
        Ok(code) => code,
        Err(error) => {
            eprintln!("error: {error}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let settings = EngineSettings::load_from_dir(
        cli.db.parent().unwrap_or_else(|| std::path::Path::new(".")),
    )?;

    match cli.command {
        Command::Init => {
            Store::open(&cli.db, &cli.campaign)?;
            LoreIndex::open(&cli.db)?;
            println!("initialized {}", cli.db.display());
            Ok(ExitCode::SUCCESS)
        }

        Command::NewGame { scenario, preset } => {
            let scenario = Scenario::load(&scenario)?;
            let mut store = Store::open(&cli.db, &cli.campaign)?;
            let mut index = LoreIndex::open(&cli.db)?;
            seed_campaign(&mut store, &mut index, &scenario, preset.as_deref())?;
            println!("seeded campaign `{}` from {}", cli.campaign, scenario.id);
            Ok(ExitCode::SUCCESS)
        }

        Command::Play => {
            let mut orchestrator = build_orchestrator(&cli, settings).await?;
            fateloom::repl::play(&mut orchestrator).await?;
            Ok(ExitCode::SUCCESS)
        }

        Command::RunTurn {
            ref input,
            ref prompt_versions,
            json,
        } => {
            let pins = parse_pin_map(prompt_versions.as_deref())?;
            let mut orchestrator = build_orchestrator(&cli, settings).await?;
            let outcome = orchestrator
                .run_turn_with_pins(&input, pins.as_ref())
                .await;
            if json {
                println!("{}", serde_json::to_string_pretty(&outcome)?);
            } else {
                match &outcome {
                    TurnOutcome::Committed { final_text, .. } => println!("{final_text}"),
                    TurnOutcome::Clarification { question, .. } => println!("{question}"),
                    TurnOutcome::Aborted { error } => eprintln!("turn aborted: {error}"),
                }
            }
            Ok(match outcome {
                TurnOutcome::Aborted { .. } => ExitCode::FAILURE,
                _ => ExitCode::SUCCESS,
            })
        }

        Command::ShowEvent { turn, field } => {
            let store = Store::open(&cli.db, &cli.campaign)?;
            let Some(record) = store.event(turn)? else {
                return Err(EngineError::TurnNotFound(turn).into());
            };
            let value = serde_json::to_value(&record)?;
            match field {
                Some(field) => match value.get(&field) {
                    Some(section) => println!("{}", serde_json::to_string_pretty(section)?),
                    None => {
                        eprintln!("no field `{field}` on event records");
                        return Ok(ExitCode::FAILURE);
                    }
                },
                None => println!("{}", serde_json::to_string_pretty(&value)?),
            }
            Ok(ExitCode::SUCCESS)
        }

        Command::Replay {
            start,
            end,
            ref prompt_overrides,
        } => {
            let pins = parse_pin_map(prompt_overrides.as_deref())?;
            let mut orchestrator = build_orchestrator(&cli, settings).await?;
            let report = orchestrator.replay(start, end, pins.as_ref()).await?;
            println!("sandbox: {}", report.sandbox_campaign);
            for turn in &report.turns {
                let marker = if turn.original_final_text == turn.replayed_final_text {
                    "="
                } else {
                    "≠"
                };
                println!("turn {} {marker}", turn.turn);
            }
            Ok(ExitCode::SUCCESS)
        }

        Command::InstallPack { path } => {
            let mut index = LoreIndex::open(&cli.db)?;
            let (manifest, chunks) = index.install_pack(&path)?;
            println!("installed {} v{} ({chunks} chunks)", manifest.id, manifest.version);
            if settings.embeddings {
                let vectors = VectorLore::open(&vectors_path(&cli.db)).await?;
                vectors.add_chunks(&index.authored_chunks()?).await?;
                println!("embeddings updated");
            }
            Ok(ExitCode::SUCCESS)
        }

        Command::ListPacks => {
            let index = LoreIndex::open(&cli.db)?;
            for pack in index.list_packs()? {
                println!(
                    "{} v{} (layer {}, {} chunks) — {}",
                    pack.id, pack.version, pack.layer, pack.chunk_count, pack.name
                );
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn vectors_path(db: &PathBuf) -> PathBuf {
    db.with_extension("vectors.db")
}

fn parse_pin_map(raw: Option<&str>) -> Result<Option<BTreeMap<String, String>>> {
    raw.map(|raw| serde_json::from_str(raw).map_err(Into::into))
        .transpose()
}

async fn build_orchestrator(cli: &Cli, settings: EngineSettings) -> Result<Orchestrator> {
    let provider: Box<dyn ProviderAdapter> = if std::env::var("OPENAI_API_KEY").is_ok() {
        Box::new(OpenAiProvider::from_env())
    } else {
        log::warn!("OPENAI_API_KEY not set; using the mock provider");
        Box::new(MockProvider::new())
    };
    let gateway = Gateway::new(provider, settings.clone());
    let vectors = if settings.embeddings {
        Some(VectorLore::open(&vectors_path(&cli.db)).await?)
    } else {
        None
    };
    Orchestrator::new(
        cli.db.clone(),
        &cli.campaign,
        gateway,
        PromptRegistry::builtin(),
        settings,
        vectors,
    )
    .await
}
