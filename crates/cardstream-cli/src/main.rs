//! Streams cards (or a chat answer) from a prompt backend to the terminal.

use std::io::Write as _;
use std::path::PathBuf;
use std::process::ExitCode;

use cardstream::prelude::*;
use cardstream::{FilePinboard, Notice, Pinboard, init_observability};
use clap::Parser;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "cardstream")]
#[command(about = "Stream cards from a prompt backend and print them as they arrive")]
struct Args {
    /// Prompt identifier for the first turn.
    #[arg(long)]
    prompt_id: Option<String>,

    /// User input for the first turn.
    #[arg(long)]
    input: String,

    /// Number of "generate more" turns after the first one.
    #[arg(long, default_value_t = 0, conflicts_with = "chat")]
    more: u32,

    /// Treat the answer as free text instead of a list of cards.
    #[arg(long, default_value_t = false)]
    chat: bool,

    /// Pin the card (or chat answer) at this index once all turns are done.
    #[arg(long)]
    pin: Option<usize>,

    /// File the pinboard is stored in.
    #[arg(long, default_value = "pinboard.json")]
    pin_file: PathBuf,
}

/// Load .env from the crate dir or the current dir.
fn load_env() {
    if let Ok(canon) = std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
        .join(".env")
        .canonicalize()
    {
        let _ = dotenvy::from_path(canon);
    }
    let _ = dotenvy::dotenv();
}

#[tokio::main]
async fn main() -> ExitCode {
    load_env();
    init_observability();
    let args = Args::parse();

    let client = match Client::from_env() {
        Ok(client) => client,
        Err(err) => {
            eprintln!("error: {err}");
            return ExitCode::from(2);
        }
    };
    let mut conversation = client.conversation(ConversationConfig::named("cli"));

    let mut request = ConversationRequest::new(args.input.clone());
    if let Some(prompt_id) = &args.prompt_id {
        request = request.prompt_id(prompt_id.clone());
    }
    let format = if args.chat {
        ResponseFormat::Text
    } else {
        ResponseFormat::Cards
    };

    let mut answers = Vec::new();
    match conversation
        .turn(request)
        .format(format)
        .mode(MergeMode::Replace)
        .new_conversation(true)
        .start_stream()
        .await
    {
        Ok(stream) => answers.extend(render_turn(stream, format).await),
        Err(err) => {
            eprintln!("error: {err}");
            return ExitCode::from(2);
        }
    }

    for round in 0..args.more {
        info!(round, "requesting more cards");
        match conversation.generate_more().start_stream().await {
            Ok(stream) => {
                render_turn(stream, format).await;
            }
            Err(err) => eprintln!("error: {err}"),
        }
    }

    let usage = conversation.usage();
    println!(
        "tokens: input={} output={} total={}",
        usage.input_tokens,
        usage.output_tokens,
        usage.total()
    );

    if let Some(index) = args.pin {
        let pinnable: Vec<String> = match format {
            ResponseFormat::Cards => conversation.entities().iter().map(Entity::to_text).collect(),
            ResponseFormat::Text => answers,
        };
        match pinnable.get(index) {
            Some(text) => match FilePinboard::new(&args.pin_file).pin(text) {
                Ok(key) => println!("pinned #{index} as {key} in {}", args.pin_file.display()),
                Err(err) => eprintln!("error: {err}"),
            },
            None => eprintln!("warning: nothing to pin at index {index}"),
        }
    }

    ExitCode::SUCCESS
}

/// Prints a turn as it streams. Returns the answer text when the turn
/// completed.
async fn render_turn(mut stream: TurnStream<'_>, format: ResponseFormat) -> Option<String> {
    let mut shown = stream.conversation().entities().len();
    while let Some(event) = stream.next_event().await {
        match event {
            StreamEvent::ContentDelta { text, .. } if format == ResponseFormat::Text => {
                print!("{text}");
                let _ = std::io::stdout().flush();
            }
            StreamEvent::EntitiesUpdated { entities, .. } => {
                if entities.len() < shown {
                    println!("(back to {} cards)", entities.len());
                }
                for (index, entity) in entities.iter().enumerate().skip(shown) {
                    print_card(index, entity);
                }
                shown = entities.len();
            }
            _ => {}
        }
    }
    if format == ResponseFormat::Text {
        println!();
    }

    match stream.finish().await {
        Ok(outcome) => {
            if let Some(notice) = &outcome.notice {
                print_notice(notice);
            }
            Some(outcome.text)
        }
        Err(CardStreamError::Failed(failure)) => {
            print_notice(&Notice {
                severity: failure.severity(),
                message: failure.user_message(),
            });
            None
        }
        Err(err) => {
            eprintln!("error: {err}");
            None
        }
    }
}

fn print_card(index: usize, entity: &Entity) {
    match entity.title() {
        Some(title) => println!("{index}. {title}"),
        None => println!(
            "{index}. {}",
            serde_json::to_string(entity).unwrap_or_default()
        ),
    }
    if let Some(summary) = entity.summary() {
        println!("   {summary}");
    }
}

fn print_notice(notice: &Notice) {
    let label = match notice.severity {
        Severity::Warning => "warning",
        Severity::Error => "error",
    };
    eprintln!("{label}: {}", notice.message);
}
