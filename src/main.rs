use anyhow::Result;
use clap::Parser;
use futures::StreamExt;
use qwenchat::cli::{Cli, Commands};
use qwenchat::{utils, LogFilter, QwenClient, Settings};
use std::io::Write;
use tokio::io::{self, AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let settings = match &cli.config {
        Some(path) => Settings::from_file(path)?,
        None => Settings::new()?,
    };

    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&settings.log.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let client = QwenClient::connect(settings).await?;

    let result = match cli.command {
        Commands::Chat {
            prompt,
            system,
            model,
            search,
            stream,
            user,
            session,
        } => {
            handle_chat(&client, prompt, system, model, search, stream, user, session).await
        }
        Commands::Interactive {
            system,
            user,
            session,
        } => handle_interactive(&client, system, user, session).await,
        Commands::History {
            user,
            session,
            limit,
        } => handle_history(&client, user, session, limit).await,
        Commands::Logs {
            user,
            session,
            limit,
        } => handle_logs(&client, user, session, limit).await,
        Commands::Models => {
            for model in client.models() {
                println!("{}", model);
            }
            Ok(())
        }
    };

    client.close().await;

    result
}

#[allow(clippy::too_many_arguments)]
async fn handle_chat(
    client: &QwenClient,
    prompt: String,
    system: Option<String>,
    model: Option<String>,
    search: bool,
    stream: bool,
    user: Option<String>,
    session: Option<String>,
) -> Result<()> {
    let mut chat = client
        .chat(user.as_deref(), session.as_deref())
        .search(search);
    if let Some(system) = system {
        chat = chat.system(system);
    }
    if let Some(model) = model {
        chat = chat.model(model);
    }

    utils::print_info("Sending request...");

    if stream {
        let mut fragments = chat.stream(&prompt);
        println!();
        while let Some(fragment) = fragments.next().await {
            print!("{}", fragment?);
            std::io::stdout().flush()?;
        }
        println!();
    } else {
        let completion = chat.ask(&prompt).await?;
        println!("\n{}", completion.content().unwrap_or_default());
        if let Some(usage) = completion.usage {
            utils::print_info(&format!(
                "tokens: {} prompt + {} completion = {}",
                usage.prompt_tokens, usage.completion_tokens, usage.total_tokens
            ));
        }
    }

    Ok(())
}

async fn handle_interactive(
    client: &QwenClient,
    system: Option<String>,
    user: Option<String>,
    session: Option<String>,
) -> Result<()> {
    let mut chat = client.chat(user.as_deref(), session.as_deref());
    if let Some(system) = system {
        chat = chat.system(system);
    }

    utils::print_header("Interactive Mode");
    utils::print_info(&format!("User: {}  Session: {}", chat.user_id(), chat.session_id()));

    let previous = chat.history(None).await.len();
    if previous > 0 {
        utils::print_success(&format!("Resumed session with {} previous messages", previous));
    }
    utils::print_info("Type your messages (/help for commands, Ctrl+C to exit)\n");

    let mut reader = BufReader::new(io::stdin());

    loop {
        utils::print_prompt("You: ");
        std::io::stdout().flush()?;

        let mut input = String::new();
        if reader.read_line(&mut input).await? == 0 {
            break;
        }

        let input = input.trim();
        if input.is_empty() {
            continue;
        }

        match input {
            "/exit" | "/quit" => break,
            "/clear" => {
                if chat.clear_memory().await {
                    utils::print_success("Session history cleared\n");
                } else {
                    utils::print_error("Failed to clear session history\n");
                }
                continue;
            }
            "/history" => {
                for message in chat.history(None).await {
                    utils::print_message(&message);
                }
                println!();
                continue;
            }
            "/help" => {
                println!("Special commands:");
                println!("  /history - Show remembered messages");
                println!("  /clear   - Clear session history");
                println!("  /exit    - Leave interactive mode");
                println!("  /help    - Show this help\n");
                continue;
            }
            _ => {}
        }

        utils::print_prompt("Assistant: ");
        let mut fragments = chat.stream(input);
        while let Some(fragment) = fragments.next().await {
            match fragment {
                Ok(text) => {
                    print!("{}", text);
                    std::io::stdout().flush()?;
                }
                Err(e) => {
                    println!();
                    utils::print_error(&e.to_string());
                    break;
                }
            }
        }
        println!("\n");
    }

    Ok(())
}

async fn handle_history(
    client: &QwenClient,
    user: Option<String>,
    session: String,
    limit: Option<usize>,
) -> Result<()> {
    let chat = client.chat(user.as_deref(), Some(session.as_str()));
    let messages = chat.history(limit).await;

    utils::print_header(&format!("History for {}", chat.key()));
    if messages.is_empty() {
        utils::print_info("No messages");
    }
    for message in &messages {
        utils::print_message(message);
    }
    Ok(())
}

async fn handle_logs(
    client: &QwenClient,
    user: Option<String>,
    session: Option<String>,
    limit: usize,
) -> Result<()> {
    let filter = LogFilter {
        user_id: user,
        session_id: session,
        ..LogFilter::default()
    };
    let entries = client.logs(&filter, limit).await;

    utils::print_header("API Logs");
    if entries.is_empty() {
        utils::print_info("No log entries");
    }
    for entry in &entries {
        utils::print_log_entry(entry);
    }
    Ok(())
}
