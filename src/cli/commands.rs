use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "qwenchat")]
#[command(author, version, about = "Chat client for Qwen models with conversation memory", long_about = None)]
pub struct Cli {
    /// Config file to load instead of config/{CONFIG_ENV}
    #[arg(short = 'c', long, global = true)]
    pub config: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Send a single chat message
    Chat {
        prompt: String,

        #[arg(short = 's', long)]
        system: Option<String>,

        #[arg(short = 'm', long)]
        model: Option<String>,

        /// Attach the web search tool
        #[arg(long)]
        search: bool,

        /// Print fragments as they arrive
        #[arg(long)]
        stream: bool,

        #[arg(short = 'u', long)]
        user: Option<String>,

        #[arg(long)]
        session: Option<String>,
    },

    /// Start an interactive chat session with memory
    Interactive {
        #[arg(short = 's', long)]
        system: Option<String>,

        #[arg(short = 'u', long)]
        user: Option<String>,

        /// Session to resume (a new one is generated when omitted)
        #[arg(long)]
        session: Option<String>,
    },

    /// Show remembered messages for a session
    History {
        #[arg(short = 'u', long)]
        user: Option<String>,

        #[arg(long)]
        session: String,

        #[arg(short = 'n', long)]
        limit: Option<usize>,
    },

    /// Show stored API log entries, newest first
    Logs {
        #[arg(short = 'u', long)]
        user: Option<String>,

        #[arg(long)]
        session: Option<String>,

        #[arg(short = 'n', long, default_value = "20")]
        limit: usize,
    },

    /// List configured models
    Models,
}
