use clap::{Args, Parser, Subcommand, ValueEnum};

#[derive(Parser, Debug)]
#[command(name = "rusty-chat", author, version, about = "Budget-aware streaming chat with LLM providers", long_about = None)]
pub struct Cli {
    /// Optional path to a config file (toml)
    #[arg(short, long)]
    pub config: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Interactive chat over one conversation
    Chat(ChatArgs),
    /// Estimate context usage of a stored conversation
    Usage(UsageArgs),
    /// Manage stored conversations
    Conversations(ConversationsArgs),
    /// Show a window of a stored conversation's transcript
    Transcript(TranscriptArgs),
    /// List models for a provider
    ListModels(ListModelsArgs),
    /// Show available providers
    Providers,
    /// Print the default config path
    ConfigPath,
    /// Create an example config file if missing
    InitConfig,
}

#[derive(Args, Debug)]
pub struct ChatArgs {
    /// Conversation id to load and save
    #[arg(long, default_value = "default")]
    pub conversation: String,

    /// Provider key, e.g. openai, anthropic, ollama
    #[arg(short, long)]
    pub provider: Option<String>,

    /// Model name; if not given, provider default is used
    #[arg(short, long)]
    pub model: Option<String>,

    /// System message; overrides the configured one
    #[arg(long)]
    pub system: Option<String>,

    /// Temperature (0.0 - 2.0)
    #[arg(long)]
    pub temperature: Option<f32>,

    /// Max output tokens
    #[arg(long)]
    pub max_tokens: Option<u32>,
}

#[derive(Args, Debug)]
pub struct UsageArgs {
    /// Conversation id
    #[arg(long, default_value = "default")]
    pub conversation: String,

    /// Model whose budget to measure against
    #[arg(short, long)]
    pub model: String,

    /// Unsent draft to include in the estimate
    #[arg(long)]
    pub draft: Option<String>,

    /// System message to include in the estimate
    #[arg(long)]
    pub system: Option<String>,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
pub enum ConversationAction {
    List,
    Show,
    Delete,
    ClearAll,
}

#[derive(Args, Debug)]
pub struct ConversationsArgs {
    /// Action to perform: list | show | delete | clear-all
    #[arg(value_enum)]
    pub action: ConversationAction,

    /// Conversation id (for show/delete)
    #[arg(long)]
    pub conversation: Option<String>,
}

#[derive(Args, Debug)]
pub struct TranscriptArgs {
    /// Conversation id
    #[arg(long, default_value = "default")]
    pub conversation: String,

    /// Scroll offset in rows from the top
    #[arg(long, default_value_t = 0)]
    pub scroll: u64,

    /// Viewport height in rows
    #[arg(long, default_value_t = 40)]
    pub rows: u64,

    /// Wrap width in columns
    #[arg(long, default_value_t = 100)]
    pub width: u16,
}

#[derive(Args, Debug)]
pub struct ListModelsArgs {
    /// Provider key, e.g. openai, ollama
    #[arg(short, long, default_value = "openai")]
    pub provider: String,
}

impl Cli {
    pub fn parse() -> Self {
        <Self as Parser>::parse()
    }
}
