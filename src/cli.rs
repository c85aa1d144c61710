use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(name = "sotto", version, about = "sotto - push-to-talk cloud dictation")]
pub struct CliArgs {
    /// Auto-paste the transcript into the focused window
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub autopaste: bool,

    /// Stream audio live over WebSocket (Deepgram only; implied by Deepgram)
    #[arg(long, default_value_t = false, action = clap::ArgAction::Set)]
    pub stream: bool,

    /// Upload format for batch transcription: mp3@16, mp3@64, flac, adaptive
    #[arg(long, default_value = "mp3@16")]
    pub format: String,

    /// Transcription language (ISO-639-1, e.g. en, es, fr). Empty = auto-detect
    #[arg(long, default_value = "en")]
    pub lang: String,

    /// Use the named capture device instead of the system default
    #[arg(long)]
    pub device: Option<String>,

    /// Interactively pick a capture device at startup
    #[arg(long)]
    pub setup: bool,

    /// Transcription provider: groq, openai, or deepgram (default: first
    /// provider with an API key in the environment, Deepgram preferred)
    #[arg(long)]
    pub provider: Option<String>,

    /// Hybrid hotkey mode: tap to toggle, hold to push-to-talk
    #[arg(long)]
    pub hybrid: bool,

    /// Long-press threshold in milliseconds for hybrid tap/hold detection
    #[arg(long, default_value_t = 350)]
    pub longpress: u64,

    /// Log directory (default: $SOTTO_LOG_PATH, then the OS data dir)
    #[arg(long)]
    pub logpath: Option<String>,

    /// Run system diagnostics and exit
    #[arg(long)]
    pub doctor: bool,

    /// Benchmark transcription with a WAV file instead of live recording
    #[arg(long)]
    pub benchmark: Option<String>,

    /// Number of benchmark iterations
    #[arg(long, default_value_t = 3)]
    pub runs: u32,

    /// Headless test mode: drive recordings from stdin with the given WAV
    #[arg(long)]
    pub test: Option<String>,

    /// Serve recording metrics as plain text on the given address
    #[arg(long)]
    pub profile: Option<String>,

    /// Trigger a synthetic panic to verify crash logging
    #[arg(long)]
    pub crash: bool,

    /// Trailing arguments (WAV file for --doctor)
    #[arg(trailing_var_arg = true)]
    pub args: Vec<String>,
}
