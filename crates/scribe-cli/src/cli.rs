use clap::{Parser, ValueEnum};

/// Priority accepted on the command line, mirrored onto
/// [`scribe_core::Priority`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum PriorityArg {
    /// Serviced ahead of all other priorities within a model bucket.
    High,
    /// Default priority.
    Normal,
    /// Serviced only after High and Normal buckets are empty.
    Low,
}

impl From<PriorityArg> for scribe_core::Priority {
    fn from(value: PriorityArg) -> Self {
        match value {
            PriorityArg::High => scribe_core::Priority::High,
            PriorityArg::Normal => scribe_core::Priority::Normal,
            PriorityArg::Low => scribe_core::Priority::Low,
        }
    }
}

/// Output format accepted on the command line, mirrored onto
/// [`scribe_core::OutputFormat`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormatArg {
    /// Plain concatenated text.
    Text,
    /// SubRip subtitles.
    Srt,
    /// WebVTT subtitles.
    Vtt,
    /// Structured JSON with timing.
    Json,
}

impl From<OutputFormatArg> for scribe_core::OutputFormat {
    fn from(value: OutputFormatArg) -> Self {
        match value {
            OutputFormatArg::Text => scribe_core::OutputFormat::PlainText,
            OutputFormatArg::Srt => scribe_core::OutputFormat::Srt,
            OutputFormatArg::Vtt => scribe_core::OutputFormat::Vtt,
            OutputFormatArg::Json => scribe_core::OutputFormat::Structured,
        }
    }
}

fn default_parallel_tasks() -> u32 {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .min(scribe_config::HARD_CONCURRENCY_LIMIT as usize) as u32
}

/// Submit a handful of synthetic transcription tasks against an in-process
/// orchestrator running deterministic stub collaborators, and print the
/// event stream to the terminal until every task reaches a terminal state.
#[derive(Debug, Clone, Parser)]
#[command(name = "scribe", version, about = "Transcription orchestrator demo")]
pub struct Cli {
    /// Input audio file paths to submit, one task per file.
    #[arg(long = "file", value_name = "PATH")]
    pub files: Vec<String>,

    /// Model name to request for every submitted task.
    #[arg(long, env = "SCRIBE_MODEL", default_value = "whisper-base")]
    pub model: String,

    /// Priority to request for every submitted task.
    #[arg(long, value_enum, default_value_t = PriorityArg::Normal)]
    pub priority: PriorityArg,

    /// Output formats to render per task.
    #[arg(long = "format", value_enum, default_values_t = vec![OutputFormatArg::Text])]
    pub formats: Vec<OutputFormatArg>,

    /// Number of synthetic GPUs to simulate when no real accelerator
    /// driver is wired up.
    #[arg(long, env = "SCRIBE_SIMULATED_GPUS", default_value_t = 1)]
    pub simulated_gpus: u32,

    /// Initial concurrency cap (runtime-mutable afterwards via the API).
    #[arg(long, env = "SCRIBE_CONCURRENCY", default_value_t = default_parallel_tasks())]
    pub concurrency: u32,
}
