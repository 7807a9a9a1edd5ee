mod config;
mod error;
mod highlight;
mod log_reader;
mod metadata;
mod monitor;
mod parser;
mod process;
mod publisher;
mod registry;
mod search;
mod session;
mod status;
mod usage;
mod watcher;
mod worker;

use std::io::Write;
use tracing_subscriber::EnvFilter;

pub use config::{MonitorConfig, CONFIG_FILE_ENV, PROJECTS_DIR_ENV};
pub use error::{IndexError, LogError, MonitorError, ParseError, WatchError};
pub use highlight::{build_snippet, highlight_ranges, HighlightRange};
pub use log_reader::{read_new, read_new_checked, FileIdentity, LineError, ReadBatch};
pub use metadata::{
    decode_project_dir, encode_project_path, load_all_hints, load_project_hints, HintMap,
    SessionHint, SESSIONS_INDEX_FILE,
};
pub use monitor::SessionMonitor;
pub use parser::{parse_line, parse_timestamp};
pub use process::{FixedProbe, NoProbe, ProcessProbe, SystemProbe};
pub use publisher::{
    IndexProgress, MonitorEvent, Publisher, SessionList, Subscription, SubscriptionId,
    WatchFailure,
};
pub use registry::{SessionRegistry, StatusContext};
pub use search::{
    match_tier, run_content_pass, tokenize, ContentPass, Field, IndexStats, MatchOptions,
    MatchTier, QueryMode, SearchHit, SearchIndex, SearchQuery,
};
pub use session::{
    ContentBlock, ContentType, ConversationEntry, EntryKind, Role, Session, SessionFilter,
    SessionStatus, SessionSummary, TokenUsage,
};
pub use status::{infer_status, Liveness};
pub use usage::{fold_usage, UsageAccumulator, UsageTotals};
pub use watcher::{classify, scan_logs, PathKind};

/// Headless host: monitor the projects directory and stream every event to
/// stdout as one JSON object per line. Diagnostics go to stderr.
pub fn run() -> Result<(), MonitorError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = MonitorConfig::from_env()?;
    let probe: Box<dyn ProcessProbe> = if config.track_processes {
        Box::new(SystemProbe)
    } else {
        Box::new(NoProbe)
    };

    let monitor = SessionMonitor::new(config, probe)?;
    let subscription = monitor.subscribe();
    monitor.start_watch()?;

    let stdout = std::io::stdout();
    for event in subscription.receiver.iter() {
        let line = match serde_json::to_string(&event) {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(event = event.name(), error = %e, "failed to serialize event");
                continue;
            }
        };
        let mut out = stdout.lock();
        if writeln!(out, "{}", line).and_then(|_| out.flush()).is_err() {
            // Reader went away
            break;
        }
    }

    monitor.shutdown();
    Ok(())
}
