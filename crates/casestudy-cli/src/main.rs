//! Streams a case-study generation to the terminal and exports the result.
//!
//! Generates against a live backend (`--url`) or replays a recorded NDJSON/SSE
//! body (`--replay`). Ctrl-C cancels; whatever arrived is still exported,
//! labelled incomplete.

mod render;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use casestudy_stream::http::{HttpTransport, HttpTransportConfig};
use casestudy_stream::prelude::*;
use casestudy_stream::{Framing, bind, init_observability};
use chrono::NaiveDate;
use clap::Parser;
use tracing::info;

use crate::render::TerminalRenderer;

#[derive(Debug, Parser)]
#[command(name = "casestudy", version, about = "Stream a case-study generation")]
struct Cli {
    /// Backend base URL
    #[arg(long, env = "CASESTUDY_API_URL", conflicts_with = "replay")]
    url: Option<String>,

    /// Bearer token for the backend
    #[arg(long, env = "CASESTUDY_API_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Replay a recorded response body instead of calling the backend
    #[arg(long, value_name = "FILE")]
    replay: Option<PathBuf>,

    /// Treat the replay file as server-sent events (implied by a .sse extension)
    #[arg(long)]
    sse: bool,

    /// Project name
    #[arg(short, long)]
    project: String,

    /// First day covered (YYYY-MM-DD)
    #[arg(long, value_name = "DATE")]
    start: NaiveDate,

    /// Last day covered (YYYY-MM-DD)
    #[arg(long, value_name = "DATE")]
    end: NaiveDate,

    /// Participant email; repeat for more
    #[arg(long = "participant", value_name = "EMAIL", required = true)]
    participants: Vec<String>,

    /// Keyword to search for; repeat for more
    #[arg(short, long = "keyword", value_name = "WORD", required = true)]
    keywords: Vec<String>,

    /// Template: comprehensive, technical, marketing, product or custom
    #[arg(short, long, default_value = "comprehensive")]
    template: TemplateType,

    /// Model used by the backend
    #[arg(short, long, default_value = "gpt-4")]
    model: String,

    #[arg(long)]
    industry: Option<String>,

    #[arg(long)]
    focus: Option<String>,

    /// Extra instructions passed to the generator
    #[arg(long)]
    instructions: Option<String>,

    /// Write the markdown document here
    #[arg(short, long, value_name = "FILE")]
    out: Option<PathBuf>,

    /// Seconds without data before giving up
    #[arg(long, env = "CASESTUDY_INACTIVITY_TIMEOUT_SECS", default_value_t = 60)]
    timeout: u64,

    /// Fail on the first undecodable frame
    #[arg(long)]
    strict: bool,

    /// Suppress status lines on stderr
    #[arg(short, long)]
    quiet: bool,
}

impl Cli {
    fn request(&self) -> GenerationRequest {
        let mut request = GenerationRequest::new(self.project.clone(), self.start, self.end)
            .template(self.template)
            .model(self.model.clone());
        request.participants = self.participants.clone();
        request.keywords = self.keywords.clone();
        request.project_industry = self.industry.clone();
        request.project_focus = self.focus.clone();
        request.custom_instructions = self.instructions.clone();
        request
    }

    fn session_config(&self) -> SessionConfig {
        SessionConfig::default()
            .inactivity_timeout(Duration::from_secs(self.timeout))
            .strict_parsing(self.strict)
    }

    async fn transport(&self) -> Result<Arc<dyn TransportFactory>, Box<dyn std::error::Error>> {
        if let Some(path) = &self.replay {
            let body = tokio::fs::read(path)
                .await
                .map_err(|e| format!("cannot read replay file {}: {e}", path.display()))?;
            let framing = if self.sse || has_extension(path, "sse") {
                Framing::Sse
            } else {
                Framing::Ndjson
            };
            return Ok(Arc::new(ReplayTransport::from_body(body, framing)));
        }
        let Some(url) = self.url.as_deref().filter(|u| !u.trim().is_empty()) else {
            return Err("either --url (or CASESTUDY_API_URL) or --replay is required".into());
        };
        let mut config = HttpTransportConfig::new(url.trim());
        if let Some(token) = self.token.as_deref().filter(|t| !t.trim().is_empty()) {
            config = config.api_token(token.trim());
        }
        Ok(Arc::new(HttpTransport::new(config)?))
    }
}

fn has_extension(path: &Path, ext: &str) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case(ext))
}

fn exit_code(status: SessionStatus) -> ExitCode {
    match status {
        SessionStatus::Completed => ExitCode::SUCCESS,
        SessionStatus::Cancelled => ExitCode::from(130),
        _ => ExitCode::FAILURE,
    }
}

async fn run(cli: Cli) -> Result<SessionSnapshot, Box<dyn std::error::Error>> {
    let transport = cli.transport().await?;
    let session = StreamingSession::with_config(transport, cli.session_config());
    let _subscription = bind(
        &session,
        Arc::new(TerminalRenderer::new(std::io::stdout(), cli.quiet)),
    );
    session.start(cli.request())?;

    let snapshot = tokio::select! {
        snapshot = session.finished() => snapshot,
        _ = tokio::signal::ctrl_c() => {
            session.cancel();
            session.finished().await
        }
    };
    println!();

    if let Some(out) = &cli.out {
        if let Some(parent) = out.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(out, snapshot.to_markdown()).await?;
        info!(path = %out.display(), status = %snapshot.status, "exported document");
    }
    Ok(snapshot)
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    init_observability();
    let cli = Cli::parse();
    let quiet = cli.quiet;

    match run(cli).await {
        Ok(snapshot) => {
            if !quiet {
                eprintln!(
                    "{}: {} sections, {} frames, {} undecodable",
                    snapshot.status,
                    snapshot.sections.len(),
                    snapshot.frames_applied,
                    snapshot.parse_errors
                );
            }
            exit_code(snapshot.status)
        }
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::from(2)
        }
    }
}
