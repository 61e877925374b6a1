use std::time::Duration;

use anyhow::{Context as _, anyhow};
use console::style;
use http::{HeaderMap, HeaderName, HeaderValue};
use sseline_source::{
    EventSource, ReconnectOptions, ReconnectingEventSource, SourceError, SourceEvent,
    SourceOptions,
};
use sseline_types::Event;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// `type: data`, one event per line
    Text,
    /// One JSON object per event
    Json,
}

#[derive(Debug, Clone, PartialEq, clap::Args)]
pub struct TailCommand {
    /// Event stream URL
    #[arg(env = "SSELINE_URL")]
    pub url: String,

    /// Extra request header, as "Name: value" (repeatable)
    #[arg(long = "header", short = 'H')]
    pub headers: Vec<String>,

    /// Fail the connection when nothing arrives for this many milliseconds
    #[arg(long, env = "SSELINE_KEEP_ALIVE_TIMEOUT_MS")]
    pub keep_alive_timeout_ms: Option<u64>,

    /// Reconnect after network failures
    #[arg(long)]
    pub reconnect: bool,

    /// Resume from this event id (with --reconnect)
    #[arg(long, requires = "reconnect")]
    pub last_event_id: Option<String>,

    /// Give up after this many consecutive reconnections (0 = never)
    #[arg(long, requires = "reconnect")]
    pub max_reconnect_attempts: Option<u32>,

    /// Output format
    #[arg(long, value_enum, default_value = "text")]
    pub format: OutputFormat,
}

impl TailCommand {
    pub async fn execute(&self) -> anyhow::Result<()> {
        let mut options = SourceOptions::new().with_headers(parse_headers(&self.headers)?);
        if let Some(ms) = self.keep_alive_timeout_ms {
            options = options.with_keep_alive_timeout(Duration::from_millis(ms));
        }

        eprintln!(
            "{} {}",
            style("Tailing").dim(),
            style(&self.url).cyan()
        );

        if self.reconnect {
            let mut reconnect = ReconnectOptions::new(options)
                .with_max_reconnect_attempts(self.max_reconnect_attempts.unwrap_or_default());
            if let Some(id) = &self.last_event_id {
                reconnect = reconnect.with_last_event_id(id);
            }
            self.tail_reconnecting(reconnect).await
        } else {
            self.tail_once(options).await
        }
    }

    async fn tail_once(&self, options: SourceOptions) -> anyhow::Result<()> {
        let source = EventSource::new(self.url.as_str(), options)?;

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Interrupted");
                    break;
                }
                next = source.next() => match next {
                    Ok(Some(event)) => println!("{}", self.render(&event)?),
                    Ok(None) => break,
                    Err(e) => {
                        source.close().await;
                        return Err(e).context("event stream failed");
                    }
                },
            }
        }

        source.close().await;
        Ok(())
    }

    async fn tail_reconnecting(&self, options: ReconnectOptions) -> anyhow::Result<()> {
        let source = ReconnectingEventSource::new(self.url.as_str(), options)?;
        let mut rx = source.subscribe();
        let closed = source.closed();
        tokio::pin!(closed);
        source.connect()?;

        let mut last_error: Option<SourceError> = None;
        loop {
            tokio::select! {
                biased;
                _ = tokio::signal::ctrl_c() => {
                    info!("Interrupted");
                    last_error = None;
                    break;
                }
                received = rx.recv() => match received {
                    Ok(SourceEvent::Open) => {
                        last_error = None;
                        eprintln!("{}", style("✓ Connected").green());
                    }
                    Ok(SourceEvent::Message(message)) => {
                        println!("{}", self.render(&message.event)?);
                    }
                    Ok(SourceEvent::Error(e)) => {
                        eprintln!("{} {}", style("✗").red(), e);
                        last_error = Some(e);
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Output fell behind, events dropped");
                    }
                    Err(RecvError::Closed) => break,
                },
                _ = &mut closed => break,
            }
        }

        source.close().await;
        match last_error {
            Some(e) => Err(anyhow!(e).context("event stream failed")),
            None => Ok(()),
        }
    }

    fn render(&self, event: &Event) -> anyhow::Result<String> {
        render_event(event, self.format)
    }
}

fn render_event(event: &Event, format: OutputFormat) -> anyhow::Result<String> {
    match format {
        OutputFormat::Json => Ok(serde_json::to_string(event)?),
        OutputFormat::Text => {
            let data = event.data.as_deref().unwrap_or_default();
            Ok(match &event.id {
                Some(id) => format!(
                    "{} {}: {}",
                    style(format!("[{id}]")).dim(),
                    style(event.event_type()).bold(),
                    data
                ),
                None => format!("{}: {}", style(event.event_type()).bold(), data),
            })
        }
    }
}

fn parse_headers(raw: &[String]) -> anyhow::Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    for header in raw {
        let (name, value) = header
            .split_once(':')
            .ok_or_else(|| anyhow!("Invalid header '{}', expected 'Name: value'", header))?;
        let name = HeaderName::try_from(name.trim())
            .with_context(|| format!("Invalid header name in '{}'", header))?;
        let value = HeaderValue::try_from(value.trim())
            .with_context(|| format!("Invalid header value in '{}'", header))?;
        headers.append(name, value);
    }
    Ok(headers)
}
