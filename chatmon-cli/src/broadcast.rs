//! `broadcast-time`: log how long the current broadcast has been running.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use chrono_tz::Asia::Seoul;
use chzzk_chat::{
    BroadcastMetadata, ChzzkCookies, HttpChzzkApi, format_duration, normalize_channel_id,
};
use tokio::io::AsyncWriteExt;
use tracing::info;

use crate::cli::BroadcastTimeArgs;

pub async fn run(args: BroadcastTimeArgs) -> Result<()> {
    let channel_id = normalize_channel_id(&args.channel)?;

    let cookies = match &args.cookies {
        Some(path) => ChzzkCookies::load(path)
            .await
            .with_context(|| format!("Failed to load cookies from {}", path.display()))?,
        None => ChzzkCookies::default(),
    };
    let api = HttpChzzkApi::new(cookies)?;

    let start = api
        .fetch_start_instant(&channel_id)
        .await
        .with_context(|| format!("Failed to resolve broadcast start of {channel_id}"))?;

    let line = broadcast_line(Utc::now(), start);
    append_line(&args.output, &line).await?;
    info!(output = %args.output.display(), "{}", line);
    println!("{line}");
    Ok(())
}

/// `current=<iso> | start=<iso> | duration=HH:MM:SS`, in Seoul time.
fn broadcast_line(now: DateTime<Utc>, start: DateTime<Utc>) -> String {
    let duration = format_duration((now - start).num_seconds());
    format!(
        "current={} | start={} | duration={}",
        now.with_timezone(&Seoul)
            .to_rfc3339_opts(SecondsFormat::Secs, false),
        start
            .with_timezone(&Seoul)
            .to_rfc3339_opts(SecondsFormat::Secs, false),
        duration
    )
}

async fn append_line(path: &Path, line: &str) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .with_context(|| format!("Failed to open {}", path.display()))?;
    file.write_all(format!("{line}\n").as_bytes()).await?;
    file.flush().await?;
    Ok(())
}
