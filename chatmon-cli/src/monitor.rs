//! `monitor`: run a chat session until Ctrl-C.

use std::sync::Arc;

use anyhow::{Context, Result};
use chzzk_chat::{
    ChatSession, ChzzkCookies, ConfigStore, CountsStore, ExponentialBackoff, HttpChzzkApi,
    Immediate, KeywordPolicy, ReconnectPolicy, RuntimeOverrides, SessionEvent, SessionHandle,
    SessionParams, SettingsStore, TsvEventLog, WebSocketConnector,
};
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info, warn};

use crate::cli::MonitorArgs;

pub async fn run(args: MonitorArgs) -> Result<()> {
    let cookies = ChzzkCookies::load(&args.cookies)
        .await
        .with_context(|| format!("Failed to load cookies from {}", args.cookies.display()))?;
    if cookies.is_empty() {
        warn!("Cookie file {} is empty; login is required to chat", args.cookies.display());
    }

    let store = Arc::new(SettingsStore::new(&args.settings));
    let settings = store
        .load_config()
        .await
        .context("Failed to load keyword settings")?;
    let counts = store
        .load_counts()
        .await
        .context("Failed to load keyword counts")?;
    let policy = KeywordPolicy::build(&settings, &RuntimeOverrides::from_env())
        .context("Invalid keyword configuration")?;

    let api = Arc::new(HttpChzzkApi::new(cookies.clone())?);
    let mut connector = WebSocketConnector::new();
    if let Some(cookie) = cookies.header_value() {
        connector = connector.with_header("Cookie", cookie);
    }
    let sink = TsvEventLog::open(&args.event_log)
        .await
        .with_context(|| format!("Failed to open event log {}", args.event_log.display()))?;
    let reconnect: Box<dyn ReconnectPolicy> = if args.backoff {
        Box::new(ExponentialBackoff::default())
    } else {
        Box::new(Immediate)
    };

    info!(
        channel = %args.channel,
        keywords = policy.len(),
        event_log = %sink.output_path().display(),
        "Starting chat monitor"
    );

    let (handle, events) = ChatSession::spawn(SessionParams {
        channel_id: args.channel,
        endpoint: args.endpoint,
        policy: Arc::new(policy),
        initial_counts: counts,
        api: api.clone(),
        metadata: api,
        connector: Arc::new(connector),
        counts_store: store,
        sink: Box::new(sink),
        reconnect,
    });

    let cancel = handle.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received, stopping");
            cancel.cancel();
        }
    });

    let stdin = args
        .interactive
        .then(|| BufReader::new(tokio::io::stdin()).lines());
    drive(&handle, events, stdin).await;

    let summary = handle.join().await.context("Chat session failed")?;
    info!(
        reconnects = summary.reconnects,
        detections = summary.detections,
        "Chat monitor finished"
    );
    for (keyword, count) in &summary.cumulative_counts {
        info!("  {keyword}: {count}");
    }
    Ok(())
}

/// Consume session events until the worker exits, forwarding stdin lines
/// as chat messages when interactive.
async fn drive(
    handle: &SessionHandle,
    mut events: UnboundedReceiver<SessionEvent>,
    mut stdin: Option<Lines<BufReader<Stdin>>>,
) {
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(SessionEvent::Stopped) | None => break,
                Some(SessionEvent::StateChanged { from, to }) => debug!(%from, %to, "Session state"),
                Some(_) => {}
            },
            line = next_line(&mut stdin) => match line {
                Some(text) if !text.trim().is_empty() => {
                    if let Err(e) = handle.send_chat(text.trim()) {
                        warn!("Failed to queue chat message: {}", e);
                    }
                }
                Some(_) => {}
                None => stdin = None,
            },
        }
    }
}

async fn next_line(stdin: &mut Option<Lines<BufReader<Stdin>>>) -> Option<String> {
    match stdin {
        Some(lines) => lines.next_line().await.ok().flatten(),
        None => std::future::pending().await,
    }
}
