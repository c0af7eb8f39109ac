use std::path::PathBuf;

use chzzk_chat::DEFAULT_CHAT_ENDPOINT;
use clap::{Parser, Subcommand};

/// Watch a CHZZK live chat for keyword bursts.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,

    /// Directory for the rolling `chat.log`
    #[arg(long, global = true, env = "CHATMON_LOG_DIR", default_value = "logs")]
    pub log_dir: PathBuf,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Connect to a channel's chat and record keyword detections
    Monitor(MonitorArgs),

    /// Append the elapsed time of the current broadcast to a log file
    BroadcastTime(BroadcastTimeArgs),
}

#[derive(clap::Args, Debug)]
pub struct MonitorArgs {
    /// Channel id or `https://chzzk.naver.com/live/<id>` URL
    #[arg(env = "CHANNEL_ID")]
    pub channel: String,

    /// JSON object file with the NID_AUT / NID_SES cookies
    #[arg(long, env = "CHZZK_COOKIES", default_value = "cookies.json")]
    pub cookies: PathBuf,

    /// Keyword settings file
    #[arg(long, env = "KEYWORD_SETTINGS", default_value = "keyword_settings.json")]
    pub settings: PathBuf,

    /// Detection event log
    #[arg(long, default_value = "keyword_times.log")]
    pub event_log: PathBuf,

    /// Chat server endpoint
    #[arg(long, env = "CHZZK_CHAT_ENDPOINT", default_value = DEFAULT_CHAT_ENDPOINT)]
    pub endpoint: String,

    /// Wait between reconnect attempts, doubling up to a minute
    #[arg(long)]
    pub backoff: bool,

    /// Send lines read from stdin as chat messages
    #[arg(long)]
    pub interactive: bool,
}

#[derive(clap::Args, Debug)]
pub struct BroadcastTimeArgs {
    /// Channel id or `https://chzzk.naver.com/live/<id>` URL
    #[arg(env = "CHANNEL_ID")]
    pub channel: String,

    /// File the line is appended to
    #[arg(long, default_value = "broadcast_times.log")]
    pub output: PathBuf,

    /// Optional cookies file; the live detail endpoint works without login
    #[arg(long)]
    pub cookies: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monitor_defaults() {
        let args = Args::try_parse_from(["chatmon", "monitor", "abc123"]).unwrap();
        let Commands::Monitor(monitor) = args.command else {
            panic!("expected monitor command");
        };

        assert_eq!(monitor.channel, "abc123");
        assert_eq!(monitor.event_log, PathBuf::from("keyword_times.log"));
        assert_eq!(monitor.endpoint, DEFAULT_CHAT_ENDPOINT);
        assert!(!monitor.backoff);
    }

    #[test]
    fn test_broadcast_time_output() {
        let args = Args::try_parse_from([
            "chatmon",
            "broadcast-time",
            "abc123",
            "--output",
            "out/times.log",
            "--verbose",
        ])
        .unwrap();

        assert!(args.verbose);
        let Commands::BroadcastTime(cmd) = args.command else {
            panic!("expected broadcast-time command");
        };
        assert_eq!(cmd.output, PathBuf::from("out/times.log"));
        assert!(cmd.cookies.is_none());
    }
}
