//! Agent Chat delivery daemon entry point

use agent_chat::config::EnvOverrides;
use agent_chat::daemon::DaemonSupervisor;
use clap::Parser;

/// Long-lived delivery daemon for one Agent Chat handle.
#[derive(Parser, Debug)]
#[command(name = "agent-chat-daemon", version, about)]
struct Args {
    /// Handle to serve (falls back to AGENT_CHAT_HANDLE).
    handle: Option<String>,

    /// Relay root URL override.
    #[arg(long)]
    relay: Option<String>,

    /// Verbose logging (also AGENT_CHAT_VERBOSE=1).
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let mut env = EnvOverrides::from_env();
    if let Some(relay) = args.relay {
        env.relay = Some(relay);
    }
    agent_chat::init_logging(args.verbose || env.verbose);

    let Some(handle) = args.handle.or_else(|| env.handle.clone()) else {
        anyhow::bail!("no handle supplied (argument or AGENT_CHAT_HANDLE)");
    };

    let supervisor = DaemonSupervisor::bootstrap(&handle, &env)?;
    supervisor.run().await?;
    Ok(())
}
