use admin_ipc::{send_request, AdminRequest, DEFAULT_SOCKET_PATH};
use anyhow::Result;
use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
struct Cli {
    #[arg(long, env = "ADMIN_SOCKET", default_value = DEFAULT_SOCKET_PATH)]
    socket: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the daemon's run id, sync state, connectivity and snapshot.
    Status,
    /// Trigger an immediate fetch outside the poll interval.
    Refresh,
    /// Stop polling without shutting the daemon down.
    Pause,
    /// Resume polling after a pause.
    Resume,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let req = match cli.command {
        Command::Status => AdminRequest::Status,
        Command::Refresh => AdminRequest::Refresh,
        Command::Pause => AdminRequest::Pause,
        Command::Resume => AdminRequest::Resume,
    };

    let resp = send_request(&cli.socket, &req).await?;
    println!("{}", serde_json::to_string(&resp)?);
    Ok(())
}
