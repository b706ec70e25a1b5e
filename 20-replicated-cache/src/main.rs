use anyhow::{Context, Result};
use clap::Parser;
use tokio::{io::AsyncWriteExt, net::TcpListener};
use tracing::{info, warn};

use replicated_cache::{
    cli::{Cli, Command, ServeArgs},
    client::Client,
    server::{Server, ServerConfig},
};

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve(args) => serve(args).await?,
        Command::Get(args) => {
            let mut client = Client::connect(args.server)
                .await
                .with_context(|| format!("failed to connect to {}", args.server))?;
            let value = client.get(args.key).await?;
            let mut stdout = tokio::io::stdout();
            stdout.write_all(&value).await?;
            stdout.write_all(b"\n").await?;
            stdout.flush().await?;
        }
        Command::Set(args) => {
            let mut client = Client::connect(args.server)
                .await
                .with_context(|| format!("failed to connect to {}", args.server))?;
            client.set(args.key, args.value, args.ttl).await?;
            client.close().await?;
        }
        Command::Delete(args) => {
            let mut client = Client::connect(args.server)
                .await
                .with_context(|| format!("failed to connect to {}", args.server))?;
            client.delete(args.key).await?;
            client.close().await?;
        }
    }

    Ok(())
}

async fn serve(args: ServeArgs) -> Result<()> {
    let listener = TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("failed to bind {}", args.listen))?;
    let server = Server::new(listener, ServerConfig::from(&args));
    let addr = server.local_addr()?;

    match args.leader {
        Some(leader) => info!("follower of {leader} listening on {addr}"),
        None => info!("leader listening on {addr}"),
    }

    if let Err(err) = server.run_until_ctrl_c().await {
        warn!("server exited with error: {err:?}");
        return Err(err);
    }

    Ok(())
}
