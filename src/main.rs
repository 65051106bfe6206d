// ABOUTME: syncast client binary
// ABOUTME: Serves the control socket and streams on START until Ctrl+C

use clap::Parser;
use std::sync::Arc;
use syncast::audio::list_output_devices;
use syncast::cli::ClientArgs;
use syncast::control::ControlServer;
use syncast::StreamingClient;
use tokio::sync::watch;

#[derive(Parser, Debug)]
#[command(name = "syncast")]
#[command(author, version, about = "Synchronized audio streaming client", long_about = None)]
struct Args {
    #[command(flatten)]
    client: ClientArgs,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let args = Args::parse();

    if args.client.list_devices {
        for device in list_output_devices() {
            println!("{}: {}\n   {}", device.index, device.id, device.description);
        }
        return Ok(());
    }

    args.client.init_tracing();
    args.client.log_startup_info();

    let settings = args.client.build_settings()?;
    let initial_server = args.client.initial_server()?;
    let client = Arc::new(StreamingClient::new(settings));

    if let Some(server) = initial_server {
        let start_client = Arc::clone(&client);
        let started = tokio::task::spawn_blocking(move || start_client.start(&server)).await?;
        if !started {
            tracing::warn!("Failed to start streaming");
        }
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let control = ControlServer::new(args.client.socket.clone(), Arc::clone(&client));
    let mut control_task = tokio::spawn(control.run(shutdown_rx));

    tracing::info!("Press Ctrl+C to stop");
    let control_result = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            tracing::info!("Received shutdown signal");
            let _ = shutdown_tx.send(true);
            control_task.await?
        }
        result = &mut control_task => result?,
    };
    if let Err(e) = control_result {
        tracing::error!("Control socket failed: {}", e);
    }

    tokio::task::spawn_blocking(move || client.shutdown()).await?;
    tracing::info!("Shutdown complete");
    Ok(())
}
