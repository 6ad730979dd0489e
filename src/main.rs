use std::process::ExitCode;

use kymar::{ConnectionBroker, ConnectionStore, ConnectorSettings};

const USAGE: &str = "usage: kymar <profile-name> | kymar --list";

#[tokio::main]
async fn main() -> ExitCode {
    kymar::init_logging();

    let arg = match std::env::args().nth(1) {
        Some(arg) => arg,
        None => {
            eprintln!("{USAGE}");
            return ExitCode::FAILURE;
        }
    };

    match run(&arg).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(arg: &str) -> Result<(), Box<dyn std::error::Error>> {
    let store = ConnectionStore::load()?;

    if arg == "--list" {
        for saved in store.sorted() {
            let marker = if saved.is_favorite { "*" } else { " " };
            let via = match &saved.params.tunnel {
                Some(tunnel) => format!(" via ssh {}", tunnel.endpoint()),
                None => String::new(),
            };
            println!(
                "{marker} {} ({} {}{})",
                saved.name,
                saved.params.engine,
                saved.params.target(),
                via
            );
        }
        return Ok(());
    }
    if arg == "-h" || arg == "--help" {
        println!("{USAGE}");
        return Ok(());
    }

    let saved = store
        .get_connection(arg)
        .ok_or_else(|| format!("no saved connection named '{arg}' in {}", store.path().display()))?;

    let broker = ConnectionBroker::new(ConnectorSettings::from_env());
    let conn = broker.connect(&saved.params).await?;
    println!("Connected to {} ({})", saved.name, conn.route());

    let listed = conn.list_objects().await;
    match &listed {
        Ok(objects) => {
            for object in objects {
                println!("  {object}");
            }
        }
        Err(e) => eprintln!("Catalog listing failed: {e}"),
    }

    conn.close().await?;
    listed?;
    Ok(())
}
