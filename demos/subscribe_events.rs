use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use plasma_sdk::stream::connection::DebugLog;
use plasma_sdk::{Event, PlasmaClient, StreamSession, TransportSecurity};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let host = std::env::var("PLASMA_HOST").unwrap_or_else(|_| "localhost".to_string());
    let port = std::env::var("PLASMA_PORT")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(8080);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let debug_log: DebugLog = Arc::new(|line: &str| eprintln!("[plasma] {line}"));
        let client = PlasmaClient::new(host, port)
            .with_security(TransportSecurity::Insecure)
            .with_retry_delay(Duration::from_secs(2))
            .with_debug_log(debug_log);

        let mut session = StreamSession::connect(&client, 5)?;
        session.subscribe(["price", "news"]);

        let mut received = 0usize;
        while let Some(event) = session.recv().await {
            match event {
                Event::Next(payload) => {
                    received += 1;
                    println!("{} => {}", payload.event_type, payload.data);
                    if received == 10 {
                        session.subscribe(["news"]);
                    }
                }
                Event::Error(err) => {
                    eprintln!("stream error: {err}");
                    break;
                }
            }
        }

        session.close();
        Ok(())
    })
}
