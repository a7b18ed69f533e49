use std::env;
use std::time::Duration;

use inspector_relay::history::DEFAULT_HISTORY_CAPACITY;
use inspector_relay::server::{RelayConfig, RelayServer, DEFAULT_PORT, DEFAULT_RETRY_DELAY};
use inspector_relay::{logging, rlog};

#[tokio::main]
async fn main() {
    logging::init();

    let config = RelayConfig {
        port: env_u16("INSPECTOR_RELAY_PORT", DEFAULT_PORT),
        fallback_port: DEFAULT_PORT,
        history_capacity: env_usize("INSPECTOR_RELAY_HISTORY_CAPACITY", DEFAULT_HISTORY_CAPACITY),
        retry_delay: Duration::from_millis(env_u64(
            "INSPECTOR_RELAY_RETRY_DELAY_MS",
            DEFAULT_RETRY_DELAY.as_millis() as u64,
        )),
    };

    let server = RelayServer::new(config);
    let _subscription = server.status().subscribe(|status| {
        if let Some(error) = &status.error {
            rlog!("status: {error}");
        } else if status.running {
            rlog!("status: running on port {}", status.port.unwrap_or(0));
        } else {
            rlog!("status: stopped");
        }
    });

    server.start(None).await;

    tokio::signal::ctrl_c().await.ok();
    server.stop().await;
}

fn env_u16(key: &str, default_value: u16) -> u16 {
    env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default_value)
}

fn env_u64(key: &str, default_value: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default_value)
}

fn env_usize(key: &str, default_value: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default_value)
}
