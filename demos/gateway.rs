//! Run the gateway against an in-process loopback SMSC and expose the submit
//! endpoint over Axum. Point `SMSGATE__SMPP__ADDRESS` and friends at a real
//! provider once a network connector is plugged in.
//!
//! ```text
//! curl -d 'source=6791&target=996771977377&text=hello' http://127.0.0.1:8080/
//! ```

use sms_gateway::prelude::*;
use sms_loopback::LoopbackSmsc;
use sms_web_axum::{router, AppState};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if logging.format == "json" {
        builder.json().init();
    } else {
        builder.pretty().init();
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::load()?;
    init_tracing(&config.logging);

    let smsc = LoopbackSmsc::new().with_auto_receipts(true);
    let session = SessionManager::new(
        config.session_config(),
        Arc::new(smsc),
        Arc::new(LoggingHandler),
    )?;

    let mut status = session.bind()?;
    tokio::spawn(async move {
        while let Some(event) = status.recv().await {
            match event {
                StatusEvent::Status(status) => match &status.error {
                    Some(reason) => {
                        error!(state = %status.state, %reason, "Session status changed")
                    }
                    None => info!(state = %status.state, "Session status changed"),
                },
                StatusEvent::Gap { missed } => info!(missed, "Missed status updates"),
            }
        }
    });

    let app = router(AppState::new(Arc::new(session.clone())));
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    session.close().await;
    info!("Gateway stopped");
    Ok(())
}
