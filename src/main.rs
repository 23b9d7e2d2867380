//! otpgate entry point.
//!
//! Bootstraps the server:
//! 1. Load configuration from environment
//! 2. Open stores (Redis when `REDIS_URL` is set, in-memory otherwise)
//! 3. Pick the delivery channel (Twilio when configured)
//! 4. Spawn the background sweep
//! 5. Serve the API until Ctrl-C / SIGTERM
//!
//! Also supports a `keygen` subcommand that prints a fresh `JWT_SECRET`.

use otpgate::{
    auth::middleware::AppState,
    cleanup::{run_sweep_loop, Sweeper},
    clock::{Clock, SystemClock},
    config::Config,
    delivery::{DeliveryChannel, TwilioSms, Unconfigured},
    routes,
    storage::Stores,
};
use rand::RngCore;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use zeroize::Zeroizing;

/// Random 32-byte signing secret, base64-encoded.
fn keygen() -> String {
    let mut secret = Zeroizing::new([0u8; 32]);
    rand::rng().fill_bytes(&mut secret[..]);
    base64::Engine::encode(&base64::engine::general_purpose::STANDARD, &secret[..])
}

fn print_keygen_usage() {
    eprintln!("Usage: otpgate keygen");
    eprintln!();
    eprintln!("Generate a random secret for JWT_SECRET.");
    eprintln!();
    eprintln!("Then set in .env:");
    eprintln!("  JWT_SECRET=<output>");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}

#[tokio::main]
async fn main() {
    // Check for keygen subcommand
    let args: Vec<String> = std::env::args().collect();
    if args.len() >= 2 && args[1] == "keygen" {
        if args.len() != 2 {
            print_keygen_usage();
            std::process::exit(1);
        }
        println!("{}", keygen());
        return;
    }

    // Initialize tracing with env filter support (RUST_LOG)
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = Config::from_env().expect("Failed to load config");
    tracing::info!("Starting otpgate on {}", config.bind_addr);

    let stores = match config.redis_url.as_deref() {
        Some(url) => {
            let stores = Stores::redis(url)
                .await
                .expect("Failed to connect to Redis");
            tracing::info!("Using Redis stores");
            stores
        }
        None => {
            tracing::warn!("REDIS_URL not set, using in-memory stores (state is lost on restart)");
            Stores::in_memory()
        }
    };

    let delivery: Arc<dyn DeliveryChannel> = match config.twilio.clone() {
        Some(options) => Arc::new(TwilioSms::new(options)),
        None => {
            tracing::warn!("Twilio not configured, OTP codes will not be delivered");
            Arc::new(Unconfigured)
        }
    };

    if config.expose_code_on_delivery_failure {
        tracing::warn!("EXPOSE_CODE_ON_DELIVERY_FAILURE is enabled; do not use in production");
    }

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let bind_addr = config.bind_addr;
    let sweep_interval = Duration::from_secs(config.sweep_interval_secs);

    let state = AppState::new(config, &stores, delivery, clock.clone());

    let sweeper = Sweeper::new(&stores, clock);
    let sweep_task = tokio::spawn(run_sweep_loop(sweeper, sweep_interval));

    let app = routes::build_app(state);

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .expect("Failed to bind");
    tracing::info!("Listening on {}", bind_addr);

    // with_connect_info is required for the ConnectInfo<SocketAddr> rate-limit key
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .expect("Server error");

    sweep_task.abort();
    tracing::info!("Server stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keygen_produces_32_byte_secret() {
        let secret = keygen();
        let bytes =
            base64::Engine::decode(&base64::engine::general_purpose::STANDARD, &secret).unwrap();
        assert_eq!(bytes.len(), 32);
        assert!(secret.len() >= otpgate::config::MIN_SECRET_BYTES);
        assert_ne!(secret, keygen());
    }
}
