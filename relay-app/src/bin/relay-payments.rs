//! `relay-payments create_session|get_status|webhook|doctor ...`

use relay_app::{RelayConfig, payments, telemetry};

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    if let Err(e) = telemetry::init_tracing() {
        eprintln!("tracing disabled: {e:#}");
    }
    telemetry::install_panic_hook(1);

    let exit = payments::run(
        std::env::args_os(),
        &RelayConfig::process_env,
        tokio::io::stdin(),
        payments::connect_stripe,
    )
    .await;
    println!("{}", exit.line);
    std::process::exit(exit.code);
}
