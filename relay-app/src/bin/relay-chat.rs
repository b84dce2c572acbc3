//! `relay-chat <messages-json>`

use relay_app::{RelayConfig, chat, telemetry};

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    if let Err(e) = telemetry::init_tracing() {
        eprintln!("tracing disabled: {e:#}");
    }
    telemetry::install_panic_hook(0);

    let exit = chat::run(
        std::env::args_os(),
        &RelayConfig::process_env,
        tokio::io::stdin(),
        chat::connect_gateway,
    )
    .await;
    println!("{}", exit.line);
    std::process::exit(exit.code);
}
