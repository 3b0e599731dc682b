#[tokio::main]
async fn main() {
    if let Err(error) = market_round_engine::run().await {
        tracing::error!(%error, "market round engine failed");
        eprintln!("market round engine failed: {error}");
        std::process::exit(1);
    }
}
