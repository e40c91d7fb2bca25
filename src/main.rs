#[tokio::main]
async fn main() {
    if let Err(e) = patholens::run().await {
        tracing::error!("PathoLens failed: {e}");
        eprintln!("patholens: {e}");
        std::process::exit(1);
    }
}
