#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = gradi_rust::run().await {
        eprintln!("gradi-rust fatal: {e:#}");
        std::process::exit(1);
    }
    Ok(())
}
