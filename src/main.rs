#[tokio::main]
async fn main() -> anyhow::Result<()> {
    ctf_range_manager::cli::run().await
}
