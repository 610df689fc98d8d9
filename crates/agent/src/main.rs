#[tokio::main]
async fn main() -> anyhow::Result<()> {
    host_agent::run().await
}
