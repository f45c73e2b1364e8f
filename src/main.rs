#[tokio::main]
async fn main() -> anyhow::Result<()> {
    reactest_lib::run().await
}
