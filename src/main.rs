#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dkg_node::run().await
}
