use anyhow::Result;

use judgeflow::app::serve;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    serve().await
}
