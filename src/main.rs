use std::error::Error;

use serde_json::json;
use specify_federate::Coordinator;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt::init();

    let config = specify_federate::config::Config::from_env()?;
    let coordinator = Coordinator::new(config.base_url, config.query_rows, config.cache_ttl);

    coordinator.start().await?;

    let settings = coordinator.settings().await?;
    println!("{settings}");

    let query_terms = vec![json!("*")];
    let result = coordinator.query(&query_terms, &[], None, false, 0).await?;
    println!("{} docs, {} total", result.docs.len(), result.total);

    Ok(())
}
