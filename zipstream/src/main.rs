mod application;
mod presentation;

use zipstream_core::error::Result;

#[tokio::main]
async fn main() -> Result<()> {
    application::run().await
}
