use blockhost_controller::options::Options;
use clap::Parser;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let opt = Options::parse();
    opt.logging.init();
    blockhost_controller::run(opt).await
}
