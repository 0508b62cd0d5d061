#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = scanflow::cli::parse_cli();
    scanflow::runner::run_from_cli(cli).await
}
