//! rollout CLI entry point.

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = rollout::cli::parse_cli();
    let exit_code = rollout::cli::run_with_cli(cli).await?;
    if exit_code != 0 {
        std::process::exit(exit_code);
    }
    Ok(())
}
