fn main() -> anyhow::Result<()> {
    coprun::cli::run_cli()
}
