use anyhow::Result;

fn main() -> Result<()> {
    explainbox::cli::run()
}
