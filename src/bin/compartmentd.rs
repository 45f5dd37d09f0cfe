use anyhow::Result;

fn main() -> Result<()> {
    compartmentd::cli::run()
}
