use anyhow::Result;

fn main() -> Result<()> {
    sealbox::cli::run()
}
