use anyhow::Result;

fn main() -> Result<()> {
    pipbox::cli::run()
}
