use anyhow::Result;

fn main() -> Result<()> {
    spawnkit::cli::run()
}
