use anyhow::Result;

use backend::{BackendConfig, Engine};

fn main() -> Result<()> {
    pretty_env_logger::init();

    let config = BackendConfig::from_env();
    match Engine::new(config) {
        Err(err) => println!("{}", err),
        Ok(e) => e.run()?,
    }

    Ok(())
}
