//! Deployment described in YAML.
//!
//! ```sh
//! cargo run --example from_yaml -- plan
//! TREBUCHET_CONFIG=prod.yaml cargo run --example from_yaml -- apply --stage production
//! ```

use std::path::PathBuf;

use trebuchet::{Deployment, Pipeline};

fn main() -> anyhow::Result<()> {
    let path = std::env::var_os("TREBUCHET_CONFIG")
        .map_or_else(|| PathBuf::from("demos/deploy.yaml"), PathBuf::from);

    let deployment = Deployment::from_yaml_file(&path)?;
    deployment.validate()?;

    Pipeline::new(deployment).run()?;
    Ok(())
}
