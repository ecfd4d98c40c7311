//! Tunnel deployment.
//!
//! Same app as `direct_proxy`, but the host only admits SSH. A
//! `cloudflared` container dials out to the edge and the domain is a
//! proxied CNAME to the tunnel.
//!
//! ```sh
//! cargo run --example tunnel -- apply --stage staging
//! cargo run --example tunnel -- output --json --stage staging
//! ```

use trebuchet::{App, Deployment, Ingress, KeyAlgorithm, Pipeline};

fn main() -> anyhow::Result<()> {
    let app = App::new("app")
        .image("shop/web")
        .context("./web")
        .build_command(&["pnpm", "build"])
        .start_command(&["pnpm", "start"])
        .port(3000);

    let deployment = Deployment::new("shop")
        .domain("shop.example.com")
        .zone_id("0123456789abcdef0123456789abcdef")
        .account_id("fedcba9876543210fedcba9876543210")
        .key_algorithm(KeyAlgorithm::EcdsaP256)
        .app(app)
        .ingress(Ingress::tunnel());

    Pipeline::new(deployment).run()?;
    Ok(())
}
