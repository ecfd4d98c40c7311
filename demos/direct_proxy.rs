//! Direct-proxy deployment.
//!
//! Provisions a Hetzner server, builds `./web` into an image, and
//! serves it through Caddy with a Cloudflare origin certificate. Only
//! requests that come through Cloudflare's edge are accepted.
//!
//! ```sh
//! export HCLOUD_TOKEN=...
//! export CLOUDFLARE_API_TOKEN=...
//!
//! cargo run --example direct_proxy -- plan
//! cargo run --example direct_proxy -- apply
//! cargo run --example direct_proxy -- destroy
//! ```

use trebuchet::{App, Deployment, DirectProxy, Ingress, Pipeline};

fn main() -> anyhow::Result<()> {
    let app = App::new("app")
        .image("shop/web")
        .context("./web")
        .target("production")
        .env("NODE_ENV", "production")
        .healthcheck("wget -q --spider http://localhost:3000/")
        .port(3000);

    let proxy = DirectProxy {
        security_headers: true,
        ..DirectProxy::default()
    };

    let deployment = Deployment::new("shop")
        .domain("shop.example.com")
        .zone_id("0123456789abcdef0123456789abcdef")
        .admin_sources(&["198.51.100.0/24"])
        .app(app)
        .ingress(Ingress::DirectProxy(proxy));

    Pipeline::new(deployment).run()?;
    Ok(())
}
