//! Provision a VM, roll out a containerised web app, and put it
//! behind an edge network, from a typed Rust description.
//!
//! Trebuchet takes one [`Deployment`] and turns it into a graph of
//! resources: a generated SSH key, a Hetzner server with a firewall,
//! the app's image, volume, networks and containers, and one of two
//! ingress variants in front of it:
//!
//! - **direct proxy**: a Caddy container terminates TLS with an
//!   origin certificate issued by Cloudflare and only accepts
//!   connections that present the edge's client certificate
//!   (authenticated origin pulls); a proxied `A` record points at the
//!   host.
//! - **tunnel**: a `cloudflared` container dials out to the edge, the
//!   firewall only admits SSH, and a proxied `CNAME` points at the
//!   tunnel.
//!
//! # Lifecycle
//!
//! Every applied resource is recorded in a local state file together
//! with a fingerprint of its inputs. Re-running `apply` with the same
//! description changes nothing; a changed build context rebuilds the
//! image and replaces only what consumes it. Switching ingress
//! variants removes the old variant before the new one is created.
//! `destroy` removes the DNS record first and the host last.
//!
//! Runs on the same deployment and stage exclude each other through a
//! lock file next to the state.
//!
//! # Example
//!
//! Create an `xtask/src/main.rs` in your project:
//!
//! ```rust,no_run
//! use trebuchet::{App, Deployment, Ingress, Pipeline};
//!
//! fn main() -> anyhow::Result<()> {
//!     let app = App::new("app")
//!         .image("shop/web")
//!         .context("./web")
//!         .target("production")
//!         .env("NODE_ENV", "production")
//!         .port(3000);
//!
//!     let deployment = Deployment::new("shop")
//!         .domain("shop.example.com")
//!         .zone_id("0123456789abcdef0123456789abcdef")
//!         .account_id("fedcba9876543210fedcba9876543210")
//!         .app(app)
//!         .ingress(Ingress::tunnel());
//!
//!     Pipeline::new(deployment).run()?;
//!     Ok(())
//! }
//! ```
//!
//! Then use `cargo xtask` subcommands:
//!
//! ```sh
//! # Show what would change
//! cargo xtask plan
//!
//! # Create or converge everything
//! cargo xtask apply
//!
//! # Same app, another stage
//! cargo xtask apply --stage production
//!
//! # Where it is reachable
//! cargo xtask output --json
//!
//! # Tear everything down
//! cargo xtask destroy
//! ```
//!
//! Credentials come from the environment: `HCLOUD_TOKEN` for the
//! `hcloud` CLI and `CLOUDFLARE_API_TOKEN` for the edge API.

// Allow noisy pedantic lints that don't add value for a
// deployment tool crate.
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions
)]

pub mod app;
pub mod caddy;
pub mod caddyfile;
pub mod cmd;
pub mod config;
pub mod container;
pub mod deploy;
pub mod dns;
pub mod edge;
pub mod error;
pub mod graph;
pub mod ingress;
pub mod keys;
pub mod logging;
pub mod pipeline;
pub mod provision;
pub mod ssh;
pub mod state;
pub mod workflow;

pub use app::App;
pub use caddy::Caddy;
pub use config::{Deployment, RemovalPolicy};
pub use deploy::docker_save::DockerSaveLoad;
pub use edge::cloudflare::Cloudflare;
pub use error::{DeployError, DeployResult};
pub use ingress::{DirectProxy, Ingress, Tunnel};
pub use keys::KeyAlgorithm;
pub use pipeline::Pipeline;
pub use provision::hetzner::Hetzner;
pub use ssh::Probe;
pub use workflow::{Backends, Endpoint, Workflow};
