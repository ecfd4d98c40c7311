use clap::{Parser, Subcommand};

use crate::config::{Deployment, RemovalPolicy};
use crate::error::{DeployError, DeployResult};
use crate::graph::{Action, PlannedStep, Report};
use crate::keys::WipeList;
use crate::logging;
use crate::workflow::{Backends, Endpoint, Workflow};

/// Command-line entry point around one [`Deployment`].
///
/// ```rust,no_run
/// use trebuchet::{App, Deployment, Ingress, Pipeline};
///
/// fn main() -> anyhow::Result<()> {
///     let deployment = Deployment::new("shop")
///         .domain("shop.example.com")
///         .zone_id("0123456789abcdef")
///         .app(App::new("app").context("./web").port(3000))
///         .ingress(Ingress::direct_proxy());
///
///     Pipeline::new(deployment).run()?;
///     Ok(())
/// }
/// ```
pub struct Pipeline {
    deployment: Deployment,
    backends: Option<Backends>,
}

impl Pipeline {
    #[must_use]
    pub const fn new(deployment: Deployment) -> Self {
        Self {
            deployment,
            backends: None,
        }
    }

    /// Use these backends instead of the live ones.
    #[must_use]
    pub fn backends(mut self, backends: Backends) -> Self {
        self.backends = Some(backends);
        self
    }

    /// Parse CLI arguments and dispatch the appropriate
    /// command.
    ///
    /// # Errors
    ///
    /// Returns an error if the dispatched command fails.
    pub fn run(self) -> DeployResult<()> {
        self.run_cli(Cli::parse())
    }

    fn run_cli(self, cli: Cli) -> DeployResult<()> {
        logging::init(cli.verbose);

        let mut deployment = self.deployment;
        if let Some(stage) = cli.stage {
            deployment.stage = stage;
        }

        let backends = match self.backends {
            Some(b) => b,
            None => Backends::live(&deployment)?,
        };

        let wipe = WipeList::new();
        let on_interrupt = wipe.clone();
        ctrlc::set_handler(move || {
            on_interrupt.wipe_all();
            std::process::exit(130);
        })
        .map_err(|e| DeployError::Other(format!("cannot install interrupt handler: {e}")))?;

        let workflow = Workflow::new(&deployment, &backends).with_wipe_list(wipe);

        match cli.command {
            Command::Apply => cmd_apply(&workflow),
            Command::Plan => cmd_plan(&workflow),
            Command::Destroy { yes } => cmd_destroy(&workflow, &deployment, yes),
            Command::Status => {
                println!("{}", workflow.status()?);
                Ok(())
            }
            Command::Output { json } => cmd_output(&workflow, json),
        }
    }
}

fn cmd_apply(workflow: &Workflow<'_>) -> DeployResult<()> {
    let outcome = workflow.apply()?;
    print_report(&outcome.report);

    for warning in &outcome.warnings {
        eprintln!("warning: {warning}");
    }
    if let Some(endpoint) = &outcome.endpoint {
        eprintln!();
        print_endpoint(endpoint);
    }
    Ok(())
}

fn cmd_plan(workflow: &Workflow<'_>) -> DeployResult<()> {
    let steps = workflow.plan()?;
    print_plan(&steps);
    Ok(())
}

fn cmd_destroy(workflow: &Workflow<'_>, deployment: &Deployment, yes: bool) -> DeployResult<()> {
    let retain = deployment.removal_policy() == RemovalPolicy::Retain;
    if retain {
        eprintln!(
            "Stage '{}' retains its resources: they stay in place, \
             only local state and key material are removed.",
            deployment.stage
        );
    } else {
        eprintln!(
            "WARNING: This will permanently delete every resource \
             of '{}', including the DNS record for {}",
            deployment.resource_name(),
            deployment.domain
        );
    }
    eprintln!();

    if !yes {
        eprint!("Are you sure? Type 'yes' to confirm: ");
        let mut input = String::new();
        std::io::stdin().read_line(&mut input)?;
        if input.trim() != "yes" {
            eprintln!("Aborted.");
            return Ok(());
        }
    }

    let teardown = workflow.destroy()?;
    for id in &teardown.deleted {
        eprintln!("  - {id}");
    }
    eprintln!();
    if teardown.retained {
        eprintln!("State cleared; remote resources retained.");
    } else {
        eprintln!("Cleanup complete!");
    }
    Ok(())
}

fn cmd_output(workflow: &Workflow<'_>, json: bool) -> DeployResult<()> {
    let Some(endpoint) = workflow.endpoint()? else {
        return Err(DeployError::Other(
            "nothing deployed yet; run apply first".into(),
        ));
    };
    if json {
        println!("{}", serde_json::to_string_pretty(&endpoint)?);
    } else {
        print_endpoint(&endpoint);
    }
    Ok(())
}

fn print_report(report: &Report) {
    for (symbol, ids) in [
        ("+", &report.created),
        ("~", &report.updated),
        ("-", &report.deleted),
    ] {
        for id in ids {
            eprintln!("  {symbol} {id}");
        }
    }
    if report.is_noop() {
        eprintln!("No changes; {} resources up to date.", report.unchanged.len());
    } else {
        eprintln!(
            "{} created, {} updated, {} deleted, {} unchanged.",
            report.created.len(),
            report.updated.len(),
            report.deleted.len(),
            report.unchanged.len()
        );
    }
}

fn print_plan(steps: &[PlannedStep]) {
    let mut changes = 0;
    for step in steps {
        if step.action != Action::Keep {
            changes += 1;
        }
        println!("  {} {}", step.action.symbol(), step.id);
    }
    eprintln!();
    eprintln!("{changes} of {} resources would change.", steps.len());
}

fn print_endpoint(endpoint: &Endpoint) {
    println!("url:    {}", endpoint.url);
    println!("mode:   {}", endpoint.mode);
    println!("host:   {}", endpoint.host_address);
    if let Some(target) = &endpoint.dns_target {
        println!("dns:    {target}");
    }
    if let Some(tunnel) = &endpoint.tunnel_hostname {
        println!("tunnel: {tunnel}");
    }
}

#[derive(Parser)]
#[command(name = "trebuchet")]
#[command(about = "Provision, roll out, and expose one web app")]
struct Cli {
    /// Override the deployment stage
    #[arg(long, global = true)]
    stage: Option<String>,

    /// More output; repeat for trace
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create or converge every resource
    Apply,

    /// Show what apply would change
    Plan,

    /// Tear the deployment down
    Destroy {
        /// Skip the confirmation prompt
        #[arg(long)]
        yes: bool,
    },

    /// Show container status on the host
    Status,

    /// Print the deployment's endpoint
    Output {
        /// As JSON
        #[arg(long)]
        json: bool,
    },
}
