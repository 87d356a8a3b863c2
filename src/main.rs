use clap::{Args, Parser, Subcommand, ValueEnum};
use sitegate::config::{BackendMode, Config, ServiceConfig};
use sitegate::distro::DistroProfile;
use sitegate::gateway::{BackendConfigWriter, GatewayConfig};
use sitegate::host::{Host, RecordingHost, SystemHost};
use sitegate::lifecycle::LifecycleController;
use sitegate::modules::{ModuleActivator, RestartPolicy};
use sitegate::publish::{self, Publisher, ServiceSpec};
use sitegate::readiness::{Probe, ReadinessPoller};
use sitegate::sites::{Site, SiteRegistry};
use std::path::PathBuf;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "sitegate")]
#[command(about = "Publish uwsgi services behind apache", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file (defaults plus environment overrides when omitted)
    #[arg(short, long, global = true, env = "SITEGATE_CONFIG")]
    config: Option<PathBuf>,

    /// Record host commands instead of running them, then print them
    #[arg(long, global = true)]
    dry_run: bool,

    /// Enable trace output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the resolved distro profile as JSON
    Profile,
    /// Install the front-end server and its uwsgi proxy module
    Install,
    /// Publish one service
    Publish(PublishArgs),
    /// Remove a published service
    Unpublish {
        name: String,
        /// Gateway config to delete (default: from config or conf_dir)
        #[arg(long)]
        conf: Option<String>,
    },
    /// Publish every service in the configuration with a single restart
    Apply {
        /// Wait for each backend to come up
        #[arg(long)]
        wait: bool,
    },
    /// Enable a site and restart the front-end
    EnableSite { site: String },
    /// Disable a site and restart the front-end
    DisableSite { site: String },
    /// List sites as JSON
    Sites,
    /// Enable front-end modules, restarting once if any changed
    EnableMod {
        #[arg(required = true)]
        modules: Vec<String>,
    },
    /// Start the front-end server
    Start,
    /// Stop the front-end server
    Stop,
    /// Restart the front-end server
    Restart,
    /// Poll a backend until it answers or the attempts run out
    WaitReady(WaitArgs),
}

#[derive(Args)]
struct PublishArgs {
    /// Site name; settings under [services.<name>] are used as defaults
    name: String,
    /// URL prefix on the front-end, e.g. /image
    #[arg(long)]
    url: Option<String>,
    /// Module path (pkg.module:app) or WSGI file
    #[arg(long)]
    worker: Option<String>,
    #[arg(long, value_enum)]
    mode: Option<ModeArg>,
    #[arg(long)]
    processes: Option<u32>,
    /// Gateway config path
    #[arg(long)]
    conf: Option<String>,
    /// Wait for the backend to come up
    #[arg(long)]
    wait: bool,
}

#[derive(Args)]
struct WaitArgs {
    /// Service whose gateway config names the backend
    #[arg(conflicts_with_all = ["tcp", "unix", "http"])]
    name: Option<String>,
    /// host:port to connect to
    #[arg(long, conflicts_with_all = ["unix", "http"])]
    tcp: Option<String>,
    /// Unix socket to connect to
    #[arg(long, conflicts_with = "http")]
    unix: Option<PathBuf>,
    /// host:port to send an HTTP GET to
    #[arg(long)]
    http: Option<String>,
    /// Request path for --http
    #[arg(long, default_value = "/")]
    path: String,
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    Socket,
    Http,
}

impl From<ModeArg> for BackendMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Socket => BackendMode::Socket,
            ModeArg::Http => BackendMode::Http,
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let directive = if cli.verbose {
        "sitegate=trace"
    } else {
        "sitegate=debug"
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(directive.parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config = match &cli.config {
        Some(path) => {
            let config = Config::load(path).map_err(|e| {
                error!(path = %path.display(), error = %e, "Failed to load configuration");
                e
            })?;
            info!(path = %path.display(), "Configuration loaded");
            config
        }
        None => Config::from_env()?,
    };

    let profile = config.resolve_profile()?;
    info!(
        family = ?profile.family,
        service = %profile.process_name,
        config_root = %profile.config_root_dir.display(),
        "Distro profile resolved"
    );

    let recording = cli.dry_run.then(|| RecordingHost::for_profile(&profile));
    let system;
    let host: &dyn Host = match &recording {
        Some(recording) => {
            warn!("Dry run: host commands are recorded, configuration files are still written");
            recording
        }
        None => {
            system = SystemHost::new(&profile, config.host.command_prefix()?);
            &system
        }
    };

    let result = run(&cli.command, &config, &profile, host);

    if let Some(recording) = &recording {
        for command in recording.commands() {
            println!("{}", command);
        }
    }

    result
}

fn run(
    command: &Commands,
    config: &Config,
    profile: &DistroProfile,
    host: &dyn Host,
) -> anyhow::Result<()> {
    let lifecycle =
        LifecycleController::with_settle_delay(profile, host, config.frontend.restart_settle());
    let modules = ModuleActivator::new(profile, host, &lifecycle);
    let registry = SiteRegistry::new(profile, host, &modules);
    let backends = BackendConfigWriter::new(host, &config.gateway);
    let publisher = Publisher::new(
        &lifecycle,
        &modules,
        &registry,
        &backends,
        config.frontend.local_host.clone(),
    );
    let poller = ReadinessPoller::from(&config.readiness);

    match command {
        Commands::Profile => print_json(profile)?,
        Commands::Install => {
            let installed = publish::install_packages(profile, host)?;
            for package in installed {
                println!("{}", package);
            }
        }
        Commands::Publish(args) => {
            let spec = publish_spec(config, args)?;
            let site = publisher.publish(&spec)?;
            print_json(&site)?;
            if args.wait {
                wait_for_site(&poller, &site)?;
            }
        }
        Commands::Unpublish { name, conf } => {
            let conf = conf
                .as_ref()
                .map(PathBuf::from)
                .unwrap_or_else(|| conf_path(config, name));
            publisher.unpublish(name, &conf)?;
        }
        Commands::Apply { wait } => {
            let specs = config.service_specs();
            if specs.is_empty() {
                warn!("No services configured");
                return Ok(());
            }
            let sites = publisher.publish_all(&specs)?;
            print_json(&sites)?;
            if *wait {
                for site in &sites {
                    wait_for_site(&poller, site)?;
                }
            }
        }
        Commands::EnableSite { site } => {
            registry.enable(site)?;
            lifecycle.restart()?;
        }
        Commands::DisableSite { site } => {
            registry.disable(site)?;
            lifecycle.restart()?;
        }
        Commands::Sites => print_json(&registry.list()?)?,
        Commands::EnableMod { modules: names } => {
            let names: Vec<&str> = names.iter().map(String::as_str).collect();
            let result = modules.activate_all(&names, RestartPolicy::Immediate)?;
            info!(changed = result.changed, "Modules active");
        }
        Commands::Start => lifecycle.start()?,
        Commands::Stop => lifecycle.stop()?,
        Commands::Restart => lifecycle.restart()?,
        Commands::WaitReady(args) => {
            let probe = wait_probe(config, args)?;
            let attempts = poller.wait_for(&probe)?;
            println!("{} ready after {} attempt(s)", probe.target(), attempts);
        }
    }

    Ok(())
}

/// Merge command-line flags over the `[services.<name>]` entry
fn publish_spec(config: &Config, args: &PublishArgs) -> anyhow::Result<ServiceSpec> {
    let base = config.services.get(&args.name);
    let url = args
        .url
        .clone()
        .or_else(|| base.map(|s| s.url.clone()))
        .ok_or_else(|| anyhow::anyhow!("Service '{}' has no url; pass --url", args.name))?;
    let worker = args
        .worker
        .clone()
        .or_else(|| base.map(|s| s.worker.clone()))
        .ok_or_else(|| anyhow::anyhow!("Service '{}' has no worker; pass --worker", args.name))?;

    let service = ServiceConfig {
        url,
        worker,
        processes: args.processes.or_else(|| base.and_then(|s| s.processes)),
        mode: args
            .mode
            .map(BackendMode::from)
            .or_else(|| base.map(|s| s.mode))
            .unwrap_or_default(),
        conf: args.conf.clone().or_else(|| base.and_then(|s| s.conf.clone())),
    };
    service.validate(&args.name).map_err(|e| anyhow::anyhow!(e))?;
    Ok(service.to_spec(&args.name, &config.gateway))
}

fn conf_path(config: &Config, name: &str) -> PathBuf {
    match config.services.get(name) {
        Some(service) => service.to_spec(name, &config.gateway).conf,
        None => config.gateway.conf_path_for(name),
    }
}

fn wait_probe(config: &Config, args: &WaitArgs) -> anyhow::Result<Probe> {
    if let Some(addr) = &args.tcp {
        return Ok(Probe::Tcp(addr.clone()));
    }
    if let Some(path) = &args.unix {
        return Ok(Probe::Unix(path.clone()));
    }
    if let Some(addr) = &args.http {
        return Ok(Probe::Http {
            addr: addr.clone(),
            path: args.path.clone(),
        });
    }
    let Some(name) = &args.name else {
        anyhow::bail!("Nothing to wait for: pass a service name, --tcp, --unix or --http");
    };
    let conf = conf_path(config, name);
    let backend = GatewayConfig::load(&conf)?.backend().ok_or_else(|| {
        anyhow::anyhow!("{} does not name a socket or http-socket", conf.display())
    })?;
    Ok(Probe::for_backend(&backend))
}

/// A backend that never came up is reported, not fatal: the rest of the
/// deployment may still proceed.
fn wait_for_site(poller: &ReadinessPoller, site: &Site) -> anyhow::Result<()> {
    let Some(backend) = &site.backend else {
        return Ok(());
    };
    match poller.wait_for(&Probe::for_backend(backend)) {
        Ok(_) => Ok(()),
        Err(e) if e.is_recoverable() => {
            warn!(site = %site.name, error = %e, "Continuing without confirmed readiness");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
