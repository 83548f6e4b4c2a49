use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::Result;
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use k8test_core::{DeployedImage, ExposeStrategy, ResourceIdentity, SingletonStrategy};
use k8test_graph::{calculate_packages_hash, GitTree, PackageGraph};
use k8test_kubehub::{ClusterApis, KubeCluster};
use k8test_ops::{delete_namespace, ensure_namespace, grant_admin_role, tcp_readiness, ContainerOptions, Orchestrator, OrchestratorConfig, SubscribeRequest, UnsubscribeRequest, Unsubscribed};
use k8test_publish::cli::{DockerCli, NpmCli, NpmScripts};
use k8test_publish::{PackagePlan, PublishDecision, PublishOptions, PublishReport, Publisher};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "k8testctl", version, about = "k8test CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Expose {
    UserMachine,
    InsideCluster,
}

impl From<Expose> for ExposeStrategy {
    fn from(e: Expose) -> Self {
        match e {
            Expose::UserMachine => ExposeStrategy::UserMachine,
            Expose::InsideCluster => ExposeStrategy::InsideCluster,
        }
    }
}

#[derive(Args, Debug)]
struct IdentityArgs {
    /// Application id owning the resources
    #[arg(long = "app-id", env = "K8TEST_APP_ID")]
    app_id: String,
    /// Namespace the image runs in
    #[arg(long = "ns", env = "K8TEST_NAMESPACE")]
    namespace: String,
    /// many | appId | namespace
    #[arg(long = "strategy", default_value = "appId")]
    strategy: SingletonStrategy,
    /// Image to run
    image: String,
}

impl IdentityArgs {
    fn identity(&self) -> ResourceIdentity {
        ResourceIdentity::new(&self.app_id, &self.image, &self.namespace, self.strategy)
    }
}

#[derive(Args, Debug)]
struct RepoArgs {
    /// Repository root (a git work tree)
    #[arg(long = "root", default_value = ".")]
    root: PathBuf,
    /// Package directories relative to the root; discovered from `workspaces` when omitted
    #[arg(long = "package")]
    packages: Vec<String>,
}

impl RepoArgs {
    async fn graph(&self) -> Result<PackageGraph> {
        let tree = GitTree::new(&self.root);
        let paths = (!self.packages.is_empty()).then_some(&self.packages[..]);
        calculate_packages_hash(&tree, paths).await
    }
}

#[derive(Args, Debug)]
struct RegistryArgs {
    #[arg(long = "npm-registry", env = "K8TEST_NPM_REGISTRY", default_value = "https://registry.npmjs.org")]
    npm_registry: String,
    #[arg(long = "npm-token", env = "K8TEST_NPM_TOKEN", hide_env_values = true)]
    npm_token: Option<String>,
    #[arg(long = "docker-registry", env = "K8TEST_DOCKER_REGISTRY", default_value = "docker.io")]
    docker_registry: String,
    #[arg(long = "docker-username", env = "K8TEST_DOCKER_USERNAME")]
    docker_username: Option<String>,
    #[arg(long = "docker-password", env = "K8TEST_DOCKER_PASSWORD", hide_env_values = true)]
    docker_password: Option<String>,
    /// Skip TLS certificate checks when inspecting the docker registry.
    #[arg(long = "docker-insecure", env = "K8TEST_DOCKER_INSECURE")]
    docker_insecure: bool,
}

impl RegistryArgs {
    fn publisher(&self, options: PublishOptions) -> Publisher {
        let mut docker = DockerCli::new(&self.docker_registry, self.docker_username.clone(), self.docker_password.clone());
        if self.docker_insecure {
            docker = docker.with_tls_verify(false);
        }
        Publisher::new(
            Arc::new(NpmCli::new(&self.npm_registry, self.npm_token.clone())),
            Arc::new(docker),
            Arc::new(NpmScripts),
            options,
        )
    }
}

#[derive(Subcommand, Debug)]
enum NamespaceCommand {
    /// Create the namespace, or adopt it if it exists
    Ensure { name: String },
    /// Delete the namespace and wait until it is gone
    Delete { name: String },
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Deploy an image (or join an existing deployment) and print where to reach it
    Subscribe {
        #[command(flatten)]
        id: IdentityArgs,
        /// Container port to expose
        #[arg(long = "port")]
        port: i32,
        #[arg(long = "expose", value_enum, default_value_t = Expose::UserMachine)]
        expose: Expose,
        /// Container env, KEY=VALUE (repeatable)
        #[arg(long = "env", value_parser = parse_env)]
        env: Vec<(String, String)>,
        /// Wait until the address accepts TCP connections
        #[arg(long = "wait-tcp", action = ArgAction::SetTrue)]
        wait_tcp: bool,
    },
    /// Drop one subscription; the last one deletes the deployment and service
    Unsubscribe {
        #[command(flatten)]
        id: IdentityArgs,
        #[arg(long = "deployment")]
        deployment: String,
        #[arg(long = "service")]
        service: String,
    },
    /// Namespace provisioning
    #[command(subcommand)]
    Namespace(NamespaceCommand),
    /// Grant a service account admin rights inside a namespace
    GrantAdmin {
        #[arg(long = "ns", env = "K8TEST_NAMESPACE")]
        namespace: String,
        #[arg(long = "service-account", default_value = "default")]
        service_account: String,
    },
    /// Print every package with its content hash, leaves first
    Hash {
        #[command(flatten)]
        repo: RepoArgs,
    },
    /// Print what a publish would do
    Plan {
        #[command(flatten)]
        repo: RepoArgs,
        #[command(flatten)]
        registries: RegistryArgs,
    },
    /// Test, build and publish every package whose content changed
    Publish {
        #[command(flatten)]
        repo: RepoArgs,
        #[command(flatten)]
        registries: RegistryArgs,
        #[arg(long = "dry-run", action = ArgAction::SetTrue)]
        dry_run: bool,
        /// Publish and push; without it images are built and nothing leaves the machine
        #[arg(long = "master-build", action = ArgAction::SetTrue)]
        master_build: bool,
        #[arg(long = "skip-tests", action = ArgAction::SetTrue)]
        skip_tests: bool,
    },
}

fn parse_env(s: &str) -> Result<(String, String), String> {
    s.split_once('=').map(|(k, v)| (k.to_string(), v.to_string())).ok_or_else(|| format!("expected KEY=VALUE, got {}", s))
}

fn init_tracing() {
    let env = std::env::var("K8TEST_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("K8TEST_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid K8TEST_METRICS_ADDR; expected host:port");
        }
    }
}

async fn connect() -> Result<Arc<dyn ClusterApis>> {
    let config = OrchestratorConfig::from_env();
    Ok(Arc::new(KubeCluster::connect(config.watch).await?))
}

/// Cancelled on Ctrl-C.
fn ctrl_c_token() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received; cancelling");
            child.cancel();
        }
    });
    token
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_image(output: Output, image: &DeployedImage) -> Result<()> {
    match output {
        Output::Human => {
            println!("deployment: {}", image.deployment_name);
            println!("service:    {}", image.service_name);
            println!("image:      {}", image.deployed_image_url);
            println!("address:    {}:{}", image.deployed_image_address, image.deployed_image_port);
            Ok(())
        }
        Output::Json => print_json(image),
    }
}

fn print_plans(output: Output, plans: &[PackagePlan]) -> Result<()> {
    if output == Output::Json {
        return print_json(&plans);
    }
    println!("{:<30} {:<7} {}", "PACKAGE", "TARGET", "STATUS");
    for plan in plans {
        if plan.targets.is_empty() {
            println!("{:<30} {:<7} no targets", plan.name, "-");
        }
        for target in &plan.targets {
            let status = match &target.decision {
                PublishDecision::Publish { new_version, latest_published_version: Some(latest) } => format!("publish {} (latest {})", new_version, latest.version),
                PublishDecision::Publish { new_version, latest_published_version: None } => format!("publish {}", new_version),
                PublishDecision::UpToDate { latest_published_version } => format!("up to date ({})", latest_published_version.version),
            };
            println!("{:<30} {:<7} {}", plan.name, target.target_type, status);
        }
    }
    Ok(())
}

fn print_report(output: Output, report: &PublishReport) -> Result<()> {
    if output == Output::Json {
        return print_json(report);
    }
    if report.outcomes.is_empty() {
        return print_plans(output, &report.plans);
    }
    for o in &report.outcomes {
        println!("{:<30} {:<7} {:<10} {:?}", o.name, o.target_type, o.version, o.action);
    }
    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let output = cli.output;
    match cli.command {
        Commands::Subscribe { id, port, expose, env, wait_tcp } => {
            info!(image = %id.image, ns = %id.namespace, strategy = %id.strategy, "subscribe invoked");
            let orchestrator = Orchestrator::new(connect().await?, OrchestratorConfig::from_env());
            let mut req = SubscribeRequest::new(id.identity(), port, expose.into());
            req.container_options = ContainerOptions { env: env.into_iter().collect::<BTreeMap<_, _>>(), ..Default::default() };
            if wait_tcp {
                req.readiness = Some(tcp_readiness());
            }
            req.cancel = ctrl_c_token();
            let image = orchestrator.subscribe(req).await?;
            print_image(output, &image)?;
        }
        Commands::Unsubscribe { id, deployment, service } => {
            info!(image = %id.image, ns = %id.namespace, deployment = %deployment, "unsubscribe invoked");
            let orchestrator = Orchestrator::new(connect().await?, OrchestratorConfig::from_env());
            let req = UnsubscribeRequest { identity: id.identity(), deployment_name: deployment, service_name: service };
            let outcome = orchestrator.unsubscribe(&req).await?;
            match output {
                Output::Human => match outcome {
                    Unsubscribed::Kept => println!("kept (namespace singleton)"),
                    Unsubscribed::Remaining(n) => println!("{} subscription(s) remain", n),
                    Unsubscribed::Deleted => println!("deleted {} and {}", req.deployment_name, req.service_name),
                },
                Output::Json => print_json(&outcome)?,
            }
        }
        Commands::Namespace(NamespaceCommand::Ensure { name }) => {
            let cluster = connect().await?;
            let ns = ensure_namespace(cluster.as_ref(), &name).await?;
            match output {
                Output::Human => println!("{} {}", name, if ns.is_new_resource { "created" } else { "exists" }),
                Output::Json => print_json(&serde_json::json!({ "name": name, "isNewResource": ns.is_new_resource }))?,
            }
        }
        Commands::Namespace(NamespaceCommand::Delete { name }) => {
            let cluster = connect().await?;
            delete_namespace(cluster.as_ref(), &name).await?;
            if output == Output::Human {
                println!("{} deleted", name);
            }
        }
        Commands::GrantAdmin { namespace, service_account } => {
            let cluster = connect().await?;
            let binding = grant_admin_role(cluster.as_ref(), &namespace, &service_account).await?;
            match output {
                Output::Human => println!("{} bound in {}", binding, namespace),
                Output::Json => print_json(&serde_json::json!({ "namespace": namespace, "roleBinding": binding }))?,
            }
        }
        Commands::Hash { repo } => {
            let graph = repo.graph().await?;
            match output {
                Output::Human => {
                    println!("root files: {}", graph.root_files_hash);
                    for node in &graph.nodes {
                        println!("{:<30} {:<30} {}", node.relative_path, node.name(), node.package_hash);
                    }
                }
                Output::Json => print_json(&graph)?,
            }
        }
        Commands::Plan { repo, registries } => {
            let graph = repo.graph().await?;
            let plans = registries.publisher(PublishOptions::default()).plan(&graph).await?;
            print_plans(output, &plans)?;
        }
        Commands::Publish { repo, registries, dry_run, master_build, skip_tests } => {
            if master_build && registries.npm_token.is_none() {
                warn!("no npm token; npm publishing will fail if anything needs it");
            }
            let graph = repo.graph().await?;
            let options = PublishOptions { dry_run, master_build, skip_tests };
            let report = registries.publisher(options).run(&graph).await?;
            print_report(output, &report)?;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        error!(error = ?e, "command failed");
        eprintln!("error: {:#}", e);
        std::process::exit(1);
    }
}
