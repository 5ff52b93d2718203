//! Stratus CLI - create, inspect and destroy single-node deployments

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use stratus::api::{ApplicationApi, ApplicationSubmission, SubmitterConnector};
use stratus::artifact::ScpArtifactRetriever;
use stratus::config::{ensure_dir, resolve_home, StratusConfig};
use stratus::deploy::{AnsibleRunner, PlaybookBundle, ENABLE_OCCOPUS, ENABLE_TERRAFORM};
use stratus::probe::TcpReadinessProbe;
use stratus::provider::{
    Backend, OpenStackBackend, OpenStackConfig, OpenStackCredentials, StaticBackend,
};
use stratus::remote::{
    KnownHostsFile, OpenSshClient, RemoteAccessManager, RemoteShell, SshIdentity, SshKeyPair,
};
use stratus::{
    ClusterRecord, ClusterStateStore, Components, CreateOptions, Credential,
    LifecycleOrchestrator, PipelineSettings,
};

/// Stratus - provision a node, deploy onto it, and manage what was deployed
#[derive(Parser, Debug)]
#[command(name = "stratus", version, about, long_about = None)]
struct Cli {
    /// Home directory (defaults to $STRATUS_HOME, then ~/.stratus)
    #[arg(long, global = true)]
    home: Option<PathBuf>,

    /// Also append logs to <home>/stratus.log
    #[arg(long, global = true)]
    log_file: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Provision a node and deploy onto it
    Create(CreateArgs),

    /// Remove applications, delete the node and forget the cluster
    Destroy {
        /// Cluster id
        id: String,
    },

    /// List recorded clusters
    List,

    /// Show one cluster record (without secrets)
    Show {
        /// Cluster id
        id: String,
    },

    /// List (or remove) applications running on a cluster
    Apps {
        /// Cluster id
        id: String,

        /// Force-delete every application instead of listing them
        #[arg(long)]
        delete_all: bool,
    },

    /// Submit an application description to a cluster
    Deploy(DeployArgs),
}

#[derive(Args, Debug)]
struct DeployArgs {
    /// Cluster id
    id: String,

    /// Application id (assigned by the cluster if omitted)
    #[arg(long)]
    app_id: Option<String>,

    /// Application description template file (YAML)
    #[arg(long, required_unless_present = "url", conflicts_with = "url")]
    adt: Option<PathBuf>,

    /// URL of an application description template
    #[arg(long)]
    url: Option<String>,

    /// Template input, as KEY=VALUE (VALUE is parsed as YAML)
    #[arg(long = "param", value_parser = parse_var)]
    params: Vec<(String, serde_yaml::Value)>,

    /// Validate and translate without running any component
    #[arg(long)]
    dry_run: bool,
}

#[derive(Args, Debug)]
struct CreateArgs {
    /// Node name (generated if omitted)
    #[arg(long, global = true)]
    name: Option<String>,

    /// API login name
    #[arg(long = "user", global = true, default_value = stratus::orchestrator::DEFAULT_API_USER)]
    username: String,

    /// API password (generated if omitted)
    #[arg(long, global = true, env = "STRATUS_API_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Enable the Terraform cloud orchestrator in the deployment
    #[arg(long, global = true)]
    terraform: bool,

    /// Enable the Occopus cloud orchestrator in the deployment
    #[arg(long, global = true)]
    occopus: bool,

    /// Extra deployment variable, as KEY=VALUE (VALUE is parsed as YAML)
    #[arg(long = "var", global = true, value_parser = parse_var)]
    vars: Vec<(String, serde_yaml::Value)>,

    #[command(subcommand)]
    provider: ProviderArgs,
}

#[derive(Subcommand, Debug)]
enum ProviderArgs {
    /// Boot a new server on OpenStack
    Openstack(OpenStackArgs),

    /// Deploy onto an existing host
    Static {
        /// Host address
        #[arg(long)]
        address: String,

        /// Id to record the cluster under (generated if omitted)
        #[arg(long)]
        id: Option<String>,
    },
}

#[derive(Args, Debug)]
struct OpenStackArgs {
    /// Image id
    #[arg(long)]
    image: String,

    /// Flavor id
    #[arg(long)]
    flavor: String,

    /// Network id
    #[arg(long)]
    network: String,

    /// Nova keypair name
    #[arg(long)]
    keypair: Option<String>,

    /// Security group name
    #[arg(long)]
    security_group: Option<String>,

    /// Region name
    #[arg(long)]
    region: Option<String>,

    /// Project id
    #[arg(long)]
    project_id: Option<String>,

    /// Keystone URL
    #[arg(long)]
    auth_url: Option<String>,

    /// User domain name
    #[arg(long)]
    domain: Option<String>,

    /// Compute endpoint override
    #[arg(long)]
    compute_url: Option<String>,

    /// Network endpoint override
    #[arg(long)]
    network_url: Option<String>,

    /// Credentials file (defaults to <home>/credentials-cloud.yaml)
    #[arg(long)]
    credentials: Option<PathBuf>,
}

impl From<&OpenStackArgs> for OpenStackConfig {
    fn from(args: &OpenStackArgs) -> Self {
        Self {
            image: args.image.clone(),
            flavor: args.flavor.clone(),
            network: args.network.clone(),
            keypair: args.keypair.clone(),
            security_group: args.security_group.clone(),
            region: args.region.clone(),
            project_id: args.project_id.clone(),
            auth_url: args.auth_url.clone(),
            domain: args.domain.clone(),
            compute_url: args.compute_url.clone(),
            network_url: args.network_url.clone(),
        }
    }
}

fn parse_var(s: &str) -> Result<(String, serde_yaml::Value), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got `{}`", s))?;
    if key.is_empty() {
        return Err("variable name is empty".to_string());
    }
    let value = serde_yaml::from_str(value).map_err(|e| format!("invalid value for {}: {}", key, e))?;
    Ok((key.to_string(), value))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let home = resolve_home(cli.home.as_deref())?;
    ensure_dir(&home)?;
    let config = StratusConfig::load(&home)?;

    init_tracing(&config, cli.log_file)?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping at the next stage boundary");
            on_signal.cancel();
        }
    });

    let store = ClusterStateStore::new(config.state_file());

    match cli.command {
        Commands::Create(args) => run_create(&config, store, args, cancel).await,
        Commands::Destroy { id } => run_destroy(&config, store, &id, cancel).await,
        Commands::List => run_list(&store),
        Commands::Show { id } => run_show(&store, &id),
        Commands::Apps { id, delete_all } => run_apps(&config, store, &id, delete_all, cancel).await,
        Commands::Deploy(args) => run_deploy(&config, store, args, cancel).await,
    }
}

/// Log to stderr, and optionally append to the home directory's log file
fn init_tracing(config: &StratusConfig, to_file: bool) -> anyhow::Result<()> {
    let file_layer = if to_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(config.log_file())
            .with_context(|| format!("failed to open {}", config.log_file().display()))?;
        Some(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();
    Ok(())
}

/// Build the production collaborators from configuration
fn components(config: &StratusConfig) -> Components {
    let shell: Arc<dyn RemoteShell> = Arc::new(OpenSshClient::new(
        config.known_hosts(),
        config.ssh_port,
        config.connect_timeout(),
    ));
    let identity = SshIdentity::new(&config.ssh_user, config.private_key());

    let bundle = PlaybookBundle::new(
        config.playbook_dir(&config.playbook_version),
        config.playbook_url(&config.playbook_version),
    );
    let mut runner = AnsibleRunner::new(
        bundle,
        &config.playbook_file,
        &config.ssh_user,
        config.private_key(),
        config.known_hosts(),
    );
    if config.cloud_credentials().exists() {
        runner = runner.with_cloud_credentials(config.cloud_credentials());
    }

    Components {
        probe: Arc::new(TcpReadinessProbe::new(config.connect_timeout())),
        remote: Arc::new(RemoteAccessManager::new(
            KnownHostsFile::new(config.known_hosts()),
            shell.clone(),
        )),
        runner: Arc::new(runner),
        retriever: Arc::new(ScpArtifactRetriever::new(
            shell,
            identity,
            &config.remote_cert_path,
            config.cert_dir(),
        )),
        connector: Arc::new(SubmitterConnector),
    }
}

/// Orchestrator able to tear down the cluster described by `record`
fn orchestrator_for(
    config: &StratusConfig,
    store: ClusterStateStore,
    record: &ClusterRecord,
    cancel: CancellationToken,
) -> anyhow::Result<LifecycleOrchestrator<Backend>> {
    let backend = Backend::from_params(
        &record.provider_params,
        &config.cloud_credentials(),
        config.server_active_policy,
    )?;
    Ok(LifecycleOrchestrator::new(
        backend,
        components(config),
        store,
        PipelineSettings::from_config(config, String::new()),
    )
    .with_cancellation(cancel))
}

async fn run_create(
    config: &StratusConfig,
    store: ClusterStateStore,
    args: CreateArgs,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let backend = match &args.provider {
        ProviderArgs::Openstack(os) => {
            let path = os.credentials.clone().unwrap_or_else(|| config.cloud_credentials());
            let credentials = OpenStackCredentials::load(&path)?;
            Backend::OpenStack(OpenStackBackend::new(
                os.into(),
                credentials,
                config.server_active_policy,
            )?)
        }
        ProviderArgs::Static { address, id } => {
            Backend::Static(StaticBackend::new(address.clone(), id.clone()))
        }
    };

    let public_key = SshKeyPair::at(config.private_key())
        .ensure()
        .await
        .context("failed to prepare the operator SSH key")?;

    let mut options = CreateOptions {
        name: args.name,
        username: args.username,
        password: args.password,
        ..Default::default()
    };
    options
        .extra_vars
        .insert(ENABLE_TERRAFORM.to_string(), args.terraform.into());
    options
        .extra_vars
        .insert(ENABLE_OCCOPUS.to_string(), args.occopus.into());
    options.extra_vars.extend(args.vars);

    let orchestrator = LifecycleOrchestrator::new(
        backend,
        components(config),
        store,
        PipelineSettings::from_config(config, public_key),
    )
    .with_cancellation(cancel);

    let report = orchestrator.create(&options).await?;
    let record = report.record;

    println!("Cluster {} is ready", record.id);
    println!("  address:  {}", record.address);
    println!("  endpoint: {}/{}", record.api_endpoint, record.api_version);
    println!("  cert:     {}", record.cert_path.display());
    if let Credential::Basic { username, password } = &record.credential {
        println!("  username: {}", username);
        if options.password.is_none() {
            println!("  password: {}", password);
        }
    }
    Ok(())
}

async fn run_destroy(
    config: &StratusConfig,
    store: ClusterStateStore,
    id: &str,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let record = store.get(id)?;
    let orchestrator = orchestrator_for(config, store, &record, cancel)?;
    orchestrator.destroy(id).await?;
    println!("Cluster {} destroyed", id);
    Ok(())
}

fn run_list(store: &ClusterStateStore) -> anyhow::Result<()> {
    let records = store.list()?;
    if records.is_empty() {
        println!("No clusters");
        return Ok(());
    }
    println!("{:<36}  {:<16}  {:<10}  ENDPOINT", "ID", "ADDRESS", "PROVIDER");
    for record in records {
        println!(
            "{:<36}  {:<16}  {:<10}  {}",
            record.id,
            record.address,
            record
                .provider_params
                .get(stratus::provider::PROVIDER_PARAM)
                .map(String::as_str)
                .unwrap_or("-"),
            record.api_endpoint
        );
    }
    Ok(())
}

fn run_show(store: &ClusterStateStore, id: &str) -> anyhow::Result<()> {
    let record = store.get(id)?;
    println!("id:          {}", record.id);
    println!("address:     {}", record.address);
    println!("endpoint:    {}", record.api_endpoint);
    println!("api version: {}", record.api_version);
    println!("certificate: {}", record.cert_path.display());
    match &record.credential {
        Credential::Basic { username, .. } => println!("credential:  basic ({})", username),
        Credential::Token { .. } => println!("credential:  token"),
    }
    for (key, value) in &record.provider_params {
        println!("param:       {}={}", key, value);
    }
    Ok(())
}

async fn run_apps(
    config: &StratusConfig,
    store: ClusterStateStore,
    id: &str,
    delete_all: bool,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let record = store.get(id)?;
    let api: Arc<dyn ApplicationApi> = orchestrator_for(config, store, &record, cancel)?.attach(id)?;

    if delete_all {
        let count = api.destroy_all().await?;
        info!(cluster = %id, count, "Applications deleted");
        println!("Deleted {} application(s)", count);
        return Ok(());
    }

    let apps = api.applications().await?;
    if apps.is_empty() {
        println!("No applications");
    }
    for app in apps {
        println!("{}", app);
    }
    Ok(())
}

async fn run_deploy(
    config: &StratusConfig,
    store: ClusterStateStore,
    args: DeployArgs,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let submission = submission_from(&args)?;
    let record = store.get(&args.id)?;
    let api = orchestrator_for(config, store, &record, cancel)?.attach(&args.id)?;

    let response = api.submit(&submission).await?;
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}

fn submission_from(args: &DeployArgs) -> anyhow::Result<ApplicationSubmission> {
    let adt = match &args.adt {
        Some(path) => {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let yaml: serde_yaml::Value = serde_yaml::from_str(&content)
                .with_context(|| format!("invalid YAML in {}", path.display()))?;
            Some(serde_json::to_value(yaml)?)
        }
        None => None,
    };
    let mut params = BTreeMap::new();
    for (key, value) in &args.params {
        params.insert(key.clone(), serde_json::to_value(value)?);
    }

    Ok(ApplicationSubmission {
        app_id: args.app_id.clone(),
        adt,
        url: args.url.clone(),
        params,
        dryrun: args.dry_run,
    })
}
