use std::{env, path::PathBuf, process::ExitCode};

use anyhow::{Context, Result, bail};
use clap::{Arg, ArgAction, ArgMatches, Command, value_parser};
use corral_api::{ApiCredentials, RancherClient};
use corral_engine::{
    ComputeProvider, CorralError, DockerMachine, Lifecycle, LifecyclePolicies, PuppetApply, RancherAgents, RancherServer, puppet::DEFAULT_SOURCE_DIR, retry,
};
use corral_util::{
    CorralConfig, HandoffStore,
    config::debug_enabled,
    handoff::{HANDOFF_PATH_ENV, SERVER_ADDRESS_KEY},
    redact_sensitive,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

type Nodes = Lifecycle<DockerMachine>;

#[tokio::main]
async fn main() -> ExitCode {
    let debug = debug_enabled(env::var("DEBUG").ok().as_deref());
    init_tracing(debug);
    let matches = build_cli().get_matches();

    match run(&matches, debug) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            report(&error);
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter = env::var("RUST_LOG").unwrap_or_else(|_| default_level.into());
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_writer(std::io::stderr)
        .try_init();
}

fn report(error: &anyhow::Error) {
    eprintln!("error: {}", redact_sensitive(&format!("{error:#}")));
    if let Some(diagnostic) = error.downcast_ref::<CorralError>().and_then(CorralError::diagnostic)
        && !diagnostic.trim().is_empty()
    {
        eprintln!("--- last output ---\n{}", redact_sensitive(diagnostic.trim()));
    }
}

fn build_cli() -> Command {
    let server_or_agents = |name: &'static str| {
        Arg::new("target")
            .required(true)
            .value_parser([name, "server"])
            .help("Which part of the cluster to act on")
    };

    Command::new("corral")
        .about("Provision and tear down ephemeral Rancher test clusters")
        .version(env!("CARGO_PKG_VERSION"))
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(
            Command::new("name")
                .about("Print the deterministic node name for this run")
                .arg(server_or_agents("agent"))
                .arg(
                    Arg::new("index")
                        .long("index")
                        .value_parser(value_parser!(u32))
                        .default_value("0")
                        .help("Agent index"),
                ),
        )
        .subcommand(
            Command::new("provision")
                .about("Create nodes and start Rancher on them")
                .arg(server_or_agents("agents"))
                .arg(
                    Arg::new("count")
                        .long("count")
                        .value_parser(value_parser!(u32).range(1..))
                        .help("Number of agents (default: RANCHER_AGENT_COUNT)"),
                ),
        )
        .subcommand(
            Command::new("configure")
                .about("Configure a provisioned server and obtain an agent registration command")
                .arg(Arg::new("target").required(true).value_parser(["server"])),
        )
        .subcommand(
            Command::new("deprovision")
                .about("Remove nodes and their credentials")
                .arg(server_or_agents("agents"))
                .arg(
                    Arg::new("count")
                        .long("count")
                        .value_parser(value_parser!(u32).range(1..))
                        .help("Number of agents to remove (default: the most ever provisioned)"),
                )
                .arg(
                    Arg::new("missing-ok")
                        .long("missing-ok")
                        .action(ArgAction::SetTrue)
                        .help("Succeed when there is nothing to remove"),
                ),
        )
        .subcommand(
            Command::new("apply")
                .about("Run `puppet apply` on a manifest")
                .arg(Arg::new("manifest").required(true).value_parser(value_parser!(PathBuf)))
                .arg(
                    Arg::new("source-dir")
                        .long("source-dir")
                        .value_parser(value_parser!(PathBuf))
                        .default_value(DEFAULT_SOURCE_DIR)
                        .help("Directory holding the Puppetfile and local modules"),
                ),
        )
}

fn run(matches: &ArgMatches, debug: bool) -> Result<()> {
    match matches.subcommand() {
        Some(("apply", sub)) => {
            let manifest = sub.get_one::<PathBuf>("manifest").context("manifest is required")?;
            let source_dir = sub.get_one::<PathBuf>("source-dir").context("source dir has a default")?;
            let output = PuppetApply::new(source_dir, debug)
                .apply(manifest)
                .with_context(|| format!("puppet apply of {} failed", manifest.display()))?;
            print!("{}", output.stdout);
            Ok(())
        }
        Some((name, sub)) => {
            let config = CorralConfig::from_env().context("invalid environment")?;
            let target = sub.get_one::<String>("target").map(String::as_str).unwrap_or_default();
            run_cluster_command(&config, name, target, sub)
        }
        None => bail!("a subcommand is required"),
    }
}

fn run_cluster_command(config: &CorralConfig, command: &str, target: &str, sub: &ArgMatches) -> Result<()> {
    if command == "name" {
        let name = match target {
            "server" => config.server_name(),
            _ => config.agent_name(sub.get_one::<u32>("index").copied().unwrap_or_default()),
        };
        println!("{name}");
        return Ok(());
    }

    let lifecycle = Lifecycle::new(
        DockerMachine::new(config.docker_machine.clone(), &config.aws),
        LifecyclePolicies::from_timeouts(&config.timeouts),
    );
    let handoff = HandoffStore::open(env::var_os(HANDOFF_PATH_ENV).map(PathBuf::from)).context("could not open handoff file")?;
    let server = RancherServer::new(config, &lifecycle, &handoff);
    let agents = RancherAgents::new(config, &lifecycle, &handoff);

    match (command, target) {
        ("provision", "server") => {
            let address = server.provision().context("provisioning the Rancher server failed")?;
            server.wait_until_ready(&connect(config, &address)?)?;
            info!(%address, "rancher/server is ready");
            println!("{address}");
        }
        ("configure", "server") => {
            let address = server_address(config, &lifecycle, &handoff)?;
            let api = connect(config, &address)?;
            server.wait_until_ready(&api)?;
            let registration = server.configure(&api, &address).context("configuring the Rancher server failed")?;
            println!("{}", registration.project_id);
        }
        ("provision", _) => {
            let count = sub.get_one::<u32>("count").copied().unwrap_or(config.rancher.agent_count);
            let address = server_address(config, &lifecycle, &handoff)?;
            let api = connect(config, &address)?;
            let registration = server.registration(&api)?;
            let active = agents
                .provision(&api, &registration, count)
                .context("provisioning Rancher agents failed")?;
            info!(active, "agents are active");
        }
        ("deprovision", "server") => {
            let missing_ok = sub.get_flag("missing-ok");
            let teardown = server.deprovision(missing_ok).context("deprovisioning the Rancher server failed")?;
            info!(?teardown, "server deprovisioned");
        }
        ("deprovision", _) => {
            let missing_ok = sub.get_flag("missing-ok");
            let count = sub.get_one::<u32>("count").copied();
            agents
                .deprovision(|address| connect(config, address), count, missing_ok)
                .context("deprovisioning Rancher agents failed")?;
        }
        (command, target) => bail!("unsupported command: {command} {target}"),
    }
    Ok(())
}

fn credentials(config: &CorralConfig) -> Option<ApiCredentials> {
    match (&config.rancher.access_key, &config.rancher.secret_key) {
        (Some(access_key), Some(secret_key)) => Some(ApiCredentials {
            access_key: access_key.clone(),
            secret_key: secret_key.clone(),
        }),
        _ => None,
    }
}

fn connect(config: &CorralConfig, address: &str) -> Result<RancherClient, CorralError> {
    RancherClient::for_server(address, config.rancher.port, credentials(config))
        .map_err(|error| CorralError::Configuration(error.to_string()))
}

/// Address recorded by `provision server`, or asked from the provider.
fn server_address(config: &CorralConfig, lifecycle: &Nodes, handoff: &HandoffStore) -> Result<String, CorralError> {
    if let Some(address) = handoff.get(SERVER_ADDRESS_KEY) {
        return Ok(address);
    }
    let name = config.server_name().to_string();
    let policy = config.timeouts.command_policy();
    retry(&format!("resolve address of {name}"), &policy, || lifecycle.provider().address(&name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_tree_is_well_formed() {
        build_cli().debug_assert();
    }

    #[test]
    fn parses_deprovision_flags() {
        let matches = build_cli()
            .try_get_matches_from(["corral", "deprovision", "agents", "--missing-ok"])
            .unwrap();
        let (name, sub) = matches.subcommand().unwrap();
        assert_eq!(name, "deprovision");
        assert_eq!(sub.get_one::<String>("target").map(String::as_str), Some("agents"));
        assert!(sub.get_flag("missing-ok"));
    }

    #[test]
    fn deprovision_accepts_an_agent_count() {
        let matches = build_cli()
            .try_get_matches_from(["corral", "deprovision", "agents", "--count", "5"])
            .unwrap();
        let (_, sub) = matches.subcommand().unwrap();
        assert_eq!(sub.get_one::<u32>("count"), Some(&5));
        assert!(!sub.get_flag("missing-ok"));
    }

    #[test]
    fn rejects_unknown_targets_and_zero_counts() {
        assert!(build_cli().try_get_matches_from(["corral", "provision", "cluster"]).is_err());
        assert!(
            build_cli()
                .try_get_matches_from(["corral", "provision", "agents", "--count", "0"])
                .is_err()
        );
        assert!(build_cli().try_get_matches_from(["corral", "configure", "agents"]).is_err());
    }

    #[test]
    fn apply_defaults_the_source_dir() {
        let matches = build_cli().try_get_matches_from(["corral", "apply", "site.pp"]).unwrap();
        let (_, sub) = matches.subcommand().unwrap();
        assert_eq!(sub.get_one::<PathBuf>("source-dir"), Some(&PathBuf::from(DEFAULT_SOURCE_DIR)));
    }

    #[test]
    fn credentials_need_both_keys() {
        let mut config = CorralConfig::from_lookup(|name| {
            (name.starts_with("AWS_")
                || (name.starts_with("RANCHER_") && name != "RANCHER_AGENT_COUNT" && name != "RANCHER_SERVER_PORT"))
                .then(|| "x".to_string())
        })
        .unwrap();
        assert!(credentials(&config).is_some());

        config.rancher.secret_key = None;
        assert!(credentials(&config).is_none());
    }
}
