use std::sync::Arc;
use std::time::SystemTime;

use anyhow::{bail, Context};
use clap::Parser;
use tracing::{error, info};

use tunwire::cli::{Cli, TopCommand};
use tunwire::config::{session_path, AppConfig};
use tunwire::http::{self, HttpUnzipper};
use tunwire::logging;
use tunwire::models::SelectionSpec;
use tunwire::netlink::{LinkKind, MemoryNetLinker, NetLinker, RtNetlink};
use tunwire::provider::{LogWarner, ProviderId, Registry};
use tunwire::routing::{RoutingConfigurator, SessionRecord, SetupParams};
use tunwire::storage::{CatalogStore, Storage};

fn main() {
    let cli = Cli::parse();

    if let Some(path) = &cli.log_file {
        if let Err(e) = logging::init_file(path, cli.verbose) {
            eprintln!("failed to open log file {}: {}", path, e);
            std::process::exit(1);
        }
    } else {
        logging::init_terminal(cli.verbose);
    }

    let result = AppConfig::load()
        .context("failed to load config")
        .and_then(|config| run(cli.command, config));
    if let Err(e) = result {
        error!(error = ?e.to_string(), "command_failed");
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run(command: TopCommand, config: AppConfig) -> anyhow::Result<()> {
    match command {
        TopCommand::Providers => {
            for id in ProviderId::ALL {
                println!("{}", id);
            }
            Ok(())
        }
        TopCommand::Servers { provider, filters } => {
            let store = CatalogStore::load()?;
            let servers = store.filter_servers(provider, &SelectionSpec::from(filters))?;
            if servers.is_empty() {
                println!("No {} servers match. Run `tunwire update {}` to fetch the catalog.", provider, provider);
            }
            for server in &servers {
                println!("{}", server);
            }
            Ok(())
        }
        TopCommand::Select {
            provider,
            name,
            filters,
        } => {
            let registry = build_registry(&config)?;
            let provider = registry.get(provider);
            let server = match name {
                Some(name) => provider.select_server_by_name(&name)?,
                None => provider.select_server(&SelectionSpec::from(filters))?,
            };
            println!("{}", server);
            if let Some(endpoint) = server.endpoint() {
                println!("endpoint: {}", endpoint);
            }
            if let Some(key) = &server.wg_public_key {
                println!("wireguard public key: {}", key);
            }
            Ok(())
        }
        TopCommand::Update { provider } => {
            let registry = build_registry(&config)?;
            match provider {
                Some(id) => {
                    let count = registry.get(id).update_servers()?;
                    println!("{}: {} servers", id, count);
                }
                None => {
                    let refreshed = registry.update_all();
                    println!("{} provider catalogs refreshed", refreshed);
                }
            }
            Ok(())
        }
        TopCommand::Up {
            interface,
            address,
            endpoint,
            excluded,
            routed,
            create,
            dry_run,
        } => {
            let link_name = interface.unwrap_or_else(|| config.interface.clone());
            let params = SetupParams {
                link_name,
                assigned: address,
                server_endpoint: endpoint,
                excluded: config
                    .excluded_subnets
                    .iter()
                    .copied()
                    .chain(excluded)
                    .collect(),
                routed,
            };
            if dry_run {
                cmd_up_dry_run(&config, &params, create)
            } else {
                cmd_up(&config, &params, create)
            }
        }
        TopCommand::Down { dry_run } => cmd_down(&config, dry_run),
    }
}

fn build_registry(config: &AppConfig) -> anyhow::Result<Registry> {
    let client = http::client(&config.http)?;
    let store = CatalogStore::load()?;
    Ok(Registry::new(
        Arc::new(store),
        SystemTime::now,
        Arc::new(LogWarner),
        client.clone(),
        Arc::new(HttpUnzipper::new(client)),
    ))
}

fn cmd_up(config: &AppConfig, params: &SetupParams, create: bool) -> anyhow::Result<()> {
    if let Some(active) = SessionRecord::load()? {
        if !active.is_empty() {
            bail!(
                "routing for {} is already installed; run `tunwire down` first",
                active.link_name.as_deref().unwrap_or("a previous tunnel")
            );
        }
    }

    let configurator = RoutingConfigurator::new(RtNetlink::new(), config.routing)?;
    if create {
        configurator
            .create_link(&params.link_name, &LinkKind::wireguard())
            .with_context(|| format!("failed to create link {}", params.link_name))?;
    }
    let session = configurator
        .setup_recorded(params, &session_path())
        .context("failed to install tunnel routing")?;
    info!(interface = %params.link_name, objects = session.installed.len(), "routing_up");
    println!(
        "Routing through {} (table {}, {} objects installed)",
        params.link_name,
        config.routing.table,
        session.installed.len()
    );
    Ok(())
}

fn cmd_up_dry_run(config: &AppConfig, params: &SetupParams, create: bool) -> anyhow::Result<()> {
    let linker = Arc::new(MemoryNetLinker::with_host_defaults());
    let configurator = RoutingConfigurator::new(Arc::clone(&linker), config.routing)?;
    if create {
        configurator.create_link(&params.link_name, &LinkKind::wireguard())?;
    } else {
        linker.insert_link(&params.link_name, LinkKind::wireguard(), false);
    }
    configurator.setup(params)?;
    for entry in linker.journal() {
        println!("{}", entry);
    }
    Ok(())
}

fn cmd_down(config: &AppConfig, dry_run: bool) -> anyhow::Result<()> {
    let Some(record) = SessionRecord::load()? else {
        println!("No routing session recorded.");
        return Ok(());
    };
    if dry_run {
        for object in record.installed.iter().rev() {
            println!("remove {}", object);
        }
        if let Some(link) = &record.owned_link {
            println!("delete link {}", link.name);
        }
        return Ok(());
    }

    let configurator = RoutingConfigurator::with_session(RtNetlink::new(), config.routing, record)?;
    teardown_and_forget(&configurator)
}

fn teardown_and_forget<N: NetLinker>(configurator: &RoutingConfigurator<N>) -> anyhow::Result<()> {
    match configurator.teardown() {
        Ok(()) => {
            SessionRecord::remove()?;
            println!("Tunnel routing removed.");
            Ok(())
        }
        Err(e) => {
            // Keep what is left so the next `down` retries it.
            configurator.session().save()?;
            Err(e).context("teardown incomplete; run `tunwire down` again")
        }
    }
}
