use std::net::IpAddr;

use clap::{Args, Parser, Subcommand};
use ipnet::IpNet;

use crate::models::{Protocol, SelectionSpec};
use crate::provider::ProviderId;

#[derive(Parser)]
#[command(
    name = "tunwire",
    about = "VPN server selection and tunnel routing",
    version = env!("TUNWIRE_BUILD_VERSION")
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: TopCommand,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Write logs to this file instead of the terminal
    #[arg(long, global = true)]
    pub log_file: Option<String>,
}

#[derive(Subcommand)]
pub enum TopCommand {
    /// List known providers
    Providers,

    /// List catalog servers of a provider
    Servers {
        provider: ProviderId,

        #[command(flatten)]
        filters: Filters,
    },

    /// Pick one server the way a connection would
    Select {
        provider: ProviderId,

        /// Exact server name instead of a random match
        #[arg(long, conflicts_with_all = ["region", "country", "city", "hostname", "protocol", "tag"])]
        name: Option<String>,

        #[command(flatten)]
        filters: Filters,
    },

    /// Refresh server catalogs from the providers
    Update {
        /// Only this provider (default: every provider with an updater)
        provider: Option<ProviderId>,
    },

    /// Route traffic through an existing tunnel link
    Up {
        /// Tunnel link name (default from config)
        #[arg(short, long)]
        interface: Option<String>,

        /// Address assigned to the tunnel, e.g. 10.64.0.2/32
        #[arg(short, long)]
        address: IpNet,

        /// VPN server address; kept off the tunnel
        #[arg(short, long)]
        endpoint: IpAddr,

        /// Destination kept off the tunnel (repeatable)
        #[arg(long = "exclude")]
        excluded: Vec<IpNet>,

        /// Only route this destination through the tunnel (repeatable)
        #[arg(long = "route")]
        routed: Vec<IpNet>,

        /// Create a WireGuard link with this name and delete it on `down`
        #[arg(long)]
        create: bool,

        /// Run against an in-memory routing stack and print the operations
        #[arg(long)]
        dry_run: bool,
    },

    /// Remove the routing installed by `up`
    Down {
        /// Print what would be removed without touching the host
        #[arg(long)]
        dry_run: bool,
    },
}

#[derive(Args, Debug, Default)]
pub struct Filters {
    /// Region (repeatable)
    #[arg(long)]
    pub region: Vec<String>,

    /// Country name or code (repeatable)
    #[arg(short, long)]
    pub country: Vec<String>,

    /// City (repeatable)
    #[arg(long)]
    pub city: Vec<String>,

    /// Hostname (repeatable); the custom provider takes exactly one
    #[arg(long)]
    pub hostname: Vec<String>,

    /// openvpn-udp, openvpn-tcp or wireguard (repeatable)
    #[arg(short, long)]
    pub protocol: Vec<Protocol>,

    /// Required tag such as p2p or streaming (repeatable)
    #[arg(short, long)]
    pub tag: Vec<String>,
}

impl From<Filters> for SelectionSpec {
    fn from(f: Filters) -> Self {
        SelectionSpec {
            regions: f.region.into_iter().collect(),
            countries: f.country.into_iter().collect(),
            cities: f.city.into_iter().collect(),
            hostnames: f.hostname.into_iter().collect(),
            names: Default::default(),
            protocols: f.protocol.into_iter().collect(),
            tags: f.tag.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_select_filters() {
        let cli = Cli::parse_from([
            "tunwire", "select", "mullvad", "-c", "SE", "-c", "CH", "-p", "wireguard", "-t", "owned",
        ]);
        let TopCommand::Select { provider, name, filters } = cli.command else {
            panic!("expected select");
        };
        assert_eq!(provider, ProviderId::Mullvad);
        assert!(name.is_none());
        let spec = SelectionSpec::from(filters);
        assert_eq!(spec.countries.len(), 2);
        assert!(spec.protocols.contains(&Protocol::WireGuard));
        assert!(spec.tags.contains("owned"));
    }

    #[test]
    fn test_unknown_provider_rejected() {
        assert!(Cli::try_parse_from(["tunwire", "servers", "examplevpn"]).is_err());
    }

    #[test]
    fn test_parse_up() {
        let cli = Cli::parse_from([
            "tunwire", "up", "-a", "10.64.0.2/32", "-e", "198.51.100.7", "--exclude", "192.168.0.0/16",
            "--dry-run",
        ]);
        let TopCommand::Up { interface, address, excluded, dry_run, .. } = cli.command else {
            panic!("expected up");
        };
        assert!(interface.is_none());
        assert_eq!(address.prefix_len(), 32);
        assert_eq!(excluded.len(), 1);
        assert!(dry_run);
    }
}
