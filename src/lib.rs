// tunwire library crate
//
// Server selection across VPN providers and policy routing around a tunnel
// link. The binary in main.rs is a thin driver over these modules.

// Provider-agnostic infrastructure
pub mod cli;
pub mod config;
pub mod error;
pub mod http;
pub mod logging;

// Catalog model and storage
pub mod models;
pub mod storage;

// Provider registry, selection and catalog updaters
pub mod provider;

// Route primitives (rtnetlink on Linux, stub elsewhere) and the configurator
pub mod netlink;
pub mod routing;
