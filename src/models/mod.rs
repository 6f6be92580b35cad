pub mod server;

pub use server::{Protocol, SelectionSpec, Server};
