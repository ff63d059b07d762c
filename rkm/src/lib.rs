pub mod address;
pub mod backend_set;
pub mod cli;
pub mod config;
pub mod error;
pub mod logging;
pub mod master;
pub mod publisher;
pub mod role;
pub mod supervisor;
pub mod transport;
