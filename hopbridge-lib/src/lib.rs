pub mod bridge;
pub mod config;
pub mod datapath;
pub mod ip_pool;
pub mod logging;
pub mod netdev;
pub mod nic_pool;
pub mod session;
pub mod wg_client;
pub mod wg_server;
