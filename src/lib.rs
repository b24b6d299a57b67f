pub mod agent;
pub mod config;
pub mod graphite;
pub mod health;
pub mod ifstats;
pub mod pf;
pub mod ping;
