pub mod auth;
pub mod error;
pub mod folder;
pub mod gateway;
pub mod intake;
pub mod notify;
pub mod reconcile;
pub mod registry;
pub mod server;
