pub mod api;
pub mod auth;
pub mod config;
pub mod driver;
pub mod host;
pub mod models;
pub mod poller;
pub mod session;
pub mod storage;

#[cfg(test)]
mod test_support;
