pub mod cert_provider;
pub mod cert_watcher;
pub mod discovery;
pub mod fanout;
pub mod link;
pub mod transport;
