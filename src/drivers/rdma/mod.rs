pub mod cm;
pub mod context;
pub mod poller;
pub mod soft;
pub mod transport;
pub mod verbs;
