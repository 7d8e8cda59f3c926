pub mod assignments;
pub mod client;
pub mod config;
pub mod control;
pub mod eid;
pub mod error;
pub mod mapmsg;
pub mod notify;
pub mod register;
pub mod registry;
pub mod routing;
pub mod tables;
