//! netlab: orchestrate network-emulation topologies across compute hosts
//!
//! A controller keeps projects (nodes, links, drawings) in memory, places
//! nodes on remote compute hosts, wires links between their ports and
//! streams every committed change to subscribers.

pub mod api;
pub mod cli;
pub mod compute;
pub mod config;
pub mod controller;
pub mod error;
pub mod notification;
pub mod topology;
