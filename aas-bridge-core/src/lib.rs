#![doc = "aas-bridge-core: core logic library for aas-bridge."]

//! Mirrors AAS repositories into a dataspace connector catalog and proxies element
//! content on demand. Connector-specific adapters (the management API client) live in the
//! `aas-bridge` crate; everything here talks to them through [`contract`].
//!
//! # Usage
//! Build a [`runtime::Runtime`] from a [`config::BridgeConfig`] and a
//! [`contract::CatalogStore`], or drive a [`synchronise::Synchroniser`] directly.

pub mod backoff;
pub mod catalog;
pub mod config;
pub mod contract;
pub mod error;
pub mod inventory;
pub mod model;
pub mod policy;
pub mod prober;
pub mod proxy;
pub mod reference;
pub mod runtime;
pub mod scheduler;
pub mod synchronise;
pub mod validate;
pub mod walker;
