//! Name service: the authoritative name ↔ node table, its wire protocol,
//! and the client glue used by the named connectors.

pub mod client;
pub mod protocol;
pub mod server;
