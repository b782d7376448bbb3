//! IPC runtime for a many-core network-on-chip machine: typed connectors
//! (mailbox, portal, sync) over an abstract transport, plus the name and
//! remote-memory services built on top of them.

#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]

pub mod shared;

pub mod noc;
pub mod resource;
pub mod transport;

pub mod runtime;

pub mod mailbox;
pub mod portal;
pub mod sync;

pub mod barrier;

pub mod name;
pub mod rmem;
