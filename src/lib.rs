//! A signalling rendezvous relay for peer-to-peer file transfers.
//!
//! Two peers that want to talk directly, but do not yet know each other's
//! network addresses, meet through this relay. The first peer opens a
//! WebSocket on `/s/` and is assigned a short numeric *slot code*, which it
//! tells the second peer out-of-band. The second peer opens `/s/<code>`,
//! the two are paired, and from then on the relay pipes every text and
//! binary frame from each peer verbatim to the other until either side
//! disconnects or a hard 30-minute deadline fires.
//!
//! The relay is oblivious to frame contents: authentication and key
//! exchange happen end-to-end between the peers, on top of the relayed
//! bytes. The slot code is the only capability; there are no accounts and
//! no persistent state.
//!
//! This crate provides:
//! - [`server`]: the relay server, over HTTP or HTTPS.
//! - [`protocol`]: the wire-visible close codes.
//! - [`http`]: path and version constants shared with clients.
//! - A server binary wrapping [`server`] with a CLI.

#![deny(missing_docs, rustdoc::broken_intra_doc_links)]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]

pub mod defaults;
pub mod http;
pub mod protocol;
pub mod server;

mod rendezvous;
mod slots;
