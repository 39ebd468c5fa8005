//! Swap coordinator - HTLC atomic swaps between script chains and an escrow contract chain
//!
//! Each side of a swap is driven by a [`flow::Flow`] through the ordered steps
//! of its [`protocol::ProtocolDescriptor`]. Chain access goes through the leg
//! traits in [`chain`], peer messages through [`peer::PeerChannel`], and every
//! step transition is persisted through [`state::StateStore`].

pub mod api;
pub mod chain;
pub mod config;
pub mod devnet;
pub mod error;
pub mod flow;
pub mod host;
pub mod metrics;
pub mod peer;
pub mod protocol;
pub mod retry;
pub mod state;
pub mod swap;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{LedgerError, SwapError, SwapResult};
pub use flow::{Flow, FlowEvent, FlowState, StepMeta, SwapContext};
pub use host::{HostRegistry, SwapHost};
pub use protocol::ProtocolDescriptor;
pub use swap::{Asset, Identity, Role, ScriptValues, Secret, SecretHash, Swap};
