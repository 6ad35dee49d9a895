//! Shared types for the IBFT consensus engine.
//!
//! Headers and blocks, the consensus extra-data codec, the signed message
//! envelope, validator sets with proposer selection, configuration, the
//! error taxonomy, and the traits crossing the engine boundary.

pub mod config;
pub mod crypto;
pub mod error;
pub mod extra;
pub mod header;
pub mod message;
pub mod traits;
pub mod validator;
pub mod view;

pub use config::BftConfig;
pub use error::{BftError, BftResult};
pub use extra::{BftExtra, VANITY_LENGTH};
pub use header::{Block, Header, BFT_MIX_DIGEST, EMPTY_UNCLE_HASH};
pub use message::{Message, MessageCode, Preprepare, Subject, PROTOCOL_NAME};
pub use traits::{Broadcaster, ChainReader, Peer, ValidatorSource};
pub use validator::{ProposerPolicy, ValidatorSet};
pub use view::View;

// Re-exported so downstream crates share one primitives version.
pub use alloy_primitives::{Address, Bytes, B256, B64, U256};
