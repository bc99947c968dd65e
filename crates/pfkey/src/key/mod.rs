//! PF_KEY v2 key engine.
//!
//! This module holds the Security Policy Database (SPD), the Security
//! Association Database (SADB), and the message processing that key
//! management daemons drive them with.
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use pfkey::key::{DefaultAlgorithms, KeyConfig, MessageBuilder, MessageType, SadbState};
//! use pfkey::key::{SocketId, StaticAddresses, satype};
//!
//! let mut state = SadbState::new(
//!     KeyConfig::default(),
//!     Arc::new(StaticAddresses::new().with("192.0.2.1".parse()?, 32)),
//!     Arc::new(DefaultAlgorithms),
//! );
//!
//! // Register for ESP acquires and expires
//! let msg = MessageBuilder::new(MessageType::Register, satype::ESP).finish();
//! for out in state.handle_message(SocketId(1), &msg, 1) {
//!     println!("{:?}: {} bytes", out.target, out.bytes.len());
//! }
//! ```
//!
//! # Running as a task
//!
//! [`KeyManager`] moves the state into a tokio task that also runs the
//! periodic sweeper. Everything else talks to it through a [`KeyHandle`]:
//!
//! ```ignore
//! use pfkey::key::{ChannelSink, KeyManager, MonotonicClock};
//!
//! let sink = Arc::new(ChannelSink::new(64));
//! let (handle, _task) = KeyManager::new(state, sink.clone(), MonotonicClock::new()).spawn();
//! let mut replies = sink.attach(SocketId(1));
//! handle.send(SocketId(1), msg).await?;
//! ```
//!
//! # Packet path
//!
//! ```ignore
//! use pfkey::key::{Direction, SecurityIndex};
//!
//! let index = SecurityIndex::host(src, dst);
//! if let Some(policy) = handle.lookup_policy(index.clone(), Direction::Outbound).await? {
//!     let sa = handle.check_request(policy, 0, index).await?;
//!     handle.release_policy(policy).await?;
//! }
//! ```

pub mod acquire;
pub mod algorithm;
pub mod builder;
pub mod config;
pub mod direction;
pub mod engine;
mod error;
pub mod ext;
pub mod index;
pub mod manager;
pub mod message;
pub mod parse;
pub mod policy;
pub mod register;
pub mod sa;
mod sa_msg;
pub mod sadb;
pub mod spd;
mod spd_msg;
pub mod spi;
pub mod store;
pub mod sweep;
pub mod validation;

pub use acquire::{AcquireDecision, AcquireRecord, AcquireTracker};
pub use algorithm::{
    AlgorithmInfo, AlgorithmKind, AlgorithmTable, DefaultAlgorithms, aalg, calg, ealg,
};
pub use builder::MessageBuilder;
pub use config::KeyConfig;
pub use direction::{AddressOracle, Direction, NoLocalAddresses, StaticAddresses};
pub use engine::{Outgoing, SadbState, Target};
pub use error::{Error, Result, ValidationErrorInfo};
pub use ext::{
    AddressExt, AlgorithmDesc, ExtType, Extension, ExtensionMap, IdentityExt, KeyMaterial,
    LifetimeExt, PolicyExt, ProposalExt, SaExt, SpiRangeExt,
};
pub use index::SecurityIndex;
pub use manager::{ChannelSink, Clock, KeyHandle, KeyManager, ManagerStats, MonotonicClock, Sink};
pub use message::{IpsecProtocol, MessageType, SadbMsg, satype};
pub use parse::{Envelope, check_envelope};
pub use policy::{
    IpsecRequest, Level, Mode, PolicyAction, PolicyKind, PolicyLifetime, PolicyState, RequestSpec,
    SecurityPolicy,
};
pub use register::{ListenerDirectory, SocketId};
pub use sa::{ReplayWindow, SaState, SecurityAssociation};
pub use sadb::{SaIdxKey, SaIndex, SaKey, Sadb};
pub use spd::{PolicyKey, Spd};
pub use spi::{SpiAllocator, SpiStats};
pub use sweep::SweepStats;
pub use validation::{Validatable, ValidationIssue, ValidationResult};
