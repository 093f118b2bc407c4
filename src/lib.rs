//! # Resarb
//!
//! Cross-process arbitration of scarce hardware decode resources.
//!
//! Set-top and TV hardware exposes a fixed number of decode units per
//! class (video decoders, audio decoders, broadcast front-ends). Resarb
//! coordinates which process may drive which unit: all shared state
//! lives in one memory-mapped control file under a common runtime
//! directory, so there is no daemon to run and no socket to reach.
//! Processes arbitrate by priority, hand contested slots over through a
//! revoke/confirm handshake, and reclaim whatever a crashed peer left
//! behind.
//!
//! ## Features
//!
//! - **No daemon**: one flock-protected, CRC-validated control file
//! - **Priority preemption**: higher-priority requests revoke lower ones
//! - **Futex handshakes**: slots change owners without polling the file
//! - **Crash recovery**: dead owners are swept on every lock acquisition
//! - **Declarative capability tables**: config file or built-in defaults
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use resarb::prelude::*;
//!
//! let mgr = ResMgr::open()?;
//! let outcome = mgr.request(
//!     RequestSpec::new(ResClass::Video, 5),
//!     Some(Box::new(|_id, event| {
//!         if event == GrantEvent::Revoked {
//!             // stop driving the decoder, then release
//!         }
//!     })),
//! )?;
//! if let RequestOutcome::Granted { id, caps } = outcome {
//!     // decode within `caps`, then hand the slot back
//!     mgr.release(ResClass::Video, id)?;
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

mod admission;
pub mod caps;
pub mod config;
mod dump;
pub mod error;
mod handshake;
mod layout;
mod manager;
mod pool;
mod sem;
mod store;
pub mod table;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::caps::{
        CapFlags, EventFn, GrantEvent, RequestId, RequestSpec, ResClass, SizeLimit, SlotCaps,
        UsageFlags,
    };
    pub use crate::config::ArbConfig;
    pub use crate::error::{Error, Result};
    pub use crate::manager::{RequestOutcome, ResMgr};
}

pub use caps::{
    CapFlags, EventFn, GrantEvent, RequestId, RequestSpec, ResClass, SizeLimit, SlotCaps,
    UsageFlags,
};
pub use config::ArbConfig;
pub use error::{Error, Result};
pub use manager::{RequestOutcome, ResMgr};
