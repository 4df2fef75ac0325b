//! Turn orchestration engine for an LLM Game Master.
//!
//! This crate provides:
//! - A bounded tool loop that drives the Game Master model for one turn
//! - Suspend and resume around player-rolled dice checks
//! - Scoped context slices for NPC, rule and lore delegates
//! - A JSON streaming protocol for transports
//! - Session management and persistence
//!
//! # Quick Start
//!
//! ```ignore
//! use gm_core::{GameMaster, Language, PlayerProfile, Session, WorldPack};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let model = Arc::new(claude::Claude::from_env()?);
//!     let gm = GameMaster::new(model);
//!
//!     let pack = WorldPack::sample();
//!     let mut session = Session::new(&pack, PlayerProfile::new("Ari"), Language::En);
//!
//!     let response = gm.process(&mut session, "I attack the guard", Language::En).await?;
//!     if let Some(check) = &response.metadata.check_request {
//!         let roll = check.formula().roll();
//!         let response = gm.resume_after_dice(&mut session, roll, Language::En).await?;
//!         println!("{}", response.content);
//!     }
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod context;
pub mod delegate;
pub mod dice;
pub mod error;
pub mod gm;
pub mod lang;
pub mod llm;
pub mod lore;
pub mod manager;
pub mod persist;
pub mod protocol;
pub mod session;
pub mod testing;
pub mod world;

// Re-export for convenience
pub use gm_macros::Tool;

// Primary public API
pub use config::GmConfig;
pub use dice::{DiceFormula, DiceResult, Outcome};
pub use error::{ErrorKind, GmError};
pub use gm::{GameMaster, TurnMetadata, TurnResponse};
pub use lang::Language;
pub use lore::{KeywordLore, LoreService};
pub use manager::SessionManager;
pub use persist::SavedSession;
pub use protocol::{ClientMessage, ServerMessage, StreamEncoder};
pub use session::{DiceCheckRequest, GamePhase, PlayerProfile, Session, SessionId};
pub use world::WorldPack;
