//! Database module: repository inputs and SQL repositories.
//!
//! - `model`: input structs accepted by the repositories.
//! - `repo`: SQL-only functions that map rows into the entities of
//!   [`crate::model`].
//!
//! Callers import from `mail_campaign::db`; the repository API is re-exported
//! here.

pub mod model;
pub mod repo;

pub use repo::*;

pub use model::{CampaignRow, NewCampaign};
