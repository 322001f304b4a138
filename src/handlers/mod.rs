//! Command Handlers module
//!
//! Use cases that change diet plans. Each handler validates its command,
//! then runs load → mutate → save → outbox append in one unit of work.

mod commands;
mod create_plan_handler;
mod update_plan_handler;


pub use commands::*;
pub use create_plan_handler::CreateDietPlanHandler;
pub use update_plan_handler::{UpdateDietPlanHandler, DEFAULT_CONFLICT_ATTEMPTS};
