pub mod config;
pub mod context;
pub mod coordination;
pub mod errors;
pub mod escalation;
pub mod evidence;
pub mod git;
pub mod history;
pub mod hub;
pub mod investigation;
pub mod orchestrator;
pub mod reasoning;
pub mod report;
