//! CLI Commands

pub mod check;
pub mod resolve;
pub mod run;
pub mod targets;
