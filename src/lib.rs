// HOTPLUGD -- LOAD-DRIVEN CPU HOTPLUG GOVERNOR FOR LINUX
//
// DECISION LOGIC (tuning.rs, load.rs) IS PURE AND TESTABLE OFFLINE.
// EVERYTHING THAT TOUCHES THE MACHINE SITS BEHIND platform.rs.

pub mod config;
pub mod control;
pub mod error;
pub mod event;
pub mod governor;
pub mod load;
pub mod platform;
pub mod tuning;
pub mod work;
