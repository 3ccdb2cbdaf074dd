//! Host-side controller for a DexArm robot arm running a repeated blade
//! pick-and-place job: grab a blade at a taught pick point, transit at a safe
//! height, and drop it on one of several taught hooks.
//!
//! The crate is layered leaf-first: [`transport`] owns the serial line,
//! [`protocol`] speaks the arm's ASCII G-code dialect and its `ok`
//! acknowledgement discipline, [`store`] persists taught positions, and
//! [`controller`] ties it all together with the pause/resume/stop-capable
//! cycle executor. Front ends (GUI, CLI) are expected to stay thin and drive
//! the controller's public operations only.

pub mod config;
pub mod controller;
pub mod protocol;
pub mod store;
pub mod transport;
