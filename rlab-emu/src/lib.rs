//! Build, run and tear down a small virtual internetwork around a router program under test.
//!
//! A lab is described as a [`topology::Topology`] (or a [`config::LabConfig`] file), realized on
//! an emulation [`substrate::Substrate`] (Linux network namespaces in [`namespace`]), conditioned,
//! and handed to the forwarding program and an operator. [`lifecycle::Controller`] sequences all
//! of it and guarantees teardown.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use rlab_emu::{
//!     config::LabConfig,
//!     lifecycle::Lab,
//!     namespace::{NetnsSubstrate, Sudo},
//!     session::Session,
//! };
//!
//! let lab = Lab::new(Arc::new(NetnsSubstrate::new(Sudo::Auto)));
//! let mut controller = lab.controller(LabConfig::three_subnets().session_config()?)?;
//!
//! let report = controller.run(&mut |session: &mut Session| -> rlab_emu::lifecycle::Result<()> {
//!     let output = session.exec("h1", &["ping".into(), "-c1".into(), "10.0.2.10".into()])?;
//!     println!("{}", output.stdout);
//!     Ok(())
//! })?;
//! assert!(report.is_clean());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod command;
pub mod condition;
pub mod config;
pub mod ip;
pub mod lifecycle;
pub mod namespace;
pub mod realize;
pub mod session;
pub mod substrate;
pub mod supervisor;
pub mod sysctl;
pub mod tc;
pub mod test_util;
pub mod topology;

pub use realize::realize;
