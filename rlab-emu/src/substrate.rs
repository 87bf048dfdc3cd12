//! The emulation substrate: the primitives the core drives to turn a graph into live elements.
//!
//! A substrate knows how to create an isolated execution context per node, connect two
//! contexts with a virtual point-to-point pair, and run commands inside a context. Everything
//! else (addresses, bridges, routes, sysctls) is expressed by the core as typed commands issued
//! through [`Substrate::exec`].

use std::{
    io,
    process::{Child, Stdio},
};

use crate::{
    command::{self, Output},
    tc::LinkQuality,
    topology::{Endpoint, NodeKind},
};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("command error: {0}")]
    Command(#[from] command::Error),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("no execution context for node {0}")]
    NoSuchNode(String),
}

impl Error {
    /// The captured output of a command that ran and failed, if that is what happened.
    pub fn output(&self) -> Option<&Output> {
        match self {
            Self::Command(command::Error::NonZero(output)) => Some(output),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Synchronous interface to the network-emulation substrate. Every call returns once the
/// element is fully created or destroyed.
pub trait Substrate: std::fmt::Debug + Send + Sync {
    /// Create the isolated execution context for a node.
    fn create_node(&self, name: &str, kind: NodeKind) -> Result<()>;

    /// Destroy a node's execution context, along with anything still living inside it.
    fn destroy_node(&self, name: &str) -> Result<()>;

    /// Create a virtual point-to-point pair with the endpoints' interface names, emulating
    /// `quality` on both ends unless it is best-effort.
    fn create_link(&self, a: &Endpoint, b: &Endpoint, quality: &LinkQuality) -> Result<()>;

    /// Destroy a virtual pair. Removing either end removes both.
    fn destroy_link(&self, a: &Endpoint, b: &Endpoint) -> Result<()>;

    /// Run `argv` inside the node's context and capture its output. A non-zero exit status is an
    /// error carrying the captured output.
    fn exec(&self, node: &str, argv: &[String]) -> Result<Output>;

    /// Start `argv` inside the node's context without waiting for it.
    fn spawn(&self, node: &str, argv: &[String], stdout: Stdio, stderr: Stdio) -> Result<Child>;
}
