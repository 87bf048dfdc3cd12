//! The session state machine.
//!
//! ```text
//! Building ──realize──▶ Realized ──condition──▶ Conditioned ──start──▶ Running
//!    │                     │                        │                    │
//!    │ (failure/stop)      │ (stop)                 │ (stop)             │ operator exit / stop
//!    ▼                     ▼                        ▼                    ▼
//!    └───────────────────────────────────▶ Stopping ──teardown──▶ Stopped
//! ```
//!
//! A [`Lab`] hands out at most one live [`Controller`] at a time. The controller owns the
//! [`Session`] and is the only thing that mutates it, apart from the [`Operator`] it lends the
//! session to while `Running`.

use std::{
    fmt::{self, Display},
    io,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use crate::{
    condition::{self, ConditioningPlan, ConditioningWarning},
    realize::{self, RealizeError, RealizeOptions, StopSignal},
    session::{Session, TeardownReport},
    substrate::{self, Substrate},
    supervisor::{self, ForwardingCommand},
    topology::Topology,
};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("a session is already active in this lab")]
    SessionAlreadyActive,
    #[error("cannot {action} a session that is {state}")]
    InvalidTransition { state: SessionState, action: &'static str },
    #[error(transparent)]
    Realize(#[from] RealizeError),
    #[error(transparent)]
    Forwarding(#[from] supervisor::Error),
    #[error(transparent)]
    Substrate(#[from] substrate::Error),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("operator error: {0}")]
    Operator(String),
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Building,
    Realized,
    Conditioned,
    Running,
    Stopping,
    Stopped,
}

impl Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Building => "building",
            Self::Realized => "realized",
            Self::Conditioned => "conditioned",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        })
    }
}

/// Drives a `Running` session until it decides to stop.
pub trait Operator {
    fn operate(&mut self, session: &mut Session) -> Result<()>;
}

impl<F> Operator for F
where
    F: FnMut(&mut Session) -> Result<()>,
{
    fn operate(&mut self, session: &mut Session) -> Result<()> {
        self(session)
    }
}

/// The forwarding program to run once the session is conditioned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardingLaunch {
    pub node: String,
    pub command: ForwardingCommand,
    pub log_path: PathBuf,
}

/// What a [`Controller`] builds and runs.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub topology: Topology,
    pub realize: RealizeOptions,
    pub conditioning: ConditioningPlan,
    pub forwarding: Option<ForwardingLaunch>,
}

impl SessionConfig {
    /// A config with default realization, no conditioning and no forwarding program.
    pub fn new(topology: Topology) -> Self {
        Self {
            topology,
            realize: RealizeOptions::default(),
            conditioning: ConditioningPlan::default(),
            forwarding: None,
        }
    }

    pub fn conditioning(mut self, plan: ConditioningPlan) -> Self {
        self.conditioning = plan;
        self
    }

    pub fn forwarding(mut self, launch: ForwardingLaunch) -> Self {
        self.forwarding = Some(launch);
        self
    }
}

/// Holds the single-active-session slot of a [`Lab`] until dropped.
#[derive(Debug)]
struct ActiveGuard(Arc<AtomicBool>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// A substrate together with its single active-session slot.
#[derive(Debug, Clone)]
pub struct Lab {
    substrate: Arc<dyn Substrate>,
    active: Arc<AtomicBool>,
}

impl Lab {
    pub fn new(substrate: Arc<dyn Substrate>) -> Self {
        Self { substrate, active: Arc::new(AtomicBool::new(false)) }
    }

    pub fn substrate(&self) -> &Arc<dyn Substrate> {
        &self.substrate
    }

    /// Whether a controller from this lab has not yet stopped.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// A controller in the `Building` state. Fails while another controller from this lab has
    /// not reached `Stopped`.
    pub fn controller(&self, config: SessionConfig) -> Result<Controller> {
        if self.active.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_err() {
            return Err(Error::SessionAlreadyActive);
        }

        Ok(Controller {
            config,
            substrate: Arc::clone(&self.substrate),
            guard: Some(ActiveGuard(Arc::clone(&self.active))),
            state: SessionState::Building,
            session: None,
            stop: StopSignal::new(),
            warnings: Vec::new(),
            forwarding_error: None,
            teardown: None,
        })
    }
}

/// Drives one session through its states.
#[derive(Debug)]
pub struct Controller {
    config: SessionConfig,
    substrate: Arc<dyn Substrate>,
    guard: Option<ActiveGuard>,
    state: SessionState,
    session: Option<Session>,
    stop: StopSignal,
    warnings: Vec<ConditioningWarning>,
    forwarding_error: Option<supervisor::Error>,
    teardown: Option<TeardownReport>,
}

impl Controller {
    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn session_mut(&mut self) -> Option<&mut Session> {
        self.session.as_mut()
    }

    /// A handle that requests `Stopping` from another thread. Realization notices it between
    /// elements, [`Self::run`] between steps.
    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    /// Warnings of the last conditioning pass.
    pub fn warnings(&self) -> &[ConditioningWarning] {
        &self.warnings
    }

    /// Why the forwarding program could not be started, if it couldn't.
    pub fn forwarding_error(&self) -> Option<&supervisor::Error> {
        self.forwarding_error.as_ref()
    }

    /// The report of the teardown, once `Stopped`.
    pub fn teardown_report(&self) -> Option<&TeardownReport> {
        self.teardown.as_ref()
    }

    fn transition(&mut self, to: SessionState) {
        tracing::info!(from = %self.state, %to, "session state");
        self.state = to;
    }

    fn expect_state(&self, expected: SessionState, action: &'static str) -> Result<()> {
        if self.state != expected {
            return Err(Error::InvalidTransition { state: self.state, action });
        }
        Ok(())
    }

    fn invalid(&self, action: &'static str) -> Error {
        Error::InvalidTransition { state: self.state, action }
    }

    /// `Building → Realized`. On failure the partial session is torn down and the controller
    /// ends up `Stopped`.
    pub fn realize(&mut self) -> Result<()> {
        self.expect_state(SessionState::Building, "realize")?;

        let mut options = self.config.realize.clone();
        options.extra_addresses.extend(self.config.conditioning.extra_addresses());

        let substrate = Arc::clone(&self.substrate);
        match realize::realize(substrate, &self.config.topology, &options, &self.stop) {
            Ok(session) => {
                self.session = Some(session);
                self.transition(SessionState::Realized);
                Ok(())
            }
            Err(mut failure) => {
                self.transition(SessionState::Stopping);
                self.finish_stop(failure.partial.teardown());
                Err(failure.error.into())
            }
        }
    }

    /// `Realized → Conditioned`. Failed steps are kept as warnings.
    pub fn condition(&mut self) -> Result<()> {
        self.expect_state(SessionState::Realized, "condition")?;

        let Some(session) = self.session.as_mut() else { return Err(self.invalid("condition")) };
        self.warnings = condition::condition(session, &self.config.conditioning);

        self.transition(SessionState::Conditioned);
        Ok(())
    }

    /// `Conditioned → Running`. A forwarding program that fails to start is recorded, and the
    /// session still runs.
    pub fn start(&mut self) -> Result<()> {
        self.expect_state(SessionState::Conditioned, "start")?;

        if let Some(launch) = &self.config.forwarding {
            let Some(session) = self.session.as_mut() else { return Err(self.invalid("start")) };
            match supervisor::start(session, &launch.node, &launch.command, &launch.log_path) {
                Ok(handle) => session.set_forwarding(handle),
                Err(e) => {
                    tracing::error!(
                        %e,
                        node = %launch.node,
                        command = %launch.command,
                        "forwarding program did not start"
                    );
                    self.forwarding_error = Some(e);
                }
            }
        }

        self.transition(SessionState::Running);
        Ok(())
    }

    /// Lend the running session to `operator`, then stop. Returns the operator's result.
    pub fn operate(&mut self, operator: &mut dyn Operator) -> Result<()> {
        self.expect_state(SessionState::Running, "operate")?;

        let Some(session) = self.session.as_mut() else { return Err(self.invalid("operate")) };
        let result = operator.operate(session);
        if let Err(e) = &result {
            tracing::error!(%e, "operator failed");
        }

        self.stop();
        result
    }

    /// Move to `Stopping` and tear everything down. Safe from any state; once `Stopped` it
    /// only returns the earlier report.
    pub fn stop(&mut self) -> &TeardownReport {
        if self.state != SessionState::Stopped {
            self.stop.request();
            self.transition(SessionState::Stopping);

            let report = self.session.as_mut().map(Session::teardown).unwrap_or_default();
            self.finish_stop(report);
        }

        self.teardown.get_or_insert_with(TeardownReport::default)
    }

    fn finish_stop(&mut self, report: TeardownReport) {
        self.teardown = Some(report);
        self.transition(SessionState::Stopped);
        self.guard.take();
    }

    /// Drive the whole machine: realize, condition, start, operate, stop. A stop requested
    /// through [`Self::stop_signal`] skips the remaining steps.
    pub fn run(&mut self, operator: &mut dyn Operator) -> Result<&TeardownReport> {
        match self.realize() {
            Err(Error::Realize(RealizeError::Cancelled)) => return Ok(self.stop()),
            result => result?,
        }

        for step in [Self::condition, Self::start] {
            if self.stop.is_requested() {
                return Ok(self.stop());
            }
            if let Err(e) = step(self) {
                self.stop();
                return Err(e);
            }
        }

        if self.stop.is_requested() {
            return Ok(self.stop());
        }

        self.operate(operator)?;
        Ok(self.stop())
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        if self.state != SessionState::Stopped {
            tracing::warn!(state = %self.state, "controller dropped before stopping");
            self.stop();
        }
    }
}
