//! Line-oriented operator console over a running session.

use std::{
    io::{self, BufRead, Write},
    net::Ipv4Addr,
    sync::mpsc::{self, Receiver, RecvTimeoutError},
    thread,
    time::Duration,
};

use rlab_emu::{
    lifecycle::{self, Operator},
    realize::StopSignal,
    session::Session,
    supervisor::ProcessStatus,
};

/// How often the console checks for a stop request and the forwarding program while idle.
const POLL_INTERVAL: Duration = Duration::from_millis(200);

const HELP: &str = "\
nodes                 list nodes and their addresses
links                 list links
addr <node> <if>      addresses the kernel reports for an interface
path <node> <ip>      interfaces a packet from <node> to <ip> crosses
router                forwarding program status
<node> <cmd...>       run a shell command inside a node
exit | quit           stop the lab";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub(crate) enum ParseError {
    #[error("usage: {0}")]
    Usage(&'static str),
    #[error("invalid IPv4 address {0:?}")]
    InvalidAddress(String),
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ConsoleCommand {
    Empty,
    Help,
    Nodes,
    Links,
    Addr { node: String, interface: String },
    Path { node: String, destination: Ipv4Addr },
    Router,
    /// The rest of the line, run through `sh -c` inside `node`.
    Exec { node: String, command: String },
    Exit,
}

impl ConsoleCommand {
    pub(crate) fn parse(line: &str) -> Result<Self, ParseError> {
        let line = line.trim();
        let (word, rest) = match line.split_once(char::is_whitespace) {
            Some((word, rest)) => (word, rest.trim()),
            None => (line, ""),
        };
        let args: Vec<&str> = rest.split_whitespace().collect();

        let command = match (word, args.as_slice()) {
            ("", _) => Self::Empty,
            ("help" | "?", []) => Self::Help,
            ("nodes", []) => Self::Nodes,
            ("links", []) => Self::Links,
            ("router", []) => Self::Router,
            ("exit" | "quit", []) => Self::Exit,
            ("addr", [node, interface]) => {
                Self::Addr { node: node.to_string(), interface: interface.to_string() }
            }
            ("addr", _) => return Err(ParseError::Usage("addr <node> <if>")),
            ("path", [node, destination]) => Self::Path {
                node: node.to_string(),
                destination: destination
                    .parse()
                    .map_err(|_| ParseError::InvalidAddress(destination.to_string()))?,
            },
            ("path", _) => return Err(ParseError::Usage("path <node> <ip>")),
            ("help" | "?" | "nodes" | "links" | "router" | "exit" | "quit", _) => {
                return Err(ParseError::Usage("help"))
            }
            (_, []) => return Err(ParseError::Usage("<node> <cmd...>")),
            (node, _) => Self::Exec { node: node.to_string(), command: rest.to_string() },
        };

        Ok(command)
    }
}

/// Reads console commands on a background thread and runs them against the session, until
/// `exit`, end of input, or a stop request.
#[derive(Debug)]
pub(crate) struct Shell<W> {
    lines: Receiver<String>,
    out: W,
    stop: StopSignal,
    interactive: bool,
    exit_reported: bool,
}

impl<W: Write> Shell<W> {
    pub(crate) fn new(
        input: Box<dyn BufRead + Send>,
        out: W,
        stop: StopSignal,
        interactive: bool,
    ) -> io::Result<Self> {
        let (tx, lines) = mpsc::channel();
        thread::Builder::new().name("rlab-console".into()).spawn(move || {
            for line in input.lines() {
                let Ok(line) = line else { break };
                if tx.send(line).is_err() {
                    break;
                }
            }
        })?;

        Ok(Self { lines, out, stop, interactive, exit_reported: false })
    }

    fn prompt(&mut self) -> io::Result<()> {
        if self.interactive {
            write!(self.out, "rlab> ")?;
        }
        self.out.flush()
    }

    fn watch_forwarding(&mut self, session: &mut Session) {
        if self.exit_reported {
            return;
        }

        let Some(handle) = session.forwarding_mut() else { return };
        if let Ok(ProcessStatus::Exited(status)) = handle.poll() {
            self.exit_reported = true;
            tracing::warn!(
                pid = handle.pid(),
                %status,
                log = %handle.log_path().display(),
                "forwarding program exited, the lab stays up"
            );
        }
    }

    fn execute(&mut self, session: &mut Session, command: ConsoleCommand) -> io::Result<()> {
        match command {
            ConsoleCommand::Empty | ConsoleCommand::Exit => {}
            ConsoleCommand::Help => writeln!(self.out, "{HELP}")?,
            ConsoleCommand::Nodes => {
                for node in session.nodes() {
                    let addresses: Vec<String> = session
                        .addresses()
                        .iter()
                        .filter(|a| a.node == node.name)
                        .map(|a| format!("{}={}", a.interface, a.address))
                        .collect();
                    let addresses = addresses.join(" ");
                    writeln!(self.out, "{:<8} {:<7} {addresses}", node.name, node.kind)?;
                }
            }
            ConsoleCommand::Links => {
                for link in session.links() {
                    if link.quality.is_best_effort() {
                        writeln!(self.out, "{} <-> {}", link.a, link.b)?;
                    } else {
                        let params = link.quality.netem_params().join(" ");
                        writeln!(self.out, "{} <-> {} netem {params}", link.a, link.b)?;
                    }
                }
            }
            ConsoleCommand::Addr { node, interface } => {
                match session.observed_addresses(&node, &interface) {
                    Ok(addresses) if addresses.is_empty() => {
                        writeln!(self.out, "no IPv4 address on {node}:{interface}")?
                    }
                    Ok(addresses) => {
                        for address in addresses {
                            writeln!(self.out, "{address}")?;
                        }
                    }
                    Err(e) => writeln!(self.out, "{e}")?,
                }
            }
            ConsoleCommand::Path { node, destination } => {
                match session.l3_path(&node, destination) {
                    Some(hops) => {
                        let hops: Vec<String> = hops.iter().map(ToString::to_string).collect();
                        writeln!(self.out, "{}", hops.join(" -> "))?;
                    }
                    None => writeln!(self.out, "no path from {node} to {destination}")?,
                }
            }
            ConsoleCommand::Router => match session.forwarding_mut() {
                None => writeln!(self.out, "no forwarding program")?,
                Some(handle) => {
                    let status = match handle.poll() {
                        Ok(ProcessStatus::Running) => "running".to_string(),
                        Ok(ProcessStatus::Exited(status)) => format!("exited ({status})"),
                        Err(e) => format!("unknown ({e})"),
                    };
                    writeln!(
                        self.out,
                        "{} pid {} on {}: {status}, log {}",
                        handle.command(),
                        handle.pid(),
                        handle.node(),
                        handle.log_path().display()
                    )?;
                }
            },
            ConsoleCommand::Exec { node, command } => {
                let argv = ["sh".to_string(), "-c".to_string(), command];
                match session.exec(&node, &argv) {
                    Ok(output) => {
                        write!(self.out, "{}", output.stdout)?;
                        write!(self.out, "{}", output.stderr)?;
                    }
                    Err(e) => match e.output() {
                        Some(output) => {
                            write!(self.out, "{}", output.stdout)?;
                            write!(self.out, "{}", output.stderr)?;
                            writeln!(self.out, "({})", output.status)?;
                        }
                        None => writeln!(self.out, "{e}")?,
                    },
                }
            }
        }

        Ok(())
    }
}

impl<W: Write> Operator for Shell<W> {
    fn operate(&mut self, session: &mut Session) -> lifecycle::Result<()> {
        writeln!(
            self.out,
            "lab is up: {} nodes, {} links. Type `help` for commands.",
            session.node_count(),
            session.link_count()
        )?;
        self.prompt()?;

        loop {
            self.watch_forwarding(session);
            if self.stop.is_requested() {
                writeln!(self.out)?;
                return Ok(());
            }

            match self.lines.recv_timeout(POLL_INTERVAL) {
                Ok(line) => {
                    if !self.interactive {
                        writeln!(self.out, "rlab> {line}")?;
                    }

                    match ConsoleCommand::parse(&line) {
                        Ok(ConsoleCommand::Exit) => return Ok(()),
                        Ok(command) => self.execute(session, command)?,
                        Err(e) => writeln!(self.out, "{e}")?,
                    }
                    self.prompt()?;
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return Ok(()),
            }
        }
    }
}
