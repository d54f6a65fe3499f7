use std::process::{Command, Stdio};

use tracing::info;

use crate::connection::ConnectionDescription;
use crate::error::{Error, Result};
use crate::types::NodeId;

/// How a launched node finds its way back to the listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchArgs {
    /// Reachable `host:port` of the launching node's listener.
    pub server: String,
    pub node_id: NodeId,
}

impl LaunchArgs {
    /// Command-line arguments understood by the `cluster-sync` binary.
    pub fn to_args(&self) -> Vec<String> {
        vec![
            "--client".to_string(),
            "--server".to_string(),
            self.server.clone(),
            "--node-id".to_string(),
            self.node_id.0.to_string(),
        ]
    }
}

/// Starts the process of a remote node.
pub trait Launcher: Send {
    fn launch(&self, node: NodeId, description: &ConnectionDescription, args: &LaunchArgs) -> Result<()>;
}

/// Spawns an argv template (e.g. `ssh {host} cluster-sync`) followed by the
/// launch arguments.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    template: Vec<String>,
}

impl ProcessLauncher {
    pub fn new(template: Vec<String>) -> Result<Self> {
        if template.is_empty() {
            return Err(Error::Config("launch command is empty".to_string()));
        }
        Ok(Self { template })
    }

    fn argv(&self, description: &ConnectionDescription, args: &LaunchArgs) -> Vec<String> {
        self.template
            .iter()
            .map(|arg| arg.replace("{host}", &description.address))
            .chain(args.to_args())
            .collect()
    }
}

impl Launcher for ProcessLauncher {
    fn launch(&self, node: NodeId, description: &ConnectionDescription, args: &LaunchArgs) -> Result<()> {
        let argv = self.argv(description, args);
        let Some((program, rest)) = argv.split_first() else {
            return Err(Error::Config("launch command is empty".to_string()));
        };
        let child = Command::new(program)
            .args(rest)
            .stdin(Stdio::null())
            .spawn()
            .map_err(|err| Error::Launch {
                node,
                reason: format!("{}: {err}", argv.join(" ")),
            })?;
        info!(%node, pid = child.id(), command = %argv.join(" "), "launched node");
        Ok(())
    }
}

/// For nodes started by hand: logs what to run and expects the node to
/// connect on its own.
#[derive(Debug, Clone, Copy, Default)]
pub struct ManualLauncher;

impl Launcher for ManualLauncher {
    fn launch(&self, node: NodeId, description: &ConnectionDescription, args: &LaunchArgs) -> Result<()> {
        info!(
            %node,
            host = %description.address,
            args = %args.to_args().join(" "),
            "waiting for node to be started manually"
        );
        Ok(())
    }
}

pub fn launcher_for(launch_command: Option<&[String]>) -> Result<Box<dyn Launcher>> {
    match launch_command {
        Some(template) => Ok(Box::new(ProcessLauncher::new(template.to_vec())?)),
        None => Ok(Box::new(ManualLauncher)),
    }
}
