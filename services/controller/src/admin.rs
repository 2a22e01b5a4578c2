//! Admin command execution.
//!
//! A small allow-list of host operations, addressed per controller: a
//! command whose `controller_id` is not ours is refused before anything
//! runs.  Each action maps to one fixed external invocation; there is no
//! argument pass-through from the wire.

use tc_protocol::{AdminAction, AdminCommand, ResultCode};
use tracing::{error, info, warn};

// Fixed invocations (Raspbian deployment paths).
const REBOOT_ARGV: &[&str] = &["/sbin/reboot"];
const WIFI_ENABLE_ARGV: &[&str] = &[
    "/sbin/wpa_supplicant",
    "-B",
    "-i",
    "wlan0",
    "-c",
    "/etc/wpa_supplicant/wpa_adhoc.conf",
];
const WIFI_DISABLE_ARGV: &[&str] = &["/usr/bin/killall", "wpa_supplicant"];

/// Runs one external command to completion.
///
/// Returns the exit code (None when the process died to a signal).
pub trait CommandRunner: Clone + Send + Sync + 'static {
    fn run(&self, argv: &[&str]) -> impl Future<Output = std::io::Result<Option<i32>>> + Send;
}

/// Production runner backed by `tokio::process`.
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner;

impl CommandRunner for ProcessRunner {
    async fn run(&self, argv: &[&str]) -> std::io::Result<Option<i32>> {
        let Some((program, args)) = argv.split_first() else {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty argv",
            ));
        };
        let status = tokio::process::Command::new(program)
            .args(args)
            .status()
            .await?;
        Ok(status.code())
    }
}

/// Gate + executor for admin commands addressed to this controller.
pub struct AdminExecutor<R: CommandRunner> {
    controller_id: String,
    runner: R,
}

impl<R: CommandRunner> AdminExecutor<R> {
    pub fn new(controller_id: &str, runner: R) -> Self {
        AdminExecutor {
            controller_id: controller_id.to_owned(),
            runner,
        }
    }

    /// Validate targeting, run the mapped invocation, report the outcome.
    ///
    /// Blocks its caller until the subprocess exits; the dispatcher runs
    /// each admin message on its own task for exactly that reason.
    pub async fn execute(&self, cmd: &AdminCommand) -> ResultCode {
        if cmd.controller_id != self.controller_id {
            warn!(
                user = %cmd.user_id,
                target = %cmd.controller_id,
                "admin command addressed to another controller, refusing"
            );
            return ResultCode::InvalidCmd;
        }

        let argv = match cmd.action {
            AdminAction::Reboot => REBOOT_ARGV,
            AdminAction::WifiEnable => WIFI_ENABLE_ARGV,
            AdminAction::WifiDisable => WIFI_DISABLE_ARGV,
        };
        info!(user = %cmd.user_id, action = ?cmd.action, "running admin command");

        match self.runner.run(argv).await {
            Ok(Some(0)) => ResultCode::Ok,
            Ok(code) => {
                error!(action = ?cmd.action, ?code, "admin command exited nonzero");
                ResultCode::UnknownError
            }
            Err(e) => {
                error!(action = ?cmd.action, error = %e, "admin command failed to spawn");
                ResultCode::UnknownError
            }
        }
    }
}
