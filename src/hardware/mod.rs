//! Hardware-backed [`crate::frame::FrameIo`] implementations and interface bring-up.

#[cfg(feature = "socketcan")]
pub mod socketcan;

use std::process::Command;

/// Abstraction over the shell commands used to bring a CAN interface up, so interface setup is
/// testable without a real kernel network namespace.
pub trait CommandRunner {
    /// Runs `program` with `args`, returning `Ok(())` only on a zero exit status.
    fn run(&self, program: &str, args: &[&str]) -> std::io::Result<()>;
}

/// Runs commands through the real `std::process::Command`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemCommands;

impl CommandRunner for SystemCommands {
    fn run(&self, program: &str, args: &[&str]) -> std::io::Result<()> {
        let status = Command::new(program).args(args).status()?;
        if status.success() {
            Ok(())
        } else {
            Err(std::io::Error::other(format!(
                "{program} {args:?} exited with {status}"
            )))
        }
    }
}

/// Records every invocation without touching the system, for unit tests.
#[derive(Debug, Default)]
pub struct MockCommands {
    /// `(program, args)` pairs passed to every call, in order.
    pub calls: std::sync::Mutex<Vec<(String, Vec<String>)>>,
}

impl CommandRunner for MockCommands {
    fn run(&self, program: &str, args: &[&str]) -> std::io::Result<()> {
        self.calls.lock().unwrap().push((
            program.to_string(),
            args.iter().map(|s| s.to_string()).collect(),
        ));
        Ok(())
    }
}

/// Brings up a CAN interface via `ip link`, mirroring the `ip link set <iface> type can
/// bitrate <bitrate> && ip link set <iface> up` sequence a deployment's setup script runs before
/// the monitor attaches.
pub fn setup_interface(
    runner: &dyn CommandRunner,
    interface: &str,
    bitrate: u32,
) -> std::io::Result<()> {
    runner.run(
        "ip",
        &["link", "set", interface, "type", "can", "bitrate", &bitrate.to_string()],
    )?;
    runner.run("ip", &["link", "set", interface, "up"])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setup_interface_issues_expected_ip_link_commands() {
        let mock = MockCommands::default();
        setup_interface(&mock, "can0", 500_000).unwrap();
        let calls = mock.calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].0, "ip");
        assert!(calls[0].1.contains(&"500000".to_string()));
        assert_eq!(calls[1].1, vec!["link", "set", "can0", "up"]);
    }
}
