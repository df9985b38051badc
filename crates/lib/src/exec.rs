//! Safe execution layer: run allowlisted binaries with allowlisted subcommands only.
//! No shell is used; arguments are passed as a list to avoid injection.

use std::collections::HashMap;

use tokio::process::Command;

/// Binary name -> allowed subcommands.
#[derive(Debug, Clone, Default)]
pub struct Allowlist {
    bins: HashMap<String, Vec<String>>,
}

impl Allowlist {
    pub fn new() -> Self {
        Self {
            bins: HashMap::new(),
        }
    }

    /// Allow `binary` to run only the given subcommands.
    pub fn allow(&mut self, binary: impl Into<String>, subcommands: Vec<String>) {
        self.bins.insert(binary.into(), subcommands);
    }

    pub fn permits(&self, binary: &str, subcommand: &str) -> bool {
        self.bins
            .get(binary)
            .is_some_and(|subs| subs.iter().any(|s| s == subcommand))
    }

    /// Run `binary subcommand args...` if allowed. Returns stdout; on failure stdout and stderr are in the error.
    /// The child is killed if the returned future is dropped (e.g. on turn timeout).
    pub async fn run(&self, binary: &str, subcommand: &str, args: &[String]) -> Result<String, String> {
        if !self.bins.contains_key(binary) {
            return Err(format!("binary not allowlisted: {}", binary));
        }
        if !self.permits(binary, subcommand) {
            return Err(format!(
                "subcommand not allowlisted: {} {}",
                binary, subcommand
            ));
        }
        let output = Command::new(binary)
            .arg(subcommand)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| format!("exec failed: {}", e))?;
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        if output.status.success() {
            Ok(stdout)
        } else {
            let mut msg = stdout;
            if !stderr.is_empty() {
                if !msg.is_empty() {
                    msg.push('\n');
                }
                msg.push_str(&stderr);
            }
            Err(format!("exit {}: {}", output.status, msg))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn refuses_unlisted_pairs() {
        let mut a = Allowlist::new();
        a.allow("echo", vec!["hello".to_string()]);
        assert!(a.run("rm", "-rf", &[]).await.unwrap_err().contains("binary not allowlisted"));
        assert!(a.run("echo", "bye", &[]).await.unwrap_err().contains("subcommand not allowlisted"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn runs_allowed_pair_without_shell() {
        let mut a = Allowlist::new();
        a.allow("echo", vec!["hello".to_string()]);
        let out = a.run("echo", "hello", &["$HOME; ls".to_string()]).await.unwrap();
        assert_eq!(out.trim(), "hello $HOME; ls");
    }
}
