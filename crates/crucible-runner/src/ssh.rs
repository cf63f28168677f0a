//! SSH transport: run the machine phase on another host through the
//! system `ssh` and `scp` binaries.
//!
//! A control master connection is opened lazily on first use and shared by
//! every subsequent ssh/scp invocation, so a batch of file copies does not
//! pay per-file handshakes. `close` tears the master down once; closing a
//! runner that never connected is a no-op.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{bail, Context, Result};

use crucible_mach::{CancelToken, Event, Observer};
use crucible_plan::{Plan, QuantitySet};

use crate::local::quantity_args;
use crate::merge::{merge_plans, record_digests, retrieval_mappings, source_mappings};
use crate::{ChildSlot, Pipeset, Runner};

static MASTER_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone)]
pub struct SshConfig {
    pub host: String,
    pub user: Option<String>,
    pub port: Option<u16>,
    pub identity: Option<PathBuf>,
    /// Run root on the remote host; the plan is rebased onto it.
    pub remote_root: PathBuf,
    /// Machine-phase binary on the remote host (path or name on PATH).
    pub mach_bin: String,
}

impl SshConfig {
    pub fn new(host: impl Into<String>, remote_root: PathBuf) -> Self {
        SshConfig {
            host: host.into(),
            user: None,
            port: None,
            identity: None,
            remote_root,
            mach_bin: crate::local::MACH_BIN_NAME.to_string(),
        }
    }

    fn dest(&self) -> String {
        match &self.user {
            Some(user) => format!("{user}@{}", self.host),
            None => self.host.clone(),
        }
    }

    fn out_dir(&self) -> PathBuf {
        self.remote_root.join("out")
    }
}

/// One cached ssh control connection.
struct ControlMaster {
    control_path: PathBuf,
    dest: String,
}

impl ControlMaster {
    fn open(cfg: &SshConfig) -> Result<Self> {
        let seq = MASTER_SEQ.fetch_add(1, Ordering::SeqCst);
        let control_path = std::env::temp_dir().join(format!(
            "crucible-ssh-{}-{seq}.ctl",
            std::process::id()
        ));

        let mut cmd = Command::new("ssh");
        cmd.arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg("ConnectTimeout=10");
        if let Some(port) = cfg.port {
            cmd.arg("-p").arg(port.to_string());
        }
        if let Some(identity) = &cfg.identity {
            cmd.arg("-i").arg(identity);
        }
        cmd.arg("-M")
            .arg("-S")
            .arg(&control_path)
            .arg("-N")
            .arg("-f")
            .arg(cfg.dest());

        let status = cmd
            .status()
            .context("starting ssh control master")?;
        if !status.success() {
            bail!("ssh control master for {} failed ({status})", cfg.dest());
        }
        Ok(ControlMaster {
            control_path,
            dest: cfg.dest(),
        })
    }

    fn ssh(&self) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.arg("-o")
            .arg("BatchMode=yes")
            .arg("-S")
            .arg(&self.control_path)
            .arg(&self.dest);
        cmd
    }

    /// Runs a remote command line to completion, failing on nonzero exit.
    fn run_remote(&self, command_line: &str) -> Result<()> {
        let output = self
            .ssh()
            .arg(command_line)
            .stdin(Stdio::null())
            .output()
            .with_context(|| format!("running remote command: {command_line}"))?;
        if !output.status.success() {
            bail!(
                "remote command failed ({}): {command_line}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }

    fn scp(&self, src: &str, dst: &str) -> Result<()> {
        let output = Command::new("scp")
            .arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg(format!("ControlPath={}", self.control_path.display()))
            .arg("-q")
            .arg(src)
            .arg(dst)
            .stdin(Stdio::null())
            .output()
            .context("running scp")?;
        if !output.status.success() {
            bail!(
                "scp {src} -> {dst} failed ({}): {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }

    fn close(self) {
        // Best effort; the connection dies with the process anyway.
        let _ = Command::new("ssh")
            .arg("-S")
            .arg(&self.control_path)
            .arg("-O")
            .arg("exit")
            .arg(&self.dest)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
    }
}

/// Single-quotes `s` for a POSIX shell.
pub fn shell_quote(s: &str) -> String {
    if !s.is_empty() && s.bytes().all(|b| b.is_ascii_alphanumeric() || b"-_./=".contains(&b)) {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// `dest:path` endpoint for scp. The path crosses the remote shell, so it
/// gets the same quoting as any other remote command word.
fn scp_endpoint(dest: &str, path: &Path) -> String {
    format!("{dest}:{}", shell_quote(&path.display().to_string()))
}

pub struct SshRunner {
    cfg: SshConfig,
    master: Option<ControlMaster>,
    child: ChildSlot,
}

impl SshRunner {
    pub fn new(cfg: SshConfig) -> Self {
        SshRunner {
            cfg,
            master: None,
            child: ChildSlot::default(),
        }
    }

    fn master(&mut self) -> Result<&ControlMaster> {
        if self.master.is_none() {
            self.master = Some(ControlMaster::open(&self.cfg)?);
        }
        self.master
            .as_ref()
            .context("ssh control master unavailable")
    }

    fn copy_out(
        &mut self,
        mappings: &std::collections::BTreeMap<PathBuf, PathBuf>,
        observer: &dyn Observer,
    ) -> Result<()> {
        let dest = self.cfg.dest();
        let master = self.master()?;

        let dirs: std::collections::BTreeSet<&Path> =
            mappings.keys().filter_map(|dst| dst.parent()).collect();
        if !dirs.is_empty() {
            let mkdir = dirs
                .iter()
                .map(|d| shell_quote(&d.display().to_string()))
                .collect::<Vec<_>>()
                .join(" ");
            master.run_remote(&format!("mkdir -p {mkdir}"))?;
        }

        observer.on_event(&Event::CopyStart {
            n_files: mappings.len(),
        });
        for (index, (dst, src)) in mappings.iter().enumerate() {
            observer.on_event(&Event::CopyStep {
                index,
                src: src.display().to_string(),
                dst: dst.display().to_string(),
            });
            master.scp(&src.display().to_string(), &scp_endpoint(&dest, dst))?;
        }
        observer.on_event(&Event::CopyEnd);
        Ok(())
    }

    fn copy_back(
        &mut self,
        mappings: &std::collections::BTreeMap<PathBuf, PathBuf>,
        observer: &dyn Observer,
    ) -> Result<()> {
        let dest = self.cfg.dest();
        let master = self.master()?;

        observer.on_event(&Event::CopyStart {
            n_files: mappings.len(),
        });
        for (index, (dst, src)) in mappings.iter().enumerate() {
            if let Some(dir) = dst.parent() {
                std::fs::create_dir_all(dir)
                    .with_context(|| format!("creating {}", dir.display()))?;
            }
            observer.on_event(&Event::CopyStep {
                index,
                src: src.display().to_string(),
                dst: dst.display().to_string(),
            });
            master.scp(&scp_endpoint(&dest, src), &dst.display().to_string())?;
        }
        observer.on_event(&Event::CopyEnd);
        Ok(())
    }
}

impl Runner for SshRunner {
    fn send(&mut self, plan: Plan, observer: &dyn Observer) -> Result<Plan> {
        let mappings = source_mappings(&plan, &self.cfg.remote_root)?;
        let mut remote_plan = plan;
        remote_plan
            .rebase(&self.cfg.remote_root)
            .context("rebasing plan for remote host")?;
        self.copy_out(&mappings, observer)?;
        Ok(remote_plan)
    }

    fn start(&mut self, overrides: &QuantitySet) -> Result<Pipeset> {
        let out_dir = self.cfg.out_dir();
        let mut argv = vec![
            self.cfg.mach_bin.clone(),
            "--out-dir".to_string(),
            out_dir.display().to_string(),
        ];
        argv.extend(quantity_args(overrides));
        let command_line = argv
            .iter()
            .map(|a| shell_quote(a))
            .collect::<Vec<_>>()
            .join(" ");

        let master = self.master()?;
        let mut cmd = master.ssh();
        cmd.arg(command_line)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        crucible_mach::proc::isolate_group(&mut cmd);
        let child = cmd.spawn().context("starting remote machine phase")?;
        self.child.adopt(child)
    }

    fn child_slot(&self) -> ChildSlot {
        self.child.clone()
    }

    fn wait(&mut self, token: &CancelToken) -> Result<()> {
        self.child.wait(token)
    }

    fn recv(&mut self, local: Plan, remote: Plan, observer: &dyn Observer) -> Result<Plan> {
        let mut merged = merge_plans(local, remote)?;
        let mappings = retrieval_mappings(&merged, &self.cfg.remote_root)?;
        self.copy_back(&mappings, observer)?;
        record_digests(&mut merged)?;
        Ok(merged)
    }

    fn close(&mut self) -> Result<()> {
        self.child.kill();
        if let Some(master) = self.master.take() {
            master.close();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quoting_passes_plain_words_through() {
        assert_eq!(shell_quote("crucible-mach"), "crucible-mach");
        assert_eq!(shell_quote("/remote/run/out"), "/remote/run/out");
    }

    #[test]
    fn quoting_wraps_specials_and_escapes_quotes() {
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote(""), "''");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn scp_endpoints_quote_the_remote_path() {
        assert_eq!(
            scp_endpoint("box0", Path::new("/remote/run/out/a.out")),
            "box0:/remote/run/out/a.out"
        );
        assert_eq!(
            scp_endpoint("tester@box0", Path::new("/remote/run root/sub 1/a.out")),
            "tester@box0:'/remote/run root/sub 1/a.out'"
        );
    }

    #[test]
    fn dest_includes_user_when_set() {
        let mut cfg = SshConfig::new("box0", PathBuf::from("/remote/run"));
        assert_eq!(cfg.dest(), "box0");
        cfg.user = Some("tester".to_string());
        assert_eq!(cfg.dest(), "tester@box0");
    }

    #[test]
    fn closing_without_a_connection_is_a_noop() {
        let mut runner = SshRunner::new(SshConfig::new("box0", PathBuf::from("/remote/run")));
        runner.close().unwrap();
    }
}
