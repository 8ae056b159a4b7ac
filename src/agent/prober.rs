//! Prober subprocess supervisor
//!
//! Spawns the external prober with piped stdio, optionally feeds it a
//! generated probe stream over stdin, mirrors its output into the log,
//! and turns a cancellation signal into SIGTERM followed by SIGKILL after
//! a grace window.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::watch;

use crate::probes::ProbeGenerator;
use crate::types::{ProberError, Round};

/// How a prober run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProberOutcome {
    Completed,
    Canceled,
    Failed { code: i32 },
}

/// One prober invocation
#[derive(Debug, Clone)]
pub struct ProberCommand {
    pub prober_path: PathBuf,
    pub output_path: PathBuf,
    pub probing_rate: u32,
    pub protocol: crate::types::Protocol,
    pub min_ttl: u8,
    pub max_ttl: u8,
    pub round: Round,
    /// Probes file for rounds > 1. Mutually exclusive with stdin probes.
    pub input_file: Option<PathBuf>,
    /// BGP prefixes file for the prober's prefix filter, set on
    /// exhaustive snapshots.
    pub prefix_filter_file: Option<PathBuf>,
    pub n_packets: Option<u32>,
    pub no_sleep: bool,
    pub debug: bool,
}

impl ProberCommand {
    fn to_args(&self) -> Vec<String> {
        let mut args = vec![
            "--output-file-csv".to_string(),
            self.output_path.display().to_string(),
            "--probing-rate".to_string(),
            self.probing_rate.to_string(),
            "--protocol".to_string(),
            self.protocol.to_string(),
            format!("--filter-min-ttl={}", self.min_ttl),
            format!("--filter-max-ttl={}", self.max_ttl),
            format!("--meta-round={}", self.round),
        ];
        if self.debug {
            args.push("--log-level=trace".to_string());
        }
        if let Some(path) = &self.input_file {
            args.push(format!("--input-file={}", path.display()));
        }
        if let Some(path) = &self.prefix_filter_file {
            args.push(format!("--filter-from-prefix-file-excl={}", path.display()));
        }
        if let Some(n) = self.n_packets {
            args.push(format!("--n-packets={n}"));
        }
        if self.no_sleep {
            args.push("--no-sleep".to_string());
        }
        args
    }
}

/// Run the prober to completion, cancellation or failure.
///
/// `stdin_probes` streams generated probes into the prober with pull-based
/// backpressure: each CSV line is written only once the previous write was
/// accepted. The `cancel` channel flips to `true` when the measurement
/// disappears or turns canceled on the bus.
pub async fn run_prober(
    command: &ProberCommand,
    stdin_probes: Option<ProbeGenerator>,
    mut cancel: watch::Receiver<bool>,
    grace: Duration,
) -> Result<ProberOutcome, ProberError> {
    if stdin_probes.is_some() && command.input_file.is_some() {
        return Err(ProberError::ConflictingInputs);
    }

    let args = command.to_args();
    tracing::info!(
        prober = %command.prober_path.display(),
        arguments = %args.join(" "),
        "starting prober"
    );

    let mut child = Command::new(&command.prober_path)
        .args(&args)
        .stdin(if stdin_probes.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| ProberError::Spawn {
            path: command.prober_path.display().to_string(),
            source,
        })?;

    if let Some(generator) = stdin_probes {
        let mut stdin = child.stdin.take().expect("stdin was piped");
        tokio::spawn(async move {
            for probe in generator {
                let line = probe.to_csv();
                if stdin.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
                if stdin.write_all(b"\n").await.is_err() {
                    break;
                }
            }
            // Dropping stdin signals end of input to the prober.
        });
    }

    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::info!(target: "prober", "{line}");
            }
        });
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::warn!(target: "prober", "{line}");
            }
        });
    }

    loop {
        tokio::select! {
            status = child.wait() => {
                let status = status?;
                return Ok(match status.code() {
                    Some(0) => ProberOutcome::Completed,
                    Some(code) => ProberOutcome::Failed { code },
                    // Killed by an external signal.
                    None => ProberOutcome::Failed { code: -1 },
                });
            }
            changed = cancel.changed() => {
                if changed.is_err() || !*cancel.borrow() {
                    // Sender gone without signalling: keep waiting on the
                    // child alone.
                    if changed.is_err() {
                        let status = child.wait().await?;
                        return Ok(match status.code() {
                            Some(0) => ProberOutcome::Completed,
                            Some(code) => ProberOutcome::Failed { code },
                            None => ProberOutcome::Failed { code: -1 },
                        });
                    }
                    continue;
                }
                terminate(&mut child, grace).await;
                return Ok(ProberOutcome::Canceled);
            }
        }
    }
}

/// SIGTERM, then SIGKILL once the grace window elapses.
async fn terminate(child: &mut Child, grace: Duration) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
        match tokio::time::timeout(grace, child.wait()).await {
            Ok(_) => return,
            Err(_) => {
                tracing::warn!("prober ignored SIGTERM, killing");
            }
        }
    }
    let _ = child.kill().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Protocol;

    fn command(output: &str) -> ProberCommand {
        ProberCommand {
            prober_path: PathBuf::from("/bin/true"),
            output_path: PathBuf::from(output),
            probing_rate: 100,
            protocol: Protocol::Udp,
            min_ttl: 2,
            max_ttl: 30,
            round: 1,
            input_file: None,
            prefix_filter_file: None,
            n_packets: None,
            no_sleep: false,
            debug: false,
        }
    }

    #[test]
    fn arguments_follow_the_prober_contract() {
        let mut cmd = command("/tmp/out.csv");
        cmd.input_file = Some(PathBuf::from("/tmp/probes.csv"));
        cmd.n_packets = Some(3);
        cmd.no_sleep = true;
        let args = cmd.to_args().join(" ");
        assert!(args.contains("--output-file-csv /tmp/out.csv"));
        assert!(args.contains("--probing-rate 100"));
        assert!(args.contains("--protocol udp"));
        assert!(args.contains("--filter-min-ttl=2"));
        assert!(args.contains("--filter-max-ttl=30"));
        assert!(args.contains("--meta-round=1"));
        assert!(args.contains("--input-file=/tmp/probes.csv"));
        assert!(args.contains("--n-packets=3"));
        assert!(args.contains("--no-sleep"));
    }

    #[test]
    fn prefix_filter_uses_the_exclusion_flag() {
        let mut cmd = command("/tmp/out.csv");
        cmd.prefix_filter_file = Some(PathBuf::from("/etc/iris/bgp-prefixes.txt"));
        let args = cmd.to_args().join(" ");
        assert!(args.contains("--filter-from-prefix-file-excl=/etc/iris/bgp-prefixes.txt"));
        assert!(!args.contains("incl"));
    }

    #[tokio::test]
    async fn clean_exit_completes() {
        let (_tx, rx) = watch::channel(false);
        let outcome = run_prober(&command("/dev/null"), None, rx, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(outcome, ProberOutcome::Completed);
    }

    #[tokio::test]
    async fn non_zero_exit_is_a_failure() {
        let mut cmd = command("/dev/null");
        cmd.prober_path = PathBuf::from("/bin/false");
        let (_tx, rx) = watch::channel(false);
        let outcome = run_prober(&cmd, None, rx, Duration::from_secs(1))
            .await
            .unwrap();
        assert!(matches!(outcome, ProberOutcome::Failed { .. }));
    }

    #[tokio::test]
    async fn conflicting_inputs_are_rejected() {
        let mut cmd = command("/dev/null");
        cmd.input_file = Some(PathBuf::from("/tmp/probes.csv"));
        let generator = ProbeGenerator::new(
            Vec::new(),
            crate::probes::GenerationParams {
                prefix_len_v4: 24,
                prefix_len_v6: 64,
                min_flow: 0,
                max_flow: 0,
                destination_port: 33434,
                source_port_base: 24000,
                mapper: None,
            },
        );
        let (_tx, rx) = watch::channel(false);
        let result = run_prober(&cmd, Some(generator), rx, Duration::from_secs(1)).await;
        assert!(matches!(result, Err(ProberError::ConflictingInputs)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cancellation_terminates_the_prober() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fake-prober");
        std::fs::write(&script, "#!/bin/sh\nsleep 100\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut cmd = command("/dev/null");
        cmd.prober_path = script;
        let (tx, rx) = watch::channel(false);
        let handle =
            tokio::spawn(async move { run_prober(&cmd, None, rx, Duration::from_secs(5)).await });
        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(true).unwrap();
        let outcome = handle.await.unwrap().unwrap();
        assert_eq!(outcome, ProberOutcome::Canceled);
    }
}
