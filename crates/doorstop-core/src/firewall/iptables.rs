//! iptables PREROUTING redirect synchronizer
//!
//! Keeps at most one `REDIRECT` rule for the stopper port in the `nat` table.
//! Nothing is cached: every removal lists the live table and every insert
//! goes straight to the firewall.
//!
//! A listing (`iptables -t nat -L PREROUTING -n`) looks like:
//!
//! ```text
//! Chain PREROUTING (policy ACCEPT)
//! target     prot opt source               destination
//! REDIRECT   udp  --  0.0.0.0/0            192.168.0.203        udp dpt:15409 redir ports 51820
//! ```
//!
//! Rule numbers accepted by `-D` count data rows from 1.

use super::iface::{InterfaceLookup, SystemInterfaces};
use super::runner::{CommandOutput, CommandRunner, ProcessRunner, RunningCommand, run};
use crate::error::RedirectError;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::oneshot;

/// Header lines preceding the rules in a listing
const HEADER_LINES: usize = 2;

/// Fields a rule row is split into; the last one keeps the rest of the row
const ROW_FIELDS: usize = 6;

const FIELD_PROTOCOL: usize = 1;
const FIELD_DESTINATION: usize = 4;
const FIELD_OPTIONS: usize = 5;

/// What the listing scanner concluded
#[derive(Debug)]
enum ScanOutcome {
    /// First matching rule, 1-based
    Found(usize),
    /// Output ended without a match
    Exhausted,
    /// Output could not be read
    Failed(std::io::Error),
}

/// Removes stale redirect rules and installs fresh ones
#[derive(Clone)]
pub struct RedirectSynchronizer {
    runner: Arc<dyn CommandRunner>,
    interfaces: Arc<dyn InterfaceLookup>,
}

impl RedirectSynchronizer {
    /// Synchronizer using the given command runner and interface lookup
    #[must_use]
    pub fn new(runner: Arc<dyn CommandRunner>, interfaces: Arc<dyn InterfaceLookup>) -> Self {
        Self { runner, interfaces }
    }

    /// Synchronizer running real firewall commands against host interfaces
    #[must_use]
    pub fn system() -> Self {
        Self::new(Arc::new(ProcessRunner), Arc::new(SystemInterfaces))
    }

    /// Delete the first redirect rule for `local_ip`/`stopper_port`
    ///
    /// Returns the deleted rule number, or `None` if the table holds no such
    /// rule. The listing is scanned while the command runs; the decision is
    /// only taken once the command has exited and the whole output has been
    /// read.
    ///
    /// # Errors
    ///
    /// Returns `RedirectError` if listing fails, the output cannot be read,
    /// or the delete command fails.
    pub async fn remove_stale_redirect(
        &self,
        firewall: &str,
        local_ip: IpAddr,
        stopper_port: u16,
    ) -> Result<Option<usize>, RedirectError> {
        tracing::debug!("Run {} -L", firewall);
        let RunningCommand { stdout, completion } = self.runner.spawn(firewall, &list_args())?;

        let (tx, rx) = oneshot::channel();
        let scanner = tokio::spawn(scan_listing(stdout, local_ip, stopper_port, tx));

        if let Err(e) = completion.await {
            scanner.abort();
            return Err(e);
        }

        match rx.await.map_err(|_| RedirectError::ScannerLost)? {
            ScanOutcome::Found(rule) => {
                tracing::info!("Removing stale redirect rule {}", rule);
                run(self.runner.as_ref(), firewall, &delete_args(rule)).await?;
                Ok(Some(rule))
            }
            ScanOutcome::Exhausted => {
                tracing::debug!("No stale redirect for {} dpt:{}", local_ip, stopper_port);
                Ok(None)
            }
            ScanOutcome::Failed(e) => Err(RedirectError::Listing(e)),
        }
    }

    /// Redirect UDP traffic for `local_ip:stopper_port` to `local_port`
    ///
    /// The rule is bound to the interface carrying `local_ip`.
    ///
    /// # Errors
    ///
    /// Returns `RedirectError` if no interface carries `local_ip` or the
    /// insert command fails.
    pub async fn add_redirect(
        &self,
        firewall: &str,
        local_ip: IpAddr,
        stopper_port: u16,
        local_port: u16,
    ) -> Result<(), RedirectError> {
        let iface = self.interfaces.interface_for(local_ip)?;

        tracing::debug!("Run {} -A", firewall);
        run(
            self.runner.as_ref(),
            firewall,
            &insert_args(&iface, local_ip, stopper_port, local_port),
        )
        .await?;

        tracing::info!(
            "Redirecting {}:{} on {} to port {}",
            local_ip,
            stopper_port,
            iface,
            local_port
        );
        Ok(())
    }
}

impl std::fmt::Debug for RedirectSynchronizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedirectSynchronizer").finish_non_exhaustive()
    }
}

fn list_args() -> Vec<String> {
    ["-t", "nat", "-L", "PREROUTING", "-n"]
        .iter()
        .map(|s| (*s).to_string())
        .collect()
}

fn delete_args(rule: usize) -> Vec<String> {
    vec![
        "-t".to_string(),
        "nat".to_string(),
        "-D".to_string(),
        "PREROUTING".to_string(),
        rule.to_string(),
    ]
}

fn insert_args(iface: &str, local_ip: IpAddr, stopper_port: u16, local_port: u16) -> Vec<String> {
    vec![
        "-t".to_string(),
        "nat".to_string(),
        "-A".to_string(),
        "PREROUTING".to_string(),
        "-p".to_string(),
        "udp".to_string(),
        "-i".to_string(),
        iface.to_string(),
        "-d".to_string(),
        local_ip.to_string(),
        "--dport".to_string(),
        stopper_port.to_string(),
        "-j".to_string(),
        "REDIRECT".to_string(),
        "--to-ports".to_string(),
        local_port.to_string(),
    ]
}

/// Split `line` on whitespace runs into at most `limit` fields
///
/// The last field holds the unsplit remainder. A line starting with
/// whitespace yields an empty first field, keeping column positions for rows
/// with an empty target.
fn split_fields(line: &str, limit: usize) -> Vec<&str> {
    let mut fields = Vec::with_capacity(limit);
    let mut rest = line.trim_end_matches(['\n', '\r']);

    while fields.len() + 1 < limit {
        let Some(end) = rest.find(char::is_whitespace) else {
            break;
        };
        fields.push(&rest[..end]);
        rest = rest[end..].trim_start();
    }
    fields.push(rest);

    fields
}

fn is_stale_redirect(fields: &[&str], local_ip: IpAddr, port_token: &str) -> bool {
    fields.len() >= ROW_FIELDS
        && fields[FIELD_PROTOCOL].contains("udp")
        && fields[FIELD_DESTINATION]
            .parse::<IpAddr>()
            .is_ok_and(|ip| ip == local_ip)
        && fields[FIELD_OPTIONS]
            .split_whitespace()
            .any(|token| token == port_token)
}

async fn scan_listing(
    stdout: CommandOutput,
    local_ip: IpAddr,
    stopper_port: u16,
    report: oneshot::Sender<ScanOutcome>,
) {
    let port_token = format!("dpt:{stopper_port}");
    let mut reader = BufReader::new(stdout);
    let mut buf = Vec::new();
    let mut row = 0usize;

    // Rows are matched as bytes decoded lossily; comments may hold any encoding
    let outcome = loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break ScanOutcome::Exhausted,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!("Read error from rule listing: {}", e);
                break ScanOutcome::Failed(e);
            }
        }

        row += 1;
        if row <= HEADER_LINES {
            continue;
        }

        let line = String::from_utf8_lossy(&buf);
        if is_stale_redirect(&split_fields(&line, ROW_FIELDS), local_ip, &port_token) {
            break ScanOutcome::Found(row - HEADER_LINES);
        }
    };

    let found = matches!(outcome, ScanOutcome::Found(_));
    let _ = report.send(outcome);

    if found {
        // Keep the pipe flowing until the command exits
        let mut sink = tokio::io::sink();
        let _ = tokio::io::copy(&mut reader, &mut sink).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::io::Cursor;
    use std::pin::Pin;
    use std::sync::Mutex;
    use std::task::{Context, Poll};
    use tokio::io::{AsyncRead, ReadBuf};

    const LISTING: &str = "\
Chain PREROUTING (policy ACCEPT)
target     prot opt source               destination
REDIRECT   udp  --  0.0.0.0/0            192.168.0.202        udp dpt:16683 redir ports 51820
REDIRECT   udp  --  0.0.0.0/0            192.168.0.203        udp dpt:15409 redir ports 51820
REDIRECT   udp  --  0.0.0.0/0            192.168.0.203        udp dpt:15409 redir ports 51820
";

    /// Output that fails on first read
    struct BrokenOutput;

    impl AsyncRead for BrokenOutput {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            Poll::Ready(Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "pipe closed",
            )))
        }
    }

    /// Runner answering `-L` with a fixed listing and recording every call
    #[derive(Default)]
    struct ScriptedRunner {
        listing: String,
        listing_bytes: Option<Vec<u8>>,
        broken_listing: bool,
        fail_listing: bool,
        fail_delete: bool,
        calls: Mutex<Vec<Vec<String>>>,
    }

    impl ScriptedRunner {
        fn with_listing(listing: &str) -> Self {
            Self {
                listing: listing.to_string(),
                ..Self::default()
            }
        }

        fn calls(&self) -> Vec<Vec<String>> {
            self.calls.lock().unwrap().clone()
        }

        fn deletes(&self) -> Vec<String> {
            self.calls()
                .into_iter()
                .filter(|args| args[2] == "-D")
                .map(|args| args[4].clone())
                .collect()
        }
    }

    impl CommandRunner for ScriptedRunner {
        fn spawn(&self, program: &str, args: &[String]) -> Result<RunningCommand, RedirectError> {
            self.calls.lock().unwrap().push(args.to_vec());

            let listing = args[2] == "-L";
            let stdout: CommandOutput = if listing && self.broken_listing {
                Box::new(BrokenOutput)
            } else if listing {
                let bytes = self
                    .listing_bytes
                    .clone()
                    .unwrap_or_else(|| self.listing.clone().into_bytes());
                Box::new(Cursor::new(bytes))
            } else {
                Box::new(tokio::io::empty())
            };

            let fail = (listing && self.fail_listing) || (args[2] == "-D" && self.fail_delete);
            let program = program.to_string();
            let joined = args.join(" ");
            let completion = Box::pin(async move {
                if fail {
                    Err(RedirectError::CommandFailed {
                        program,
                        args: joined,
                        status: "exit status: 1".to_string(),
                    })
                } else {
                    Ok(())
                }
            });

            Ok(RunningCommand { stdout, completion })
        }
    }

    struct FixedInterfaces;

    impl InterfaceLookup for FixedInterfaces {
        fn interface_for(&self, ip: IpAddr) -> Result<String, RedirectError> {
            super::super::iface::find_interface(
                vec![("eth0".to_string(), "192.168.0.203".parse().unwrap())],
                ip,
            )
        }
    }

    fn synchronizer(runner: &Arc<ScriptedRunner>) -> RedirectSynchronizer {
        RedirectSynchronizer::new(runner.clone(), Arc::new(FixedInterfaces))
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_split_fields() {
        let fields = split_fields(
            "REDIRECT   udp  --  0.0.0.0/0            192.168.0.203        udp dpt:15409 redir ports 51820\n",
            ROW_FIELDS,
        );
        assert_eq!(
            fields,
            vec![
                "REDIRECT",
                "udp",
                "--",
                "0.0.0.0/0",
                "192.168.0.203",
                "udp dpt:15409 redir ports 51820"
            ]
        );

        assert_eq!(split_fields("a b", ROW_FIELDS), vec!["a", "b"]);
        assert_eq!(split_fields("", ROW_FIELDS), vec![""]);
        assert_eq!(split_fields("  udp x", 3), vec!["", "udp", "x"]);
    }

    #[test]
    fn test_port_token_is_exact() {
        let row = split_fields(
            "REDIRECT   udp  --  0.0.0.0/0            192.168.0.203        udp dpt:154090 redir ports 51820",
            ROW_FIELDS,
        );
        assert!(!is_stale_redirect(&row, ip("192.168.0.203"), "dpt:15409"));
        assert!(is_stale_redirect(&row, ip("192.168.0.203"), "dpt:154090"));
    }

    #[test]
    fn test_short_rows_never_match() {
        let row = split_fields("REDIRECT udp -- 0.0.0.0/0 192.168.0.203", ROW_FIELDS);
        assert!(!is_stale_redirect(&row, ip("192.168.0.203"), "dpt:15409"));
    }

    #[tokio::test]
    async fn test_remove_first_matching_rule() {
        let runner = Arc::new(ScriptedRunner::with_listing(LISTING));

        let removed = synchronizer(&runner)
            .remove_stale_redirect("iptables", ip("192.168.0.203"), 15409)
            .await
            .unwrap();

        assert_eq!(removed, Some(2));
        assert_eq!(runner.deletes(), vec!["2".to_string()]);
        assert_eq!(
            runner.calls()[0],
            vec!["-t", "nat", "-L", "PREROUTING", "-n"]
        );
        assert_eq!(
            runner.calls()[1],
            vec!["-t", "nat", "-D", "PREROUTING", "2"]
        );
    }

    #[tokio::test]
    async fn test_remove_non_existing_rule() {
        let runner = Arc::new(ScriptedRunner::with_listing(LISTING));

        let removed = synchronizer(&runner)
            .remove_stale_redirect("iptables", ip("192.168.0.203"), 15999)
            .await
            .unwrap();

        assert_eq!(removed, None);
        assert_eq!(runner.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_remove_past_non_utf8_row() {
        // A Latin-1 comment ahead of the fixture rows
        let mut listing = Vec::new();
        for (i, line) in LISTING.lines().enumerate() {
            if i == 2 {
                listing.extend_from_slice(
                    b"ACCEPT     udp  --  0.0.0.0/0            10.0.0.1             /* caf\xE9 */\n",
                );
            }
            listing.extend_from_slice(line.as_bytes());
            listing.push(b'\n');
        }

        let runner = Arc::new(ScriptedRunner {
            listing_bytes: Some(listing),
            ..ScriptedRunner::default()
        });

        let removed = synchronizer(&runner)
            .remove_stale_redirect("iptables", ip("192.168.0.203"), 15409)
            .await
            .unwrap();

        assert_eq!(removed, Some(3));
        assert_eq!(runner.deletes(), vec!["3".to_string()]);
    }

    #[tokio::test]
    async fn test_remove_from_empty_listing() {
        let runner = Arc::new(ScriptedRunner::with_listing(""));

        let removed = synchronizer(&runner)
            .remove_stale_redirect("iptables", ip("192.168.0.203"), 15409)
            .await
            .unwrap();
        assert_eq!(removed, None);
    }

    #[tokio::test]
    async fn test_remove_surfaces_delete_failure() {
        let runner = Arc::new(ScriptedRunner {
            fail_delete: true,
            ..ScriptedRunner::with_listing(LISTING)
        });

        let result = synchronizer(&runner)
            .remove_stale_redirect("iptables", ip("192.168.0.203"), 15409)
            .await;
        assert!(matches!(result, Err(RedirectError::CommandFailed { .. })));
        assert_eq!(runner.deletes(), vec!["2".to_string()]);
    }

    #[tokio::test]
    async fn test_remove_surfaces_listing_failure() {
        let runner = Arc::new(ScriptedRunner {
            fail_listing: true,
            ..ScriptedRunner::with_listing(LISTING)
        });

        let result = synchronizer(&runner)
            .remove_stale_redirect("iptables", ip("192.168.0.203"), 15409)
            .await;
        assert!(matches!(result, Err(RedirectError::CommandFailed { .. })));
        assert!(runner.deletes().is_empty());
    }

    #[tokio::test]
    async fn test_remove_surfaces_read_error() {
        let runner = Arc::new(ScriptedRunner {
            broken_listing: true,
            ..ScriptedRunner::default()
        });

        let result = synchronizer(&runner)
            .remove_stale_redirect("iptables", ip("192.168.0.203"), 15409)
            .await;
        assert!(matches!(result, Err(RedirectError::Listing(_))));
        assert!(runner.deletes().is_empty());
    }

    #[tokio::test]
    async fn test_remove_with_real_process() {
        // `true` ignores its arguments and lists nothing
        let synchronizer = RedirectSynchronizer::system();
        let result = synchronizer
            .remove_stale_redirect("true", ip("192.168.0.203"), 15409)
            .await
            .unwrap();
        assert_eq!(result, None);
    }

    #[tokio::test]
    async fn test_add_redirect() {
        let runner = Arc::new(ScriptedRunner::default());

        synchronizer(&runner)
            .add_redirect("iptables", ip("192.168.0.203"), 15409, 51820)
            .await
            .unwrap();

        assert_eq!(
            runner.calls(),
            vec![vec![
                "-t",
                "nat",
                "-A",
                "PREROUTING",
                "-p",
                "udp",
                "-i",
                "eth0",
                "-d",
                "192.168.0.203",
                "--dport",
                "15409",
                "-j",
                "REDIRECT",
                "--to-ports",
                "51820"
            ]]
        );
    }

    #[tokio::test]
    async fn test_add_redirect_without_interface() {
        let runner = Arc::new(ScriptedRunner::default());

        let result = synchronizer(&runner)
            .add_redirect("iptables", ip("10.1.2.3"), 15409, 51820)
            .await;
        assert!(matches!(result, Err(RedirectError::InterfaceNotFound(_))));
        assert!(runner.calls().is_empty());
    }

    fn row_strategy() -> impl Strategy<Value = String> {
        (
            prop::sample::select(vec!["udp", "tcp", "all"]),
            prop::sample::select(vec!["192.168.0.202", "192.168.0.203", "10.0.0.1"]),
            1u16..=65535,
        )
            .prop_map(|(proto, dest, port)| {
                format!(
                    "REDIRECT   {proto}  --  0.0.0.0/0            {dest}        {proto} dpt:{port} redir ports 51820"
                )
            })
    }

    fn matches_fixture_target(row: &str) -> bool {
        is_stale_redirect(
            &split_fields(row, ROW_FIELDS),
            ip("192.168.0.203"),
            "dpt:15409",
        )
    }

    proptest! {
        #[test]
        fn listing_without_match_never_deletes(
            rows in proptest::collection::vec(row_strategy(), 0..20)
        ) {
            let rows: Vec<String> = rows
                .into_iter()
                .filter(|row| !matches_fixture_target(row))
                .collect();
            let listing = format!(
                "Chain PREROUTING (policy ACCEPT)\ntarget     prot opt source               destination\n{}\n",
                rows.join("\n")
            );
            let runner = Arc::new(ScriptedRunner::with_listing(&listing));

            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            let removed = runtime
                .block_on(synchronizer(&runner).remove_stale_redirect(
                    "iptables",
                    ip("192.168.0.203"),
                    15409,
                ))
                .unwrap();

            prop_assert_eq!(removed, None);
            prop_assert!(runner.deletes().is_empty());
        }

        #[test]
        fn matching_row_is_deleted_by_index(
            before in proptest::collection::vec(row_strategy(), 0..10),
        ) {
            let before: Vec<String> = before
                .into_iter()
                .filter(|row| !matches_fixture_target(row))
                .collect();
            let expected = before.len() + 1;
            let listing = format!(
                "Chain PREROUTING (policy ACCEPT)\ntarget     prot opt source               destination\n{}{}REDIRECT   udp  --  0.0.0.0/0            192.168.0.203        udp dpt:15409 redir ports 51820\n",
                before.join("\n"),
                if before.is_empty() { "" } else { "\n" },
            );
            let runner = Arc::new(ScriptedRunner::with_listing(&listing));

            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            let removed = runtime
                .block_on(synchronizer(&runner).remove_stale_redirect(
                    "iptables",
                    ip("192.168.0.203"),
                    15409,
                ))
                .unwrap();

            prop_assert_eq!(removed, Some(expected));
            prop_assert_eq!(runner.deletes(), vec![expected.to_string()]);
        }
    }
}
