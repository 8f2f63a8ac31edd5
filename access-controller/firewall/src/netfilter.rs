use crate::{Driver, Error, SetName};
use access_controller_core::Ipv4Net;
use std::{
    net::Ipv4Addr,
    path::{Path, PathBuf},
};
use tokio::process::Command;
use tracing::{debug, warn};

/// Drives `ipset` and `iptables`.
#[derive(Clone, Debug)]
pub struct Netfilter {
    ipset: PathBuf,
    iptables: PathBuf,
    chain: String,
}

const SET_TYPE: &str = "hash:net";

/// Bounds the number of duplicate block rules removed for a single client.
const MAX_DUPLICATE_RULES: usize = 16;

// === impl Netfilter ===

impl Netfilter {
    pub fn new(ipset: impl Into<PathBuf>, iptables: impl Into<PathBuf>, chain: impl ToString) -> Self {
        Self {
            ipset: ipset.into(),
            iptables: iptables.into(),
            chain: chain.to_string(),
        }
    }

    fn rule_args(&self, action: &str, set: &SetName, client: Ipv4Addr) -> Vec<String> {
        vec![
            "-w".to_string(),
            action.to_string(),
            self.chain.clone(),
            "-s".to_string(),
            client.to_string(),
            "-m".to_string(),
            "set".to_string(),
            "!".to_string(),
            "--match-set".to_string(),
            set.to_string(),
            "dst".to_string(),
            "-j".to_string(),
            "REJECT".to_string(),
        ]
    }

    async fn ipset(&self, args: Vec<String>) -> Result<(), Error> {
        run(&self.ipset, &args).await
    }

    async fn rule_exists(&self, set: &SetName, client: Ipv4Addr) -> Result<bool, Error> {
        let args = self.rule_args("-C", set, client);
        match run(&self.iptables, &args).await {
            Ok(()) => Ok(true),
            Err(Error::Failed { .. }) => Ok(false),
            Err(error) => Err(error),
        }
    }
}

#[async_trait::async_trait]
impl Driver for Netfilter {
    async fn probe(&self) -> Result<(), Error> {
        run(&self.ipset, &argv(["list", "-n"])).await?;
        run(&self.iptables, &argv(["-w", "-n", "-L", self.chain.as_str()])).await
    }

    async fn ensure_set(&self, set: &SetName) -> Result<(), Error> {
        self.ipset(argv(["create", set.as_str(), SET_TYPE, "family", "inet", "-exist"]))
            .await
    }

    async fn flush_set(&self, set: &SetName) -> Result<(), Error> {
        self.ipset(argv(["flush", set.as_str()])).await
    }

    async fn destroy_set(&self, set: &SetName) -> Result<(), Error> {
        self.ipset(argv(["destroy", set.as_str()])).await
    }

    async fn swap_sets(&self, from: &SetName, to: &SetName) -> Result<(), Error> {
        self.ipset(argv(["swap", from.as_str(), to.as_str()])).await
    }

    async fn add_member(&self, set: &SetName, net: Ipv4Net) -> Result<(), Error> {
        for entry in set_entries(net) {
            self.ipset(argv(["add", set.as_str(), entry.to_string().as_str(), "-exist"]))
                .await?;
        }
        Ok(())
    }

    async fn remove_member(&self, set: &SetName, addr: Ipv4Addr) -> Result<(), Error> {
        self.ipset(argv(["del", set.as_str(), addr.to_string().as_str(), "-exist"]))
            .await
    }

    async fn install_block_rule(&self, set: &SetName, client: Ipv4Addr) -> Result<(), Error> {
        if self.rule_exists(set, client).await? {
            debug!(%set, %client, "Block rule already installed");
            return Ok(());
        }
        run(&self.iptables, &self.rule_args("-I", set, client)).await
    }

    async fn remove_block_rule(&self, set: &SetName, client: Ipv4Addr) -> Result<(), Error> {
        for _ in 0..MAX_DUPLICATE_RULES {
            if !self.rule_exists(set, client).await? {
                return Ok(());
            }
            run(&self.iptables, &self.rule_args("-D", set, client)).await?;
        }
        warn!(%set, %client, "Block rule still present after removing duplicates");
        Ok(())
    }

    async fn block_rules(&self) -> Result<Vec<(SetName, Ipv4Addr)>, Error> {
        let rules = output(&self.iptables, &argv(["-w", "-S", self.chain.as_str()])).await?;
        Ok(rules
            .lines()
            .filter_map(|line| parse_block_rule(&self.chain, line))
            .collect())
    }
}

/// Parses a rule as printed by `iptables -S`, returning the set and client address if it is a
/// block rule in `chain`.
fn parse_block_rule(chain: &str, line: &str) -> Option<(SetName, Ipv4Addr)> {
    let args = line.split_whitespace().collect::<Vec<_>>();
    if args.first() != Some(&"-A") || args.get(1) != Some(&chain) {
        return None;
    }

    let source = args.iter().position(|a| *a == "-s")?;
    let client = args.get(source + 1)?.parse::<Ipv4Net>().ok()?;
    if client.prefix_len() != 32 {
        return None;
    }

    let matcher = args.iter().position(|a| *a == "--match-set")?;
    if matcher == 0 || args[matcher - 1] != "!" || args.get(matcher + 2) != Some(&"dst") {
        return None;
    }
    let set = args.get(matcher + 1)?;

    let target = args.iter().position(|a| *a == "-j")?;
    if args.get(target + 1) != Some(&"REJECT") {
        return None;
    }

    Some((SetName(set.to_string()), client.addr()))
}

/// `hash:net` sets cannot hold a zero-length prefix, so a default route is added as its two
/// halves.
fn set_entries(net: Ipv4Net) -> Vec<Ipv4Net> {
    if net.prefix_len() == 0 {
        if let Ok(halves) = net.subnets(1) {
            return halves.collect();
        }
    }
    vec![net]
}

fn argv<const N: usize>(args: [&str; N]) -> Vec<String> {
    args.iter().map(|a| a.to_string()).collect()
}

fn command_line(program: &Path, args: &[String]) -> String {
    let mut line = program.display().to_string();
    for arg in args {
        line.push(' ');
        line.push_str(arg);
    }
    line
}

async fn run(program: &Path, args: &[String]) -> Result<(), Error> {
    output(program, args).await.map(|_| ())
}

/// Runs a command to completion, returning its standard output.
async fn output(program: &Path, args: &[String]) -> Result<String, Error> {
    let command = command_line(program, args);
    debug!(%command, "Running");
    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|source| Error::Spawn {
            command: command.clone(),
            source,
        })?;
    if output.status.success() {
        return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
    }
    Err(Error::Failed {
        command,
        status: output.status,
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    })
}
