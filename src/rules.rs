//! Kernel ruleset: divert first-of-flow packets to the queue, enforce marks.
//!
//! The contract with the queue workers lives in the rule text below: the
//! ingest chains restore any saved connection mark and push still-unmarked
//! packets to the per-family queue (with queue-bypass so an absent listener
//! never stalls traffic), and the filter chain turns the mark a verdict
//! carried into the real disposition, saving sticky marks to conntrack so
//! the rest of the flow never comes back to user space.

use anyhow::{anyhow, bail, Context, Result};
use tracing::debug;

use crate::marks;

const INGEST_OUTPUT: &str = "NETMONITOR-INGEST-OUTPUT";
const INGEST_INPUT: &str = "NETMONITOR-INGEST-INPUT";
const FILTER: &str = "NETMONITOR-FILTER";

const CHAINS: &[(&str, &str)] = &[
    ("mangle", INGEST_OUTPUT),
    ("mangle", INGEST_INPUT),
    ("filter", FILTER),
];

fn ingest_rules(queue_num: u16) -> Vec<(&'static str, &'static str, String)> {
    let divert = format!(
        "-m mark --mark {} -j NFQUEUE --queue-num {} --queue-bypass",
        marks::UNCLASSIFIED,
        queue_num
    );
    vec![
        ("mangle", INGEST_OUTPUT, "-j CONNMARK --restore-mark".to_string()),
        ("mangle", INGEST_OUTPUT, divert.clone()),
        ("mangle", INGEST_INPUT, "-j CONNMARK --restore-mark".to_string()),
        ("mangle", INGEST_INPUT, divert),
    ]
}

fn filter_rules(v6: bool) -> Vec<(&'static str, &'static str, String)> {
    let icmp = if v6 { "icmpv6" } else { "icmp" };
    let reject_with = if v6 {
        "icmp6-adm-prohibited"
    } else {
        "icmp-admin-prohibited"
    };
    let rules = vec![
        // Mark 0 here means the queue was bypassed and nothing decided.
        format!("-m mark --mark {} -j DROP", marks::UNCLASSIFIED),
        format!("-m mark --mark {} -j RETURN", marks::ACCEPT),
        format!("-m mark --mark {} -p {icmp} -j RETURN", marks::BLOCK),
        format!(
            "-m mark --mark {} -j REJECT --reject-with {reject_with}",
            marks::BLOCK
        ),
        format!("-m mark --mark {} -j DROP", marks::DROP),
        "-j CONNMARK --save-mark".to_string(),
        format!("-m mark --mark {} -j RETURN", marks::ACCEPT_ALWAYS),
        format!("-m mark --mark {} -p {icmp} -j RETURN", marks::BLOCK_ALWAYS),
        format!(
            "-m mark --mark {} -j REJECT --reject-with {reject_with}",
            marks::BLOCK_ALWAYS
        ),
        format!("-m mark --mark {} -j DROP", marks::DROP_ALWAYS),
        format!("-m mark --mark {} -j RETURN", marks::RETURN_AFTER_SAVE),
    ];
    rules.into_iter().map(|r| ("filter", FILTER, r)).collect()
}

fn jump_rules() -> Vec<(&'static str, &'static str, String)> {
    vec![
        ("mangle", "OUTPUT", format!("-j {INGEST_OUTPUT}")),
        ("mangle", "INPUT", format!("-j {INGEST_INPUT}")),
        ("filter", "OUTPUT", format!("-j {FILTER}")),
        ("filter", "INPUT", format!("-j {FILTER}")),
    ]
}

// rust-iptables reports Box<dyn Error>, which anyhow cannot hold directly.
fn ipt_err(e: Box<dyn std::error::Error>) -> anyhow::Error {
    anyhow!("{e}")
}

/// Install the ruleset for both address families. Idempotent: existing
/// chains are cleared, existing rules and jumps left in place. A failure
/// unwinds whatever was installed before reporting.
pub fn install(queue_v4: u16, queue_v6: u16) -> Result<()> {
    for (v6, queue_num) in [(false, queue_v4), (true, queue_v6)] {
        if let Err(e) = activate(v6, queue_num) {
            let _ = cleanup();
            let family = if v6 { "IPv6" } else { "IPv4" };
            return Err(e.context(format!("installing {family} rules")));
        }
    }
    debug!(chains = ?installed_chains().unwrap_or_default(), "kernel ruleset installed");
    Ok(())
}

fn activate(v6: bool, queue_num: u16) -> Result<()> {
    let ipt = iptables::new(v6).map_err(ipt_err)?;

    for &(table, chain) in CHAINS {
        if ipt.chain_exists(table, chain).map_err(ipt_err)? {
            ipt.flush_chain(table, chain).map_err(ipt_err)?;
        } else {
            ipt.new_chain(table, chain).map_err(ipt_err)?;
        }
    }

    for (table, chain, rule) in ingest_rules(queue_num).into_iter().chain(filter_rules(v6)) {
        ipt.append_unique(table, chain, &rule)
            .map_err(ipt_err)
            .with_context(|| format!("appending to {table}/{chain}: {rule}"))?;
    }

    for (table, parent, rule) in jump_rules() {
        if !ipt.exists(table, parent, &rule).map_err(ipt_err)? {
            ipt.insert(table, parent, &rule, 1)
                .map_err(ipt_err)
                .with_context(|| format!("inserting jump into {table}/{parent}"))?;
        }
    }

    Ok(())
}

/// Remove jumps and chains for both families. Tolerates partial prior
/// state: missing pieces are skipped, every other failure is accumulated
/// and reported at the end.
pub fn cleanup() -> Result<()> {
    let mut failures = Vec::new();
    for v6 in [false, true] {
        deactivate(v6, &mut failures);
    }
    if failures.is_empty() {
        Ok(())
    } else {
        bail!("rule cleanup finished with errors: {}", failures.join("; "))
    }
}

fn deactivate(v6: bool, failures: &mut Vec<String>) {
    let family = if v6 { "IPv6" } else { "IPv4" };
    let ipt = match iptables::new(v6) {
        Ok(ipt) => ipt,
        Err(e) => {
            failures.push(format!("{family}: {e}"));
            return;
        }
    };

    // Jumps first, so the custom chains are unreferenced before deletion.
    for (table, parent, rule) in jump_rules() {
        match ipt.exists(table, parent, &rule) {
            Ok(true) => {
                if let Err(e) = ipt.delete(table, parent, &rule) {
                    failures.push(format!("{family} {table}/{parent} jump: {e}"));
                }
            }
            Ok(false) => {}
            Err(e) => failures.push(format!("{family} {table}/{parent} jump check: {e}")),
        }
    }

    for &(table, chain) in CHAINS {
        match ipt.chain_exists(table, chain) {
            Ok(true) => {
                if let Err(e) = ipt.flush_chain(table, chain) {
                    failures.push(format!("{family} flush {table}/{chain}: {e}"));
                }
                if let Err(e) = ipt.delete_chain(table, chain) {
                    failures.push(format!("{family} delete {table}/{chain}: {e}"));
                }
            }
            Ok(false) => {}
            Err(e) => failures.push(format!("{family} {table}/{chain} check: {e}")),
        }
    }
}

/// Our custom chains currently present in the kernel, both families.
pub fn installed_chains() -> Result<Vec<String>> {
    let mut found = Vec::new();
    for v6 in [false, true] {
        let family = if v6 { "IPv6" } else { "IPv4" };
        let ipt = iptables::new(v6).map_err(ipt_err)?;
        for table in ["mangle", "filter"] {
            let chains = ipt
                .list_chains(table)
                .map_err(ipt_err)
                .with_context(|| format!("listing {family} {table} chains"))?;
            found.extend(
                chains
                    .into_iter()
                    .filter(|c| c.starts_with("NETMONITOR-"))
                    .map(|c| format!("{family} {table} {c}")),
            );
        }
    }
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ingest_rules_use_per_family_queue() {
        let rules = ingest_rules(17040);
        assert_eq!(rules.len(), 4);
        assert_eq!(rules[0].2, "-j CONNMARK --restore-mark");
        assert!(rules[1].2.contains("--queue-num 17040"));
        assert!(rules[1].2.contains("--queue-bypass"));
        assert!(rules[1].2.starts_with("-m mark --mark 0 "));
        // Both ingest chains feed the same family queue.
        assert_eq!(rules[1].2, rules[3].2);
        assert_eq!(rules[1].1, INGEST_OUTPUT);
        assert_eq!(rules[3].1, INGEST_INPUT);
    }

    #[test]
    fn test_filter_rules_order_v4() {
        let rules: Vec<String> = filter_rules(false).into_iter().map(|r| r.2).collect();
        assert_eq!(rules[0], "-m mark --mark 0 -j DROP");
        assert_eq!(rules[1], "-m mark --mark 1700 -j RETURN");
        assert_eq!(rules[2], "-m mark --mark 1701 -p icmp -j RETURN");
        assert_eq!(
            rules[3],
            "-m mark --mark 1701 -j REJECT --reject-with icmp-admin-prohibited"
        );
        assert_eq!(rules[4], "-m mark --mark 1702 -j DROP");
        assert_eq!(rules[5], "-j CONNMARK --save-mark");
        assert_eq!(rules[6], "-m mark --mark 1710 -j RETURN");
        assert_eq!(rules[10], "-m mark --mark 1717 -j RETURN");
    }

    #[test]
    fn test_filter_rules_v6_variants() {
        let rules: Vec<String> = filter_rules(true).into_iter().map(|r| r.2).collect();
        assert!(rules[2].contains("-p icmpv6"));
        assert!(rules[3].contains("icmp6-adm-prohibited"));
        assert!(rules[8].contains("icmp6-adm-prohibited"));
    }

    #[test]
    fn test_jumps_cover_both_hooks() {
        let jumps = jump_rules();
        assert_eq!(jumps.len(), 4);
        assert!(jumps.iter().any(|j| j.0 == "mangle" && j.1 == "OUTPUT"));
        assert!(jumps.iter().any(|j| j.0 == "mangle" && j.1 == "INPUT"));
        assert!(jumps.iter().any(|j| j.0 == "filter" && j.1 == "OUTPUT"));
        assert!(jumps.iter().any(|j| j.0 == "filter" && j.1 == "INPUT"));
    }
}
