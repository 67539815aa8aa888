//! Firewall mark vocabulary shared with the kernel ruleset.
//!
//! User space never issues NF_DROP directly: every verdict is NF_ACCEPT plus
//! one of these marks, and the NETMONITOR-FILTER chain turns the mark into
//! the real disposition. Changing a value here requires the matching change
//! in `rules`.

/// Sentinel for "not yet classified"; the mangle chains divert mark-0
/// packets to the queue.
pub const UNCLASSIFIED: u32 = 0;

/// Accept this packet only.
pub const ACCEPT: u32 = 1700;
/// Reject this packet (ICMP passes, everything else gets admin-prohibited).
pub const BLOCK: u32 = 1701;
/// Drop this packet silently.
pub const DROP: u32 = 1702;

/// Accept and save to conntrack; the rest of the flow never reaches user space.
pub const ACCEPT_ALWAYS: u32 = 1710;
/// Reject and save to conntrack.
pub const BLOCK_ALWAYS: u32 = 1711;
/// Drop and save to conntrack.
pub const DROP_ALWAYS: u32 = 1712;

/// Return to normal processing after the conntrack save step.
pub const RETURN_AFTER_SAVE: u32 = 1717;
/// Reroute to the local nameserver. Reserved policy hook, no rule consumes it.
pub const REROUTE_NS: u32 = 1799;

/// Every mark a verdict may legally carry.
pub const DEFINED: &[u32] = &[
    ACCEPT,
    BLOCK,
    DROP,
    ACCEPT_ALWAYS,
    BLOCK_ALWAYS,
    DROP_ALWAYS,
    RETURN_AFTER_SAVE,
    REROUTE_NS,
];

/// Marks at or above this value are persisted onto the conntrack entry by
/// the save-mark rule.
const STICKY_BASE: u32 = ACCEPT_ALWAYS;

pub fn is_sticky(mark: u32) -> bool {
    mark >= STICKY_BASE
}

pub fn describe(mark: u32) -> &'static str {
    match mark {
        UNCLASSIFIED => "Unclassified",
        ACCEPT => "Accept",
        BLOCK => "Block",
        DROP => "Drop",
        ACCEPT_ALWAYS => "AcceptAlways",
        BLOCK_ALWAYS => "BlockAlways",
        DROP_ALWAYS => "DropAlways",
        RETURN_AFTER_SAVE => "ReturnAfterSave",
        REROUTE_NS => "RerouteNS",
        _ => "unknown",
    }
}
