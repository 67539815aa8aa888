//! IP protocol number to mnemonic.

/// Total over all of `u8`; numbers without a mnemonic map to "Unknown".
pub fn name(protocol: u8) -> &'static str {
    match protocol {
        1 => "ICMP",
        6 => "TCP",
        17 => "UDP",
        41 => "IPv6",
        47 => "GRE",
        50 => "ESP",
        51 => "AH",
        58 => "ICMPv6",
        132 => "SCTP",
        136 => "UDPLite",
        _ => "Unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::name;

    #[test]
    fn test_known_protocols() {
        assert_eq!(name(1), "ICMP");
        assert_eq!(name(6), "TCP");
        assert_eq!(name(17), "UDP");
        assert_eq!(name(58), "ICMPv6");
        assert_eq!(name(132), "SCTP");
        assert_eq!(name(136), "UDPLite");
    }

    #[test]
    fn test_total_over_u8() {
        for p in 0..=u8::MAX {
            assert!(!name(p).is_empty());
        }
        assert_eq!(name(0), "Unknown");
        assert_eq!(name(255), "Unknown");
    }
}
