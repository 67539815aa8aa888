//! Geo/ASN lookups against MaxMind databases.
//!
//! Both readers are opened once at startup and live for the program
//! lifetime. Lookups are pure and never fail the caller: a miss yields
//! "Unknown" / 0.

use std::net::IpAddr;
use std::path::Path;

use anyhow::{Context, Result};
use maxminddb::geoip2;

pub const UNKNOWN: &str = "Unknown";

pub struct GeoResolver {
    country: maxminddb::Reader<Vec<u8>>,
    asn: maxminddb::Reader<Vec<u8>>,
}

impl GeoResolver {
    pub fn open(country_path: &Path, asn_path: &Path) -> Result<Self> {
        let country = maxminddb::Reader::open_readfile(country_path)
            .with_context(|| format!("opening country database {}", country_path.display()))?;
        let asn = maxminddb::Reader::open_readfile(asn_path)
            .with_context(|| format!("opening ASN database {}", asn_path.display()))?;
        Ok(Self { country, asn })
    }

    /// ISO country code for an address, or "Unknown".
    ///
    /// `lookup` surfaces "no record" as `Err(AddressNotFoundError)`, same as
    /// a decode error; both degrade to the sentinel here.
    pub fn lookup_country(&self, ip: IpAddr) -> String {
        match self.country.lookup::<geoip2::Country>(ip) {
            Ok(record) => record
                .country
                .and_then(|country| country.iso_code)
                .unwrap_or(UNKNOWN)
                .to_string(),
            Err(_) => UNKNOWN.to_string(),
        }
    }

    /// Autonomous-system number and organization, or (0, "Unknown").
    pub fn lookup_asn(&self, ip: IpAddr) -> (u32, String) {
        match self.asn.lookup::<geoip2::Asn>(ip) {
            Ok(record) => (
                record.autonomous_system_number.unwrap_or(0),
                record
                    .autonomous_system_organization
                    .unwrap_or(UNKNOWN)
                    .to_string(),
            ),
            Err(_) => (0, UNKNOWN.to_string()),
        }
    }
}
