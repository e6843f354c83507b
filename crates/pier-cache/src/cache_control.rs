use crate::meta::ObjectMeta;
use pier_core::{metadata_value, HDR_CACHE_CONTROL, HDR_EXPIRES};
use std::collections::BTreeMap;

/// Parsed `Cache-Control` directives plus the absolute `Expires` header.
///
/// All durations are seconds; zero means the directive was absent.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheControl {
    pub max_age: u64,
    pub s_maxage: u64,
    pub min_fresh: u64,
    pub max_stale: u64,
    pub no_store: bool,
    pub no_cache: bool,
    pub only_if_cached: bool,
    pub expires_millis: Option<u64>,
}

impl CacheControl {
    /// Parse cache directives out of an object's user-defined metadata.
    ///
    /// Parsing is tolerant: unknown directives and malformed values are
    /// ignored, matching how origin servers treat them.
    pub fn from_metadata(user_defined: &BTreeMap<String, String>) -> Self {
        let mut parsed = Self::default();

        if let Some(header) = metadata_value(user_defined, HDR_CACHE_CONTROL) {
            for directive in header.split(',') {
                let directive = directive.trim();
                let (key, value) = match directive.split_once('=') {
                    Some((k, v)) => (k.trim(), Some(v.trim().trim_matches('"'))),
                    None => (directive, None),
                };
                match key.to_ascii_lowercase().as_str() {
                    "max-age" => parsed.max_age = parse_seconds(value),
                    "s-maxage" => parsed.s_maxage = parse_seconds(value),
                    "min-fresh" => parsed.min_fresh = parse_seconds(value),
                    "max-stale" => parsed.max_stale = parse_seconds(value),
                    "no-store" => parsed.no_store = true,
                    "no-cache" => parsed.no_cache = true,
                    "only-if-cached" => parsed.only_if_cached = true,
                    _ => {}
                }
            }
        }

        if let Some(expires) = metadata_value(user_defined, HDR_EXPIRES) {
            parsed.expires_millis = parse_http_date_millis(expires);
        }

        parsed
    }

    /// Decide staleness for an entry last written at `mod_time_millis`.
    ///
    /// Every applicable rule is evaluated and the entry is stale when any of
    /// them fires, so when both `s-maxage` and `Expires` are present the more
    /// restrictive wins.
    pub fn is_stale(&self, mod_time_millis: u64, now_millis: u64) -> bool {
        if self.only_if_cached {
            return false;
        }
        if self.no_store || self.no_cache {
            return true;
        }

        let age_millis = now_millis.saturating_sub(mod_time_millis);
        let mut stale = false;

        if self.s_maxage > 0 && age_millis > self.s_maxage * 1000 {
            stale = true;
        }
        if self.max_age > 0 && age_millis > self.max_age * 1000 {
            stale = true;
        }
        if let Some(expires) = self.expires_millis {
            if expires < now_millis + self.max_stale * 1000 {
                stale = true;
            }
        }
        if self.min_fresh > 0 && age_millis >= self.min_fresh * 1000 {
            stale = true;
        }

        stale
    }
}

/// Whether an entry's backend upload is still outstanding.
///
/// Such entries are served without revalidation: the backend may not have
/// the object yet, so a stat there proves nothing.
pub fn writeback_in_progress(meta: &ObjectMeta) -> bool {
    meta.writeback.is_in_progress()
}

fn parse_seconds(value: Option<&str>) -> u64 {
    value.and_then(|v| v.parse::<u64>().ok()).unwrap_or(0)
}

fn parse_http_date_millis(value: &str) -> Option<u64> {
    let parsed = chrono::DateTime::parse_from_rfc2822(value).ok()?;
    let millis = parsed.timestamp_millis();
    (millis >= 0).then_some(millis as u64)
}
