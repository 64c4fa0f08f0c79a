//! Waiting for challenge records to become visible.

use std::thread;
use std::time::Duration;

use tracing::debug;
use trust_dns_resolver::config::{ResolverConfig, ResolverOpts};
use trust_dns_resolver::error::{ResolveError, ResolveErrorKind};
use trust_dns_resolver::system_conf::read_system_conf;
use trust_dns_resolver::Resolver;

use super::ProviderError;

/// Poll the system resolvers until `record` has a TXT value equal to
/// `expected`, making at most `attempts` lookups `interval` apart.
pub fn wait_for_txt(
    record: &str,
    expected: &str,
    attempts: usize,
    interval: Duration,
) -> Result<(), ProviderError> {
    let (config, options) = read_system_conf()?;
    wait_for_txt_with(config, options, record, expected, attempts, interval)
}

/// Like [`wait_for_txt`], asking the name servers in `config` instead.
pub fn wait_for_txt_with(
    config: ResolverConfig,
    mut options: ResolverOpts,
    record: &str,
    expected: &str,
    attempts: usize,
    interval: Duration,
) -> Result<(), ProviderError> {
    // every attempt must reach the network, negative answers included
    options.cache_size = 0;
    let resolver = Resolver::new(config, options)?;

    for attempt in 1..=attempts {
        if has_txt(&resolver, record, expected)? {
            debug!(record = %record, attempt, "TXT record visible");
            return Ok(());
        }

        debug!(record = %record, attempt, attempts, "TXT record not visible yet, waiting {:?}", interval);
        if attempt < attempts {
            thread::sleep(interval);
        }
    }

    Err(ProviderError::NotPropagated {
        record: record.to_string(),
        attempts,
    })
}

fn has_txt(resolver: &Resolver, record: &str, expected: &str) -> Result<bool, ResolveError> {
    match resolver.txt_lookup(record) {
        Ok(lookup) => Ok(lookup.iter().any(|txt| txt_matches(&txt.to_string(), expected))),
        Err(e) if matches!(e.kind(), ResolveErrorKind::NoRecordsFound { .. }) => Ok(false),
        Err(e) => Err(e),
    }
}

fn txt_matches(found: &str, expected: &str) -> bool {
    found.trim_matches('"') == expected
}
