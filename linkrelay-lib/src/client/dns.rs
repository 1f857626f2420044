use dashmap::DashMap;
use reqwest::dns::{Addrs, Name, Resolve, Resolving};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct Resolved {
    at: Instant,
    addrs: Vec<SocketAddr>,
}

impl Resolved {
    fn fresh(&self, ttl: Duration) -> Option<Vec<SocketAddr>> {
        (self.at.elapsed() < ttl).then(|| self.addrs.clone())
    }
}

/// A DNS resolver remembering answers for a fixed time.
///
/// Lookups go through the system resolver via [`tokio::net::lookup_host`].
/// Failed lookups are not cached.
#[derive(Debug, Clone)]
pub(crate) struct CachingResolver {
    cache: Arc<DashMap<String, Resolved>>,
    ttl: Duration,
}

impl CachingResolver {
    pub(crate) fn new(ttl: Duration) -> Self {
        Self {
            cache: Arc::new(DashMap::new()),
            ttl,
        }
    }

    /// Number of host names with a cached answer, fresh or not
    #[cfg(test)]
    pub(crate) fn cached_hosts(&self) -> usize {
        self.cache.len()
    }
}

impl Resolve for CachingResolver {
    fn resolve(&self, name: Name) -> Resolving {
        let cache = Arc::clone(&self.cache);
        let ttl = self.ttl;

        Box::pin(async move {
            let host = name.as_str().to_owned();

            let cached = cache.get(&host).and_then(|entry| entry.fresh(ttl));
            if let Some(addrs) = cached {
                return Ok(Box::new(addrs.into_iter()) as Addrs);
            }

            let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host.as_str(), 0))
                .await?
                .collect();
            if addrs.is_empty() {
                return Err(format!("no addresses found for {host}").into());
            }

            cache.insert(
                host,
                Resolved {
                    at: Instant::now(),
                    addrs: addrs.clone(),
                },
            );
            Ok(Box::new(addrs.into_iter()) as Addrs)
        })
    }
}
