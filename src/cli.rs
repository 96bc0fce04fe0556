use clap::ValueEnum;

/// How the host-address cache is consulted.
#[derive(ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum HostCacheMode {
    /// Always resolve, never read or write the cache.
    Bypass,
    /// Use cached addresses, resolve and remember on a miss.
    #[default]
    Default,
    /// Always resolve, then overwrite the cached entry.
    Update,
}
