/// Build identity reported by `--version`, logs, metrics and the outbound user agent.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const GIT_COMMIT_HASH: &str = env!("SLOT_FETCHER_GIT_COMMIT_HASH");
pub const VERSION_WITH_COMMIT: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    "+",
    env!("SLOT_FETCHER_GIT_COMMIT_HASH")
);

const SHORT_HASH_LEN: usize = 12;

/// Returns the first twelve characters of the commit, or `"unknown"`.
pub fn short_commit_hash() -> &'static str {
    if GIT_COMMIT_HASH == "unknown" {
        return GIT_COMMIT_HASH;
    }
    &GIT_COMMIT_HASH[..SHORT_HASH_LEN.min(GIT_COMMIT_HASH.len())]
}

/// `User-Agent` header sent to RPC providers and downstream parsers.
pub fn user_agent() -> String {
    format!("slot_fetcher/{VERSION}+{}", short_commit_hash())
}
