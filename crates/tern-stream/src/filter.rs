//! Client-side filtering of firehose messages.
//!
//! The firehose has no connect-time filters, so consumers that only care
//! about some repositories or collections drop the rest after decoding.

use std::collections::HashSet;

use smol_str::SmolStr;

use crate::firehose::{FirehoseEvent, FirehoseMessage};

/// Collection and repository filter.
///
/// Collections match exactly, or by prefix when written as `app.bsky.feed.*`;
/// a lone `*` matches everything. Empty lists let everything through.
/// Messages that are not about a repository (`#info`, error frames) always
/// pass, as do identity, account and sync messages under a collection
/// filter.
///
/// ```
/// use tern_stream::FirehoseFilter;
///
/// let filter = FirehoseFilter::new().collections(["app.bsky.feed.*"]);
/// assert!(filter.matches_collection("app.bsky.feed.post"));
/// assert!(!filter.matches_collection("app.bsky.graph.follow"));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FirehoseFilter {
    collections: Vec<SmolStr>,
    dids: HashSet<SmolStr>,
}

impl FirehoseFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn collections<I>(mut self, collections: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<SmolStr>,
    {
        self.collections.extend(collections.into_iter().map(Into::into));
        self
    }

    pub fn dids<I>(mut self, dids: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<SmolStr>,
    {
        self.dids.extend(dids.into_iter().map(Into::into));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.collections.is_empty() && self.dids.is_empty()
    }

    pub fn matches_collection(&self, nsid: &str) -> bool {
        self.collections.is_empty()
            || self.collections.iter().any(|pattern| match pattern.strip_suffix('*') {
                Some(prefix) => nsid.starts_with(prefix),
                None => pattern == nsid,
            })
    }

    pub fn matches_did(&self, did: &str) -> bool {
        self.dids.is_empty() || self.dids.contains(did)
    }

    /// The message with non-matching commit ops removed, or `None` when
    /// nothing of interest is left.
    pub fn apply(&self, mut message: FirehoseMessage) -> Option<FirehoseMessage> {
        if let Some(did) = message.did() {
            if !self.matches_did(did) {
                return None;
            }
        }
        if let FirehoseEvent::Commit(commit) = &mut message.event {
            if !self.collections.is_empty() {
                commit.ops.retain(|op| self.matches_collection(&op.collection));
                if commit.ops.is_empty() {
                    return None;
                }
            }
        }
        Some(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collection_patterns() {
        let filter = FirehoseFilter::new().collections(["app.bsky.feed.post", "app.bsky.graph.*"]);
        assert!(filter.matches_collection("app.bsky.feed.post"));
        assert!(!filter.matches_collection("app.bsky.feed.postgate"));
        assert!(filter.matches_collection("app.bsky.graph.follow"));
        assert!(!filter.matches_collection("app.bsky.graphic"));

        let everything = FirehoseFilter::new().collections(["*"]);
        assert!(everything.matches_collection("com.example.thing"));
        assert!(FirehoseFilter::new().matches_collection("anything"));
    }

    #[test]
    fn did_filter() {
        let filter = FirehoseFilter::new().dids(["did:plc:alice"]);
        assert!(filter.matches_did("did:plc:alice"));
        assert!(!filter.matches_did("did:plc:bob"));
        assert!(!filter.is_empty());
    }
}
