//! Greedy single-pass clustering of unmatched messages.
//!
//! Order-dependent and deterministic for a fixed input order: each message
//! joins the first cluster it shares enough tokens with, otherwise seeds a
//! new cluster. The seed message is the cluster's representative.

use std::collections::HashSet;

/// Tokens shorter than this are ignored.
const TOKEN_MIN: usize = 4;

/// Shared tokens required to join a cluster.
const JOIN_OVERLAP: usize = 2;

/// Messages with at most this many qualifying tokens join on one shared
/// token.
const SHORT_MESSAGE_TOKENS: usize = 3;

/// A cluster of related unmatched messages.
#[derive(Debug, Clone)]
pub struct MessageCluster {
    /// The message that seeded the cluster.
    pub representative: String,
    /// All member messages, in arrival order (includes the representative).
    pub members: Vec<String>,
    /// Union of the members' token sets.
    pub tokens: HashSet<String>,
}

impl MessageCluster {
    /// Tokens of the representative present in every member, in the
    /// representative's order.
    pub fn keywords(&self) -> Vec<String> {
        let member_tokens: Vec<HashSet<String>> =
            self.members.iter().map(|m| tokenize_set(m)).collect();
        let mut seen = HashSet::new();
        tokenize(&self.representative)
            .into_iter()
            .filter(|token| member_tokens.iter().all(|set| set.contains(token)))
            .filter(|token| seen.insert(token.clone()))
            .collect()
    }

    /// Heuristic route pattern: the keywords joined by `.*`.
    pub fn suggested_pattern(&self) -> String {
        self.keywords().join(".*")
    }
}

/// Lowercase tokens of length > 3, in order.
pub fn tokenize(message: &str) -> Vec<String> {
    message
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() >= TOKEN_MIN)
        .map(String::from)
        .collect()
}

fn tokenize_set(message: &str) -> HashSet<String> {
    tokenize(message).into_iter().collect()
}

/// Cluster messages greedily, in input order.
pub fn cluster_messages(messages: &[String]) -> Vec<MessageCluster> {
    let mut clusters: Vec<MessageCluster> = Vec::new();

    for message in messages {
        let tokens = tokenize_set(message);
        let needed = if tokens.len() <= SHORT_MESSAGE_TOKENS {
            1
        } else {
            JOIN_OVERLAP
        };

        let joined = clusters
            .iter()
            .position(|cluster| cluster.tokens.intersection(&tokens).count() >= needed);
        match joined {
            Some(index) => {
                let cluster = &mut clusters[index];
                cluster.members.push(message.clone());
                cluster.tokens.extend(tokens);
            }
            None => clusters.push(MessageCluster {
                representative: message.clone(),
                members: vec![message.clone()],
                tokens,
            }),
        }
    }
    clusters
}
