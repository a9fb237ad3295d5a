//! Pronounceable hostname allocation.
//!
//! The allocator is stateless; uniqueness is enforced by the registry at
//! insertion time, with the caller retrying on conflict.

use rand::seq::SliceRandom;
use rand::Rng;

/// Dot-prefixed domain appended to every generated hostname unless
/// overridden by `NGOPEN_HOSTNAME_SUFFIX`.
pub const DEFAULT_SUFFIX: &str = ".n.sbn.lol";

const ADJECTIVES: &[&str] = &[
    "red", "blue", "green", "amber", "happy", "swift", "clever", "brave", "kind", "wise", "calm",
    "bold", "quiet", "eager", "lucky", "merry", "noble", "proud", "rapid", "shiny", "sleek",
    "sunny", "vivid", "witty",
];

const NOUNS: &[&str] = &[
    "fox", "bear", "eagle", "wolf", "tiger", "lion", "hawk", "deer", "snake", "panda", "otter",
    "lynx", "crane", "finch", "gecko", "heron", "koala", "lemur", "moose", "raven", "seal",
    "stork", "trout", "zebra",
];

/// Returns `<adjective>-<noun>-<n><suffix>` with `n` in `[0, 10000)`.
pub fn generate(suffix: &str) -> String {
    let mut rng = rand::thread_rng();
    let adjective = ADJECTIVES.choose(&mut rng).unwrap();
    let noun = NOUNS.choose(&mut rng).unwrap();
    format!("{adjective}-{noun}-{}{suffix}", rng.gen_range(0..10_000))
}
