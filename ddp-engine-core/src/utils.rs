//! Small shared helpers.

use rand::Rng;
use rand::distributions::Alphanumeric;

/// Length of generated identifiers (session ids, subscription handles,
/// unmatchable selector ids).
pub const ID_LEN: usize = 17;

/// A fresh random alphanumeric identifier.
///
/// Collision probability is negligible at this length; callers that need
/// a guaranteed-unmatchable id (selector rewrite) only rely on
/// non-collision with real document ids.
pub fn random_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(ID_LEN)
        .map(char::from)
        .collect()
}
