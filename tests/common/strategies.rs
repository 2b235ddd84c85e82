use firehose_turbo::models::ReferenceKey;
use proptest::prelude::*;

/// Strategy for generating repository DIDs
pub fn did_strategy() -> impl Strategy<Value = String> {
    "did:plc:[a-z2-7]{24}"
}

/// Strategy for generating post AT-URIs
pub fn post_uri_strategy() -> impl Strategy<Value = String> {
    (did_strategy(), "[a-z0-9]{13}").prop_map(|(did, rkey)| format!("at://{did}/app.bsky.feed.post/{rkey}"))
}

/// Strategy for generating actor or post reference keys from a small pool,
/// so sequences revisit keys
pub fn reference_key_strategy() -> impl Strategy<Value = ReferenceKey> {
    prop_oneof![
        (0u8..32).prop_map(|n| ReferenceKey::actor(format!("did:plc:actor{n}"))),
        (0u8..32).prop_map(|n| ReferenceKey::post(format!("at://did:plc:a/app.bsky.feed.post/{n}"))),
    ]
}

/// Cache operations: `true` is a put, `false` a get
pub fn cache_ops_strategy() -> impl Strategy<Value = Vec<(bool, ReferenceKey)>> {
    prop::collection::vec((any::<bool>(), reference_key_strategy()), 1..200)
}
