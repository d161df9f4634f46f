//! Property-based test generators using proptest.
//!
//! Provides strategies for generating objects, expiries and ban
//! expressions that a silo accepts.

use proptest::prelude::*;
use silo_core::{Expiry, NewObject, ObjectHash};

/// An owned object, so strategies can generate payloads.
#[derive(Debug, Clone, PartialEq)]
pub struct OwnedObject {
    /// Content hash.
    pub hash: ObjectHash,
    /// Expiry record.
    pub expiry: Expiry,
    /// Newest ban at creation.
    pub ban: Option<u64>,
    /// Payload bytes.
    pub payload: Vec<u8>,
}

impl OwnedObject {
    /// Borrows the object for [`silo_core::Silo::insert`].
    pub fn as_new(&self) -> NewObject<'_> {
        NewObject {
            hash: self.hash,
            expiry: self.expiry,
            ban: self.ban,
            payload: &self.payload,
        }
    }
}

/// Strategy for generating object hashes.
pub fn hash_strategy() -> impl Strategy<Value = ObjectHash> {
    prop::array::uniform32(any::<u8>())
}

/// Strategy for generating payloads of up to `max` bytes.
pub fn payload_strategy(max: usize) -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..=max)
}

/// Strategy for generating expiries that stay live for at least an hour.
pub fn live_expiry_strategy() -> impl Strategy<Value = Expiry> {
    (3600.0..86400.0f64, 0.0..600.0f64, 0.0..600.0f64)
        .prop_map(|(ttl, grace, keep)| Expiry::new(ttl, grace, keep))
}

/// Strategy for generating expiries that lapsed before now.
pub fn expired_expiry_strategy() -> impl Strategy<Value = Expiry> {
    (1.0..3600.0f64, 0.0..60.0f64).prop_map(|(ttl, grace)| Expiry {
        entered: silo_core::now() - 7200.0,
        ttl,
        grace,
        keep: 0.0,
    })
}

/// Strategy for generating live objects with payloads of up to `max` bytes.
pub fn object_strategy(max: usize) -> impl Strategy<Value = OwnedObject> {
    (hash_strategy(), live_expiry_strategy(), payload_strategy(max)).prop_map(
        |(hash, expiry, payload)| OwnedObject {
            hash,
            expiry,
            ban: None,
            payload,
        },
    )
}

/// Strategy for generating a batch of live objects.
pub fn object_batch_strategy(
    max_payload: usize,
    count: std::ops::Range<usize>,
) -> impl Strategy<Value = Vec<OwnedObject>> {
    prop::collection::vec(object_strategy(max_payload), count)
}

/// Strategy for generating ban expressions.
pub fn ban_spec_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::string::string_regex("(req\\.url|obj\\.http\\.[a-z]{1,8}) ~ [a-z/]{1,24}")
        .expect("Invalid regex")
        .prop_map(String::into_bytes)
}
