//! Per-hop identity proofs.
//!
//! Two credential shapes exist: a coupon (client to broker) and an
//! identifier/passkey pair (broker to lab server, lab server back to broker).
//! Credentials are supplied per call and never persisted by the core; they
//! travel as an out-of-band header value alongside the XML body.

use serde::{Deserialize, Serialize};

/// Identifier/passkey pair used between broker and lab server.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthCredential {
    /// Caller identity (broker GUID or lab-server GUID).
    pub identifier: String,
    /// Shared secret for this hop.
    pub passkey: String,
}

impl AuthCredential {
    /// Convenience constructor.
    pub fn new(identifier: impl Into<String>, passkey: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            passkey: passkey.into(),
        }
    }
}

/// Client-facing coupon credential for broker-level authentication.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coupon {
    /// Coupon identifier.
    pub coupon_id: i64,
    /// Coupon passkey.
    pub passkey: String,
}

impl Coupon {
    /// Convenience constructor.
    pub fn new(coupon_id: i64, passkey: impl Into<String>) -> Self {
        Self {
            coupon_id,
            passkey: passkey.into(),
        }
    }
}
