//! Coupon authentication for broker-facing calls.

use crate::auth::Coupon;
use crate::config::CouponEntry;
use async_trait::async_trait;
use std::collections::HashMap;
use tracing::warn;

/// Lookup of issued coupons. Backed by configuration here; a ticketing
/// service would implement the same trait.
#[async_trait]
pub trait CouponRegistry: Send + Sync {
    /// True when the coupon id exists and the passkey matches.
    async fn redeem(&self, coupon: &Coupon) -> bool;
}

/// Registry over the static coupon table in broker configuration.
pub struct ConfigCouponRegistry {
    passkeys: HashMap<i64, String>,
}

impl ConfigCouponRegistry {
    pub fn new(entries: &[CouponEntry]) -> Self {
        let passkeys = entries
            .iter()
            .map(|e| (e.coupon_id, e.passkey.clone()))
            .collect();
        Self { passkeys }
    }
}

#[async_trait]
impl CouponRegistry for ConfigCouponRegistry {
    async fn redeem(&self, coupon: &Coupon) -> bool {
        match self.passkeys.get(&coupon.coupon_id) {
            Some(passkey) if *passkey == coupon.passkey => true,
            Some(_) => {
                warn!(coupon_id = coupon.coupon_id, "coupon passkey mismatch");
                false
            }
            None => {
                warn!(coupon_id = coupon.coupon_id, "unknown coupon");
                false
            }
        }
    }
}
