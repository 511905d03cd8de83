//! Composite stock identity.

use serde::{Deserialize, Serialize};

use crate::id::{MerchantId, ProductId, StoreId, VariantId};

/// Composite identity scoping a balance to merchant/store/product/variant.
///
/// `store_id: None` is the merchant-wide (unscoped) balance and `variant_id: None`
/// the base product. Absence is a distinct value: it never matches an empty or
/// concrete id.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StockKey {
    pub merchant_id: MerchantId,
    pub store_id: Option<StoreId>,
    pub product_id: ProductId,
    pub variant_id: Option<VariantId>,
}

impl StockKey {
    pub fn new(
        merchant_id: MerchantId,
        store_id: Option<StoreId>,
        product_id: ProductId,
        variant_id: Option<VariantId>,
    ) -> Self {
        Self {
            merchant_id,
            store_id,
            product_id,
            variant_id,
        }
    }

    /// Deterministic lease name covering every component of the key.
    ///
    /// Optional parts are tagged (`v=`, `s=`) so a variant id can never alias a
    /// store id, and the unscoped key never shares a lease with a store-scoped one.
    pub fn lock_name(&self) -> String {
        let mut name = format!(
            "lock:inventory:{}:{}",
            self.merchant_id.as_str(),
            self.product_id.as_str()
        );
        if let Some(variant) = &self.variant_id {
            name.push_str(":v=");
            name.push_str(variant.as_str());
        }
        if let Some(store) = &self.store_id {
            name.push_str(":s=");
            name.push_str(store.as_str());
        }
        name
    }
}

impl core::fmt::Display for StockKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.merchant_id,
            self.store_id.as_ref().map(StoreId::as_str).unwrap_or("*"),
            self.product_id,
            self.variant_id.as_ref().map(VariantId::as_str).unwrap_or("*"),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(store: Option<&str>, variant: Option<&str>) -> StockKey {
        StockKey::new(
            MerchantId::new("m1"),
            store.map(StoreId::new),
            ProductId::new("p1"),
            variant.map(VariantId::new),
        )
    }

    #[test]
    fn lock_name_includes_every_component() {
        assert_eq!(key(None, None).lock_name(), "lock:inventory:m1:p1");
        assert_eq!(
            key(Some("s1"), Some("v1")).lock_name(),
            "lock:inventory:m1:p1:v=v1:s=s1"
        );
    }

    #[test]
    fn stores_never_share_a_lock() {
        assert_ne!(key(Some("s1"), None).lock_name(), key(Some("s2"), None).lock_name());
        assert_ne!(key(None, None).lock_name(), key(Some("s1"), None).lock_name());
    }

    #[test]
    fn variant_and_store_cannot_alias() {
        assert_ne!(key(Some("x"), None).lock_name(), key(None, Some("x")).lock_name());
    }

    #[test]
    fn unscoped_key_differs_from_empty_store() {
        assert_ne!(key(None, None), key(Some(""), None));
    }
}
