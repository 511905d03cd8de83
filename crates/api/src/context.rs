use stockledger_core::{ActorId, MerchantId};

/// Merchant scope for a request.
///
/// Must be present for every inventory route; handlers never read the
/// merchant from the body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerchantContext {
    merchant_id: MerchantId,
}

impl MerchantContext {
    pub fn new(merchant_id: MerchantId) -> Self {
        Self { merchant_id }
    }

    pub fn merchant_id(&self) -> &MerchantId {
        &self.merchant_id
    }
}

/// Who is calling, when known.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ActorContext {
    actor_id: Option<ActorId>,
}

impl ActorContext {
    pub fn new(actor_id: Option<ActorId>) -> Self {
        Self { actor_id }
    }

    pub fn actor_id(&self) -> Option<&ActorId> {
        self.actor_id.as_ref()
    }
}
