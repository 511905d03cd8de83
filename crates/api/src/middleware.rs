use axum::{
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::Response,
};

use stockledger_core::{ActorId, MerchantId};

use crate::context::{ActorContext, MerchantContext};

pub const MERCHANT_HEADER: &str = "x-merchant-id";
pub const USER_HEADER: &str = "x-user-id";

/// Require a merchant header and attach merchant/actor context to the request.
pub async fn merchant_middleware(
    mut req: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    let merchant_id = extract_merchant(req.headers())?;
    let actor_id = extract_actor(req.headers());

    req.extensions_mut().insert(MerchantContext::new(merchant_id));
    req.extensions_mut().insert(ActorContext::new(actor_id));

    Ok(next.run(req).await)
}

fn extract_merchant(headers: &HeaderMap) -> Result<MerchantId, StatusCode> {
    let header = headers
        .get(MERCHANT_HEADER)
        .ok_or(StatusCode::UNAUTHORIZED)?;

    let header = header.to_str().map_err(|_| StatusCode::UNAUTHORIZED)?;

    header
        .parse::<MerchantId>()
        .map_err(|_| StatusCode::UNAUTHORIZED)
}

/// Missing, blank, or `unknown` users are recorded as no actor.
fn extract_actor(headers: &HeaderMap) -> Option<ActorId> {
    headers
        .get(USER_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<ActorId>().ok())
        .filter(|a| a.as_str() != "unknown")
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn merchant_header_is_required_and_trimmed() {
        let mut headers = HeaderMap::new();
        assert_eq!(extract_merchant(&headers), Err(StatusCode::UNAUTHORIZED));

        headers.insert(MERCHANT_HEADER, HeaderValue::from_static("   "));
        assert_eq!(extract_merchant(&headers), Err(StatusCode::UNAUTHORIZED));

        headers.insert(MERCHANT_HEADER, HeaderValue::from_static(" m-1 "));
        assert_eq!(extract_merchant(&headers).unwrap().as_str(), "m-1");
    }

    #[test]
    fn unknown_user_is_no_actor() {
        let mut headers = HeaderMap::new();
        assert_eq!(extract_actor(&headers), None);
        headers.insert(USER_HEADER, HeaderValue::from_static("unknown"));
        assert_eq!(extract_actor(&headers), None);
        headers.insert(USER_HEADER, HeaderValue::from_static("u-7"));
        assert_eq!(extract_actor(&headers), Some(ActorId::new("u-7")));
    }
}
