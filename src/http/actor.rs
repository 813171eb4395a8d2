use axum::{async_trait, extract::FromRequestParts, http::request::Parts};
use ulid::Ulid;

use crate::model::Actor;

use super::error::ApiError;

pub const ACTOR_ID_HEADER: &str = "x-actor-id";
pub const ACTOR_ROLE_HEADER: &str = "x-actor-role";

/// Caller identity, as asserted by the authenticating proxy in front of us.
///
/// `X-Actor-Id` is a ULID; `X-Actor-Role` is `consumer` or `provider`.
/// The system actor can never be claimed over HTTP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestActor(pub Actor);

impl RequestActor {
    pub fn consumer_id(&self) -> Result<Ulid, ApiError> {
        match self.0 {
            Actor::Consumer(id) => Ok(id),
            _ => Err(ApiError::forbidden("consumer only")),
        }
    }

    pub fn provider_id(&self) -> Result<Ulid, ApiError> {
        match self.0 {
            Actor::Provider(id) => Ok(id),
            _ => Err(ApiError::forbidden("provider only")),
        }
    }

    /// The consumer or provider on `consumer_id`/`provider_id`'s side.
    pub fn is_party(&self, consumer_id: Ulid, provider_id: Ulid) -> bool {
        match self.0 {
            Actor::Consumer(id) => id == consumer_id,
            Actor::Provider(id) => id == provider_id,
            Actor::System => false,
        }
    }
}

fn header<'a>(parts: &'a Parts, name: &str) -> Option<&'a str> {
    parts.headers.get(name).and_then(|v| v.to_str().ok()).map(str::trim)
}

#[async_trait]
impl<S> FromRequestParts<S> for RequestActor
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let id = header(parts, ACTOR_ID_HEADER)
            .and_then(|s| Ulid::from_string(s).ok())
            .ok_or_else(|| ApiError::forbidden("missing or invalid actor id"))?;
        match header(parts, ACTOR_ROLE_HEADER) {
            Some(role) if role.eq_ignore_ascii_case("consumer") => Ok(Self(Actor::Consumer(id))),
            Some(role) if role.eq_ignore_ascii_case("provider") => Ok(Self(Actor::Provider(id))),
            _ => Err(ApiError::forbidden("missing or invalid actor role")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{Request, StatusCode};

    async fn extract(headers: &[(&str, &str)]) -> Result<RequestActor, ApiError> {
        let mut builder = Request::builder().uri("/");
        for (k, v) in headers {
            builder = builder.header(*k, *v);
        }
        let (mut parts, ()) = builder.body(()).unwrap().into_parts();
        RequestActor::from_request_parts(&mut parts, &()).await
    }

    #[tokio::test]
    async fn parses_consumer_and_provider() {
        let id = Ulid::new();
        let raw = id.to_string();
        let a = extract(&[(ACTOR_ID_HEADER, raw.as_str()), (ACTOR_ROLE_HEADER, "consumer")])
            .await
            .unwrap();
        assert_eq!(a.0, Actor::Consumer(id));
        let p = extract(&[(ACTOR_ID_HEADER, raw.as_str()), (ACTOR_ROLE_HEADER, "Provider")])
            .await
            .unwrap();
        assert_eq!(p.provider_id().unwrap(), id);
        assert!(p.consumer_id().is_err());
    }

    #[tokio::test]
    async fn rejects_missing_or_bogus_headers() {
        let id = Ulid::new().to_string();
        for headers in [
            vec![],
            vec![(ACTOR_ID_HEADER, "not-a-ulid"), (ACTOR_ROLE_HEADER, "consumer")],
            vec![(ACTOR_ID_HEADER, id.as_str())],
            vec![(ACTOR_ID_HEADER, id.as_str()), (ACTOR_ROLE_HEADER, "system")],
        ] {
            let err = extract(&headers).await.unwrap_err();
            assert_eq!(err.status(), StatusCode::FORBIDDEN);
        }
    }
}
